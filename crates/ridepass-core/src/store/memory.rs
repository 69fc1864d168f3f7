use async_trait::async_trait;
use tokio::sync::RwLock;

use super::TokenStore;
use crate::error::StoreError;
use crate::models::{Principal, TokenPair};

/// In-process store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    pair: RwLock<Option<TokenPair>>,
    profile: RwLock<Option<Principal>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn save(&self, pair: &TokenPair) -> Result<(), StoreError> {
        *self.pair.write().await = Some(pair.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<TokenPair>, StoreError> {
        Ok(self.pair.read().await.clone())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.pair.write().await = None;
        Ok(())
    }

    async fn save_profile(&self, profile: &Principal) -> Result<(), StoreError> {
        *self.profile.write().await = Some(profile.clone());
        Ok(())
    }

    async fn load_profile(&self) -> Result<Option<Principal>, StoreError> {
        Ok(self.profile.read().await.clone())
    }

    async fn clear_profile(&self) -> Result<(), StoreError> {
        *self.profile.write().await = None;
        Ok(())
    }
}
