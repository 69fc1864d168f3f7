//! Durable storage for the current token pair and the cached principal.
//!
//! A token pair is always written as one unit: a concurrent `load` never
//! sees an access token from one pair next to a refresh token from another.
//! The profile lives in a separate entry but is committed and cleared
//! together with the pair through [`TokenStore::commit`] and
//! [`TokenStore::clear_all`].

pub mod file;
pub mod keychain;
pub mod memory;

use async_trait::async_trait;
use tracing::warn;

use crate::error::StoreError;
use crate::models::{Principal, TokenPair};

pub use file::FileTokenStore;
pub use keychain::KeyringTokenStore;
pub use memory::MemoryTokenStore;

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save(&self, pair: &TokenPair) -> Result<(), StoreError>;

    async fn load(&self) -> Result<Option<TokenPair>, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    async fn save_profile(&self, profile: &Principal) -> Result<(), StoreError>;

    async fn load_profile(&self) -> Result<Option<Principal>, StoreError>;

    async fn clear_profile(&self) -> Result<(), StoreError>;

    /// Persist a pair and its profile as one logical unit.
    ///
    /// If the profile cannot be written the pair is removed again, so the
    /// store never holds tokens without the profile they were issued with.
    async fn commit(&self, pair: &TokenPair, profile: &Principal) -> Result<(), StoreError> {
        self.save(pair).await?;
        if let Err(e) = self.save_profile(profile).await {
            if let Err(rollback) = self.clear().await {
                warn!(error = %rollback, "Failed to roll back token pair after profile write failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove the pair and the profile. Both are attempted even if one fails.
    async fn clear_all(&self) -> Result<(), StoreError> {
        let tokens = self.clear().await;
        let profile = self.clear_profile().await;
        tokens.and(profile)
    }
}
