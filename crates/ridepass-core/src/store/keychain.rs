//! OS keychain store.
//!
//! The token pair is one keychain entry holding both tokens, which makes a
//! save a single atomic write. The profile is a second entry.

use async_trait::async_trait;
use keyring::Entry;
use serde::{de::DeserializeOwned, Serialize};

use super::TokenStore;
use crate::error::StoreError;
use crate::models::{Principal, TokenPair};

pub const DEFAULT_SERVICE_NAME: &str = "ridepass";

const TOKENS_ACCOUNT: &str = "session-tokens";
const PROFILE_ACCOUNT: &str = "session-profile";

#[derive(Debug, Clone)]
pub struct KeyringTokenStore {
    service: String,
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

impl KeyringTokenStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    async fn put<T: Serialize>(&self, account: &'static str, value: &T) -> Result<(), StoreError> {
        let secret = encode_entry(value)?;
        let service = self.service.clone();
        blocking(move || {
            Entry::new(&service, account)?.set_password(&secret)?;
            Ok(())
        })
        .await
    }

    async fn get<T: DeserializeOwned>(&self, account: &'static str) -> Result<Option<T>, StoreError> {
        let service = self.service.clone();
        let secret = blocking(move || Ok(Entry::new(&service, account)?.get_password())).await?;
        decode_entry(secret)
    }

    async fn delete(&self, account: &'static str) -> Result<(), StoreError> {
        let service = self.service.clone();
        blocking(move || ignore_missing(Entry::new(&service, account)?.delete_credential())).await
    }
}

fn encode_entry<T: Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

/// A missing entry is an empty slot, not an error.
fn decode_entry<T: DeserializeOwned>(
    secret: Result<String, keyring::Error>,
) -> Result<Option<T>, StoreError> {
    match secret {
        Ok(secret) => Ok(Some(serde_json::from_str(&secret)?)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn ignore_missing(deleted: Result<(), keyring::Error>) -> Result<(), StoreError> {
    match deleted {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Keychain calls may block on a platform daemon; keep them off the runtime.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

#[async_trait]
impl TokenStore for KeyringTokenStore {
    async fn save(&self, pair: &TokenPair) -> Result<(), StoreError> {
        self.put(TOKENS_ACCOUNT, pair).await
    }

    async fn load(&self) -> Result<Option<TokenPair>, StoreError> {
        self.get(TOKENS_ACCOUNT).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.delete(TOKENS_ACCOUNT).await
    }

    async fn save_profile(&self, profile: &Principal) -> Result<(), StoreError> {
        self.put(PROFILE_ACCOUNT, profile).await
    }

    async fn load_profile(&self) -> Result<Option<Principal>, StoreError> {
        self.get(PROFILE_ACCOUNT).await
    }

    async fn clear_profile(&self) -> Result<(), StoreError> {
        self.delete(PROFILE_ACCOUNT).await
    }
}
