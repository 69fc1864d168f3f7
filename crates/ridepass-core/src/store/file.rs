//! JSON file store with optional at-rest encryption.
//!
//! Layout under the store directory:
//! - `tokens.json`: the token pair, one file so it is replaced atomically
//! - `profile.json`: the cached principal
//! - `salt`: key-derivation salt, only for encrypted stores
//!
//! Writes go to a temporary file that is renamed over the target, so a
//! reader sees either the old pair or the new one and nothing in between.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use argon2::Argon2;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use super::TokenStore;
use crate::error::StoreError;
use crate::models::{Principal, TokenPair};

const TOKENS_FILE: &str = "tokens.json";
const PROFILE_FILE: &str = "profile.json";
const SALT_FILE: &str = "salt";

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Encrypted file contents.
#[derive(Serialize, Deserialize)]
struct Sealed {
    nonce: String,
    ciphertext: String,
}

pub struct FileTokenStore {
    dir: PathBuf,
    cipher: Option<ChaCha20Poly1305>,
}

impl fmt::Debug for FileTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTokenStore")
            .field("dir", &self.dir)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

impl FileTokenStore {
    /// Plain JSON files under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cipher: None,
        }
    }

    /// Files under `dir` encrypted with a key derived from `passphrase`.
    ///
    /// The salt is created on first use and reused afterwards, so the same
    /// passphrase opens the same store across restarts.
    pub async fn encrypted(dir: impl Into<PathBuf>, passphrase: &str) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let salt_path = dir.join(SALT_FILE);
        let salt = match tokio::fs::read(&salt_path).await {
            Ok(salt) if salt.len() == SALT_LEN => salt,
            Ok(_) => {
                return Err(StoreError::Crypto(format!(
                    "salt file {} is corrupt",
                    salt_path.display()
                )))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let mut salt = vec![0u8; SALT_LEN];
                rand::thread_rng().fill_bytes(&mut salt);
                write_atomic(&salt_path, &salt).await?;
                debug!(path = %salt_path.display(), "Created token store salt");
                salt
            }
            Err(e) => return Err(e.into()),
        };

        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;

        Ok(Self {
            dir,
            cipher: Some(ChaCha20Poly1305::new(Key::from_slice(&key))),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    async fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec_pretty(value)?;
        let bytes = self.seal(&plaintext)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        write_atomic(&self.dir.join(name), &bytes).await
    }

    async fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let bytes = match tokio::fs::read(self.dir.join(name)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let plaintext = self.open(&bytes)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.dir.join(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_vec());
        };
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        let sealed = Sealed {
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        };
        Ok(serde_json::to_vec(&sealed)?)
    }

    fn open(&self, bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
        let Some(cipher) = &self.cipher else {
            return Ok(bytes.to_vec());
        };
        let sealed: Sealed = serde_json::from_slice(bytes)?;
        let nonce = STANDARD
            .decode(&sealed.nonce)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        if nonce.len() != NONCE_LEN {
            return Err(StoreError::Crypto("invalid nonce length".to_string()));
        }
        let ciphertext = STANDARD
            .decode(&sealed.ciphertext)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| StoreError::Crypto("wrong passphrase or tampered data".to_string()))
    }
}

/// Write to a uniquely named sibling, then rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("store");
    let tmp = path.with_file_name(format!(".{}.{:08x}.tmp", file_name, rand::random::<u32>()));
    tokio::fs::write(&tmp, bytes).await?;
    restrict_permissions(&tmp).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn save(&self, pair: &TokenPair) -> Result<(), StoreError> {
        self.write(TOKENS_FILE, pair).await
    }

    async fn load(&self) -> Result<Option<TokenPair>, StoreError> {
        self.read(TOKENS_FILE).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.remove(TOKENS_FILE).await
    }

    async fn save_profile(&self, profile: &Principal) -> Result<(), StoreError> {
        self.write(PROFILE_FILE, profile).await
    }

    async fn load_profile(&self) -> Result<Option<Principal>, StoreError> {
        self.read(PROFILE_FILE).await
    }

    async fn clear_profile(&self) -> Result<(), StoreError> {
        self.remove(PROFILE_FILE).await
    }
}
