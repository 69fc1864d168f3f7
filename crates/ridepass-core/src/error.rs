//! Error taxonomy shared across the session subsystem.
//!
//! Token errors are local and recoverable: callers above the codec treat
//! them as "no valid token" and fall through to the refresh path. Storage
//! and provider errors are surfaced to whoever drove the operation.

use thiserror::Error;

/// Failures produced by the token codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Format(String),

    #[error("token signature does not match")]
    Signature,

    #[error("token expired at {expired_at}")]
    Expired { expired_at: i64 },

    #[error("expected a {expected} token, got {actual}")]
    WrongKind { expected: String, actual: String },

    #[error("access lifetime ({access}s) exceeds refresh lifetime ({refresh}s)")]
    InvalidLifetime { access: i64, refresh: i64 },

    #[error("failed to encode token: {0}")]
    Encode(String),
}

/// Persistence layer failures (`STORAGE_ERROR`).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored data is unreadable: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("keychain access failed: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("stored data could not be decrypted: {0}")]
    Crypto(String),
}

/// Credential provider failures.
///
/// `Network` and `Timeout` are transient (`NETWORK_ERROR`); `Rejected` means
/// the server actively refused the credentials or refresh token
/// (`AUTH_REJECTED`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("credential provider unreachable: {0}")]
    Network(String),

    #[error("credential provider rejected the request: {0}")]
    Rejected(String),

    #[error("credential provider timed out")]
    Timeout,

    #[error("invalid response from credential provider: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether the failure may go away on its own (offline, slow server).
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Network(_) | ProviderError::Timeout)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// Errors returned to callers of login and registration.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("issued token is invalid: {0}")]
    Token(#[from] TokenError),

    #[error("{0}")]
    InvalidInput(String),
}
