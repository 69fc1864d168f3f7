//! The backend that authenticates users and issues or rotates tokens.
//!
//! Only the request/response shape is fixed here. [`HttpCredentialProvider`]
//! talks to a real server; [`MockCredentialProvider`] stands in for one
//! during development and in tests.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::models::{Principal, Registration, TokenPair};

pub use http::{HttpCredentialProvider, HttpProviderConfig};
pub use mock::{MockCredentialProvider, MockSettings};

/// Body of every successful login, register or refresh response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub principal: Principal,
}

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct RegisterRequest<'a> {
    #[serde(flatten)]
    pub profile: &'a Registration,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `POST /auth/login`
    async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ProviderError>;

    /// `POST /auth/register`
    async fn register(
        &self,
        registration: &Registration,
        password: &str,
    ) -> Result<AuthResponse, ProviderError>;

    /// `POST /auth/refresh`
    async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, ProviderError>;

    /// `POST /auth/logout`. Best effort: callers clear local state regardless.
    async fn logout(&self, refresh_token: &str) -> Result<(), ProviderError>;
}
