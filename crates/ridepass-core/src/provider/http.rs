//! Credential provider backed by a REST authentication service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::{AuthResponse, CredentialProvider, LoginRequest, RefreshRequest, RegisterRequest};
use crate::error::ProviderError;
use crate::models::Registration;

/// Default HTTP timeout.
/// 30s allows for slow responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl HttpProviderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Debug, Clone)]
pub struct HttpCredentialProvider {
    client: Client,
    base_url: String,
}

impl HttpCredentialProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self::with_client(client, &config.base_url))
    }

    /// Reuse an existing client (and its connection pool).
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/auth/{}", self.base_url, path)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let response = self.send(path, body).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }

    async fn send<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = self.url(path);
        debug!(url = %url, "Sending credential provider request");
        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(url = %url, status = %status, "Credential provider returned an error");
        Err(error_from_status(status, &body))
    }
}

/// Truncate a response body to avoid logging excessive data
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

/// Client errors mean the server looked at the request and said no; server
/// errors and throttling are treated as the provider being unavailable.
fn error_from_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = format!("{}: {}", status, truncate_body(body));
    match status.as_u16() {
        408 | 429 | 500..=599 => ProviderError::Network(detail),
        400..=499 => ProviderError::Rejected(detail),
        _ => ProviderError::InvalidResponse(detail),
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ProviderError> {
        self.post("login", &LoginRequest { email, password }).await
    }

    async fn register(
        &self,
        registration: &Registration,
        password: &str,
    ) -> Result<AuthResponse, ProviderError> {
        self.post(
            "register",
            &RegisterRequest {
                profile: registration,
                password,
            },
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, ProviderError> {
        self.post("refresh", &RefreshRequest { refresh_token }).await
    }

    async fn logout(&self, refresh_token: &str) -> Result<(), ProviderError> {
        self.send("logout", &RefreshRequest { refresh_token })
            .await
            .map(|_| ())
    }
}
