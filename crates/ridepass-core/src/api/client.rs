use std::time::Duration;

use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::interceptor::{AuthInterceptor, InterceptError, Intercepted};

/// Default HTTP timeout for the underlying client.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
/// Doubles on each retry: 1s, 2s, 4s.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// JSON API client whose requests carry the session's bearer token.
///
/// A request rejected with 401 is replayed once after the session
/// refreshes; a second rejection is reported as [`ApiError::Unauthorized`].
#[derive(Clone)]
pub struct AuthorizedClient {
    client: Client,
    base_url: String,
    interceptor: AuthInterceptor,
    initial_backoff: Duration,
}

impl AuthorizedClient {
    pub fn new(base_url: impl Into<String>, interceptor: AuthInterceptor) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self::with_client(client, base_url, interceptor))
    }

    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        interceptor: AuthInterceptor,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            interceptor,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn interceptor(&self) -> &AuthInterceptor {
        &self.interceptor
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)?;
        self.request(Method::POST, path, Some(&body)).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff = self.initial_backoff;
        let mut replayed = false;

        loop {
            let outcome = self
                .interceptor
                .execute(|authorization| {
                    let request = self
                        .client
                        .request(method.clone(), &url)
                        .header(header::AUTHORIZATION, authorization);
                    let request = match body {
                        Some(body) => request.json(body),
                        None => request,
                    };
                    request.send()
                })
                .await;

            let response = match outcome {
                Ok(Intercepted::Completed(response)) => response,
                Ok(Intercepted::RetryWithNewToken) if !replayed => {
                    debug!(url = %url, "Replaying request with refreshed token");
                    replayed = true;
                    continue;
                }
                Ok(Intercepted::RetryWithNewToken) => return Err(ApiError::Unauthorized),
                Ok(Intercepted::AuthenticationRequired) => {
                    return Err(ApiError::AuthenticationRequired)
                }
                Err(InterceptError::Transport(e)) => return Err(ApiError::NetworkError(e)),
                Err(InterceptError::Timeout) => return Err(ApiError::Timeout),
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json()
                    .await
                    .map_err(|e| ApiError::InvalidResponse(e.to_string()));
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited);
                }
                warn!(url = %url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }
    }
}
