//! Request authorization.
//!
//! [`AuthInterceptor`] wraps an outbound call: it attaches
//! `Authorization: Bearer <access token>`, refreshes ahead of time when the
//! stored token is about to expire, and turns a 401 into a coordinated
//! refresh. It never replays a request itself; it tells the caller whether
//! a retry with the new token makes sense.

pub mod coordinator;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::session::SessionManager;
use crate::token;

pub use coordinator::{RefreshCoordinator, RefreshOutcome, WaitTimedOut};

/// Default bound on the wrapped request.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default bound on waiting for a refresh.
const DEFAULT_REFRESH_WAIT_SECS: u64 = 30;

/// Refresh this many seconds before the access token actually expires.
const DEFAULT_EXPIRY_LEEWAY_SECS: i64 = 30;

/// Anything that can report an HTTP 401.
pub trait AuthStatus {
    fn is_unauthorized(&self) -> bool;
}

impl AuthStatus for reqwest::Response {
    fn is_unauthorized(&self) -> bool {
        self.status() == reqwest::StatusCode::UNAUTHORIZED
    }
}

impl AuthStatus for reqwest::StatusCode {
    fn is_unauthorized(&self) -> bool {
        *self == reqwest::StatusCode::UNAUTHORIZED
    }
}

/// What the caller should do with an intercepted request.
#[derive(Debug)]
pub enum Intercepted<R> {
    /// The request went through; here is its response.
    Completed(R),
    /// The request was rejected but tokens were refreshed. Retry if you want to.
    RetryWithNewToken,
    /// No usable credentials. The user has to sign in again.
    AuthenticationRequired,
}

impl<R> Intercepted<R> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Intercepted::Completed(_))
    }
}

#[derive(Error, Debug)]
pub enum InterceptError<E> {
    #[error("request failed: {0}")]
    Transport(E),

    #[error("request timed out")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct InterceptorSettings {
    pub request_timeout: Duration,
    pub refresh_wait_timeout: Duration,
    pub expiry_leeway_secs: i64,
}

impl Default for InterceptorSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            refresh_wait_timeout: Duration::from_secs(DEFAULT_REFRESH_WAIT_SECS),
            expiry_leeway_secs: DEFAULT_EXPIRY_LEEWAY_SECS,
        }
    }
}

impl InterceptorSettings {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_refresh_wait_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_wait_timeout = timeout;
        self
    }

    pub fn with_expiry_leeway(mut self, seconds: i64) -> Self {
        self.expiry_leeway_secs = seconds;
        self
    }
}

/// Clone is cheap; clones share the refresh coordinator.
#[derive(Clone)]
pub struct AuthInterceptor {
    session: SessionManager,
    coordinator: RefreshCoordinator,
    settings: InterceptorSettings,
}

impl AuthInterceptor {
    pub fn new(session: SessionManager) -> Self {
        Self::with_settings(session, InterceptorSettings::default())
    }

    pub fn with_settings(session: SessionManager, settings: InterceptorSettings) -> Self {
        let coordinator = RefreshCoordinator::new(session.clone())
            .with_wait_timeout(settings.refresh_wait_timeout);
        Self {
            session,
            coordinator,
            settings,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Header value for the next request, refreshing first if the stored
    /// access token is expired or about to be. `None` means there are no
    /// usable credentials.
    pub async fn authorization_header(&self) -> Option<String> {
        let pair = self.session.tokens().await?;
        if !token::is_expiring(
            &pair.access_token,
            self.settings.expiry_leeway_secs,
            token::now_unix(),
        ) {
            return Some(pair.authorization());
        }

        debug!("Access token is expiring, refreshing before the request");
        if let Ok(RefreshOutcome::Refreshed) = self.coordinator.recover().await {
            if let Some(fresh) = self.session.tokens().await {
                return Some(fresh.authorization());
            }
        }

        // Refresh failed; the old token is still usable if only the leeway ran out.
        let pair = self.session.tokens().await?;
        if token::is_expiring(&pair.access_token, 0, token::now_unix()) {
            None
        } else {
            Some(pair.authorization())
        }
    }

    /// Run `send` with an `Authorization` header and handle a 401.
    ///
    /// `send` receives the full header value (`Bearer <token>`).
    pub async fn execute<F, Fut, R, E>(&self, send: F) -> Result<Intercepted<R>, InterceptError<E>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: AuthStatus,
    {
        let Some(header) = self.authorization_header().await else {
            debug!("No usable credentials for request");
            return Ok(Intercepted::AuthenticationRequired);
        };

        let response = tokio::time::timeout(self.settings.request_timeout, send(header.clone()))
            .await
            .map_err(|_| InterceptError::Timeout)?
            .map_err(InterceptError::Transport)?;

        if !response.is_unauthorized() {
            return Ok(Intercepted::Completed(response));
        }

        // Someone else may have refreshed while this request was in flight.
        if let Some(current) = self.session.tokens().await {
            if current.authorization() != header {
                debug!("Tokens changed while the request was in flight");
                return Ok(Intercepted::RetryWithNewToken);
            }
        }

        debug!("Request rejected with 401, coordinating refresh");
        match self.coordinator.recover().await {
            Ok(RefreshOutcome::Refreshed) => Ok(Intercepted::RetryWithNewToken),
            Ok(RefreshOutcome::Failed) => Ok(Intercepted::AuthenticationRequired),
            Err(WaitTimedOut) => Err(InterceptError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::Role;
    use crate::provider::MockCredentialProvider;
    use crate::store::MemoryTokenStore;
    use crate::token::TokenCodec;

    #[derive(Debug)]
    struct Status(u16);

    impl AuthStatus for Status {
        fn is_unauthorized(&self) -> bool {
            self.0 == 401
        }
    }

    async fn signed_in() -> AuthInterceptor {
        let provider = Arc::new(MockCredentialProvider::new(TokenCodec::new("s")));
        provider.add_account("client@x", "pw", Role::Client, "5551234567", None);
        let session = SessionManager::new(provider, Arc::new(MemoryTokenStore::new()));
        session.login("client@x", "pw").await.unwrap();
        AuthInterceptor::new(session)
    }

    #[tokio::test]
    async fn test_completed_request_sees_bearer_header() {
        let interceptor = signed_in().await;
        let expected = interceptor.session().tokens().await.unwrap().access_token;

        let result = interceptor
            .execute(|header| async move {
                assert_eq!(header, format!("Bearer {}", expected));
                Ok::<_, std::io::Error>(Status(200))
            })
            .await
            .unwrap();
        assert!(result.is_completed());
    }

    #[tokio::test]
    async fn test_no_credentials_requires_authentication() {
        let provider = Arc::new(MockCredentialProvider::new(TokenCodec::new("s")));
        let session = SessionManager::new(provider, Arc::new(MemoryTokenStore::new()));
        let interceptor = AuthInterceptor::new(session);

        let result = interceptor
            .execute(|_| async { Ok::<_, std::io::Error>(Status(200)) })
            .await
            .unwrap();
        assert!(matches!(result, Intercepted::AuthenticationRequired));
    }

    #[tokio::test]
    async fn test_transport_error_is_returned() {
        let interceptor = signed_in().await;
        let result = interceptor
            .execute(|_| async { Err::<Status, _>(std::io::Error::other("connection reset")) })
            .await;
        assert!(matches!(result, Err(InterceptError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_request_times_out() {
        let interceptor = signed_in().await;
        let interceptor = AuthInterceptor::with_settings(
            interceptor.session().clone(),
            InterceptorSettings::default().with_request_timeout(Duration::from_secs(1)),
        );
        let result = interceptor
            .execute(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, std::io::Error>(Status(200))
            })
            .await;
        assert!(matches!(result, Err(InterceptError::Timeout)));
    }

    #[test]
    fn test_status_code_auth_status() {
        assert!(reqwest::StatusCode::UNAUTHORIZED.is_unauthorized());
        assert!(!reqwest::StatusCode::FORBIDDEN.is_unauthorized());
    }
}
