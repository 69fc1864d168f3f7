//! In-process stand-in for the authentication backend.
//!
//! Issues real signed tokens through [`TokenCodec`], so everything above it
//! (verification, expiry, refresh) behaves as it would against a server.
//! Failure injection and call counters make it the workhorse of the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{AuthResponse, CredentialProvider};
use crate::error::ProviderError;
use crate::models::{Principal, Registration, Role};
use crate::token::{self, TokenCodec, TokenKind};

/// Access tokens live 15 minutes by default.
const DEFAULT_ACCESS_TTL_SECS: i64 = 15 * 60;

/// Refresh tokens live 30 days by default.
const DEFAULT_REFRESH_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Password shared by the seeded demo accounts.
pub const DEMO_PASSWORD: &str = "ridepass-demo";

#[derive(Debug, Clone)]
pub struct MockSettings {
    pub access_ttl: i64,
    pub refresh_ttl: i64,
    /// Invalidate each refresh token once it has been exchanged.
    pub rotate_refresh_tokens: bool,
    /// Artificial delay before every response.
    pub latency: Duration,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            access_ttl: DEFAULT_ACCESS_TTL_SECS,
            refresh_ttl: DEFAULT_REFRESH_TTL_SECS,
            rotate_refresh_tokens: true,
            latency: Duration::ZERO,
        }
    }
}

impl MockSettings {
    pub fn with_access_ttl(mut self, seconds: i64) -> Self {
        self.access_ttl = seconds;
        self
    }

    pub fn with_refresh_ttl(mut self, seconds: i64) -> Self {
        self.refresh_ttl = seconds;
        self
    }

    pub fn with_rotation(mut self, rotate: bool) -> Self {
        self.rotate_refresh_tokens = rotate;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

struct Account {
    password: String,
    principal: Principal,
}

#[derive(Default)]
struct MockState {
    accounts: HashMap<String, Account>,
    /// Spent refresh tokens and when each would have expired.
    consumed_refresh_tokens: HashMap<String, i64>,
    next_user_number: u32,
}

impl MockState {
    fn insert_account(
        &mut self,
        email: &str,
        password: &str,
        role: Role,
        phone: &str,
        name: Option<&str>,
    ) -> Principal {
        self.next_user_number += 1;
        let principal = Principal {
            user_id: format!("{}-{:04}", role, self.next_user_number),
            email: email.to_string(),
            role,
            phone: phone.to_string(),
            name: name.map(str::to_string),
        };
        self.accounts.insert(
            email.to_lowercase(),
            Account {
                password: password.to_string(),
                principal: principal.clone(),
            },
        );
        principal
    }

    /// Expired tokens fail verification on their own, so they are forgotten.
    fn consume(&mut self, refresh_token: &str, expires_at: i64, now: i64) {
        self.consumed_refresh_tokens
            .retain(|_, until| *until > now);
        if expires_at > now {
            self.consumed_refresh_tokens
                .insert(refresh_token.to_string(), expires_at);
        }
    }
}

#[derive(Default)]
struct CallCounts {
    login: AtomicUsize,
    register: AtomicUsize,
    refresh: AtomicUsize,
    logout: AtomicUsize,
}

pub struct MockCredentialProvider {
    codec: TokenCodec,
    settings: MockSettings,
    state: Mutex<MockState>,
    offline: AtomicBool,
    reject_refresh: AtomicBool,
    calls: CallCounts,
}

impl MockCredentialProvider {
    pub fn new(codec: TokenCodec) -> Self {
        Self::with_settings(codec, MockSettings::default())
    }

    pub fn with_settings(codec: TokenCodec, settings: MockSettings) -> Self {
        Self {
            codec,
            settings,
            state: Mutex::new(MockState::default()),
            offline: AtomicBool::new(false),
            reject_refresh: AtomicBool::new(false),
            calls: CallCounts::default(),
        }
    }

    /// Seed one rider and one driver account, both using [`DEMO_PASSWORD`].
    pub fn with_demo_accounts(self) -> Self {
        self.add_account(
            "rider@ridepass.dev",
            DEMO_PASSWORD,
            Role::Client,
            "5550100001",
            Some("Riley Rider"),
        );
        self.add_account(
            "driver@ridepass.dev",
            DEMO_PASSWORD,
            Role::Driver,
            "5550100002",
            Some("Dana Driver"),
        );
        self
    }

    pub fn add_account(
        &self,
        email: &str,
        password: &str,
        role: Role,
        phone: &str,
        name: Option<&str>,
    ) -> Principal {
        self.state
            .lock()
            .insert_account(email, password, role, phone, name)
    }

    /// Simulate the server being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make every refresh fail as if the refresh token had been revoked.
    pub fn set_reject_refresh(&self, reject: bool) {
        self.reject_refresh.store(reject, Ordering::SeqCst);
    }

    pub fn login_calls(&self) -> usize {
        self.calls.login.load(Ordering::SeqCst)
    }

    pub fn register_calls(&self) -> usize {
        self.calls.register.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.calls.refresh.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.calls.logout.load(Ordering::SeqCst)
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Count the call, wait out the configured latency, then check reachability.
    async fn arrive(&self, counter: &AtomicUsize) -> Result<(), ProviderError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if !self.settings.latency.is_zero() {
            tokio::time::sleep(self.settings.latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::Network("mock provider is offline".to_string()));
        }
        Ok(())
    }

    fn issue(&self, principal: Principal) -> Result<AuthResponse, ProviderError> {
        let tokens = self
            .codec
            .issue_pair(&principal, self.settings.access_ttl, self.settings.refresh_ttl)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(AuthResponse { tokens, principal })
    }
}

#[async_trait]
impl CredentialProvider for MockCredentialProvider {
    async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ProviderError> {
        self.arrive(&self.calls.login).await?;
        let principal = {
            let state = self.state.lock();
            match state.accounts.get(&email.to_lowercase()) {
                Some(account) if account.password == password => account.principal.clone(),
                _ => {
                    return Err(ProviderError::Rejected(
                        "invalid email or password".to_string(),
                    ))
                }
            }
        };
        debug!(user_id = %principal.user_id, "Mock login accepted");
        self.issue(principal)
    }

    async fn register(
        &self,
        registration: &Registration,
        password: &str,
    ) -> Result<AuthResponse, ProviderError> {
        self.arrive(&self.calls.register).await?;
        registration.validate().map_err(ProviderError::Rejected)?;
        if password.is_empty() {
            return Err(ProviderError::Rejected("password is required".to_string()));
        }
        let principal = {
            let mut state = self.state.lock();
            if state
                .accounts
                .contains_key(&registration.email.to_lowercase())
            {
                return Err(ProviderError::Rejected(format!(
                    "an account for {} already exists",
                    registration.email
                )));
            }
            state.insert_account(
                &registration.email,
                password,
                registration.role,
                &registration.phone,
                registration.name.as_deref(),
            )
        };
        self.issue(principal)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, ProviderError> {
        self.arrive(&self.calls.refresh).await?;
        if self.reject_refresh.load(Ordering::SeqCst) {
            return Err(ProviderError::Rejected("refresh token revoked".to_string()));
        }
        let claims = self
            .codec
            .verify_kind(refresh_token, TokenKind::Refresh)
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;

        let principal = {
            let mut state = self.state.lock();
            if state.consumed_refresh_tokens.contains_key(refresh_token) {
                return Err(ProviderError::Rejected(
                    "refresh token has already been used".to_string(),
                ));
            }
            if self.settings.rotate_refresh_tokens {
                state.consume(refresh_token, claims.expires_at, token::now_unix());
            }
            // Prefer the account's current profile over the token's copy.
            state
                .accounts
                .get(&claims.email.to_lowercase())
                .map(|account| account.principal.clone())
                .unwrap_or_else(|| claims.principal())
        };
        debug!(user_id = %principal.user_id, "Mock refresh issued a new pair");
        self.issue(principal)
    }

    async fn logout(&self, refresh_token: &str) -> Result<(), ProviderError> {
        self.arrive(&self.calls.logout).await?;
        // An unreadable token was never valid, so there is nothing to revoke.
        if let Some(claims) = token::decode(refresh_token) {
            self.state
                .lock()
                .consume(refresh_token, claims.expires_at, token::now_unix());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> MockCredentialProvider {
        let provider = MockCredentialProvider::new(TokenCodec::new("mock-secret"));
        provider.add_account("client@x", "pw", Role::Client, "5551234567", None);
        provider
    }

    #[tokio::test]
    async fn test_login_issues_verifiable_pair() {
        let provider = provider();
        let resp = provider.login("Client@X", "pw").await.unwrap();
        assert_eq!(resp.principal.role, Role::Client);

        let claims = provider.codec().verify(&resp.tokens.access_token).unwrap();
        assert_eq!(claims.email, "client@x");
        assert_eq!(claims.token_kind, TokenKind::Access);
        assert_eq!(provider.login_calls(), 1);
    }

    #[tokio::test]
    async fn test_login_with_wrong_password_is_rejected() {
        let provider = provider();
        assert!(matches!(
            provider.login("client@x", "nope").await,
            Err(ProviderError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let provider = provider();
        let registration = Registration {
            email: "new.driver@x".into(),
            phone: "5559876543".into(),
            role: Role::Driver,
            name: Some("Nico".into()),
        };
        let resp = provider.register(&registration, "secret").await.unwrap();
        assert_eq!(resp.principal.role, Role::Driver);
        assert!(resp.principal.user_id.starts_with("driver-"));

        assert!(provider.login("new.driver@x", "secret").await.is_ok());
        assert!(matches!(
            provider.register(&registration, "secret").await,
            Err(ProviderError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_cannot_be_reused() {
        let provider = provider();
        let login = provider.login("client@x", "pw").await.unwrap();

        let first = provider.refresh(&login.tokens.refresh_token).await.unwrap();
        assert_ne!(first.tokens.refresh_token, login.tokens.refresh_token);

        assert!(matches!(
            provider.refresh(&login.tokens.refresh_token).await,
            Err(ProviderError::Rejected(_))
        ));
        assert!(provider.refresh(&first.tokens.refresh_token).await.is_ok());
        assert_eq!(provider.refresh_calls(), 3);
    }

    #[tokio::test]
    async fn test_access_token_is_not_a_refresh_token() {
        let provider = provider();
        let login = provider.login("client@x", "pw").await.unwrap();
        assert!(matches!(
            provider.refresh(&login.tokens.access_token).await,
            Err(ProviderError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_reports_network_error() {
        let provider = provider();
        let login = provider.login("client@x", "pw").await.unwrap();
        provider.set_offline(true);
        assert!(matches!(
            provider.refresh(&login.tokens.refresh_token).await,
            Err(ProviderError::Network(_))
        ));
        // The token was never consumed, so it still works once back online.
        provider.set_offline(false);
        assert!(provider.refresh(&login.tokens.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_logout_revokes_refresh_token() {
        let provider = provider();
        let login = provider.login("client@x", "pw").await.unwrap();
        provider.logout(&login.tokens.refresh_token).await.unwrap();
        assert!(provider.refresh(&login.tokens.refresh_token).await.is_err());
        assert_eq!(provider.logout_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_for_one_email_admit_one() {
        let provider = std::sync::Arc::new(MockCredentialProvider::with_settings(
            TokenCodec::new("mock-secret"),
            MockSettings::default().with_latency(Duration::from_millis(20)),
        ));
        let attempts = (0..8).map(|i| {
            let provider = std::sync::Arc::clone(&provider);
            tokio::spawn(async move {
                let registration = Registration {
                    email: "Same.Rider@x".into(),
                    phone: format!("555000{:04}", i),
                    role: Role::Client,
                    name: None,
                };
                provider.register(&registration, "pw").await
            })
        });
        let results = futures::future::join_all(attempts).await;

        let admitted = results
            .into_iter()
            .filter(|result| matches!(result, Ok(Ok(_))))
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(provider.state.lock().accounts.len(), 1);
    }

    #[tokio::test]
    async fn test_spent_refresh_tokens_are_forgotten_once_expired() {
        let provider = provider();
        provider
            .state
            .lock()
            .consumed_refresh_tokens
            .insert("long-gone".into(), token::now_unix() - 1);

        let login = provider.login("client@x", "pw").await.unwrap();
        provider.refresh(&login.tokens.refresh_token).await.unwrap();

        let state = provider.state.lock();
        assert!(!state.consumed_refresh_tokens.contains_key("long-gone"));
        assert!(state
            .consumed_refresh_tokens
            .contains_key(&login.tokens.refresh_token));
    }

    #[tokio::test]
    async fn test_logout_with_expired_token_records_nothing() {
        let provider = provider();
        let login = provider.login("client@x", "pw").await.unwrap();
        let stale = provider
            .codec()
            .sign(&login.principal, TokenKind::Refresh, -60)
            .unwrap();

        provider.logout(&stale).await.unwrap();
        provider.logout("garbage").await.unwrap();
        assert!(provider.state.lock().consumed_refresh_tokens.is_empty());
    }

    #[test]
    fn test_demo_accounts_are_seeded() {
        let provider = MockCredentialProvider::new(TokenCodec::new("s")).with_demo_accounts();
        let state = provider.state.lock();
        assert!(state.accounts.contains_key("rider@ridepass.dev"));
        assert!(state.accounts.contains_key("driver@ridepass.dev"));
    }
}
