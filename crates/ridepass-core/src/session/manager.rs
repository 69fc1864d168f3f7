//! Session state machine: initialize, login, register, refresh and logout.
//!
//! States: `Uninitialized -> Loading -> {Authenticated, Unauthenticated}`,
//! with an orthogonal `refreshing` flag.
//!
//! Every login, registration and logout starts a new session epoch. A
//! refresh remembers the epoch it started in and is discarded if the epoch
//! moved on before it could persist its result, so a late refresh can never
//! resurrect a session that was logged out or replaced.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::policy::{FailureAction, KeepSession, RefreshFailurePolicy};
use super::state::{SessionPhase, SessionState, SessionWarning};
use crate::error::{ProviderError, SessionError};
use crate::models::{Principal, Registration, TokenPair};
use crate::provider::{AuthResponse, CredentialProvider};
use crate::store::TokenStore;
use crate::token::{self, TokenCodec, TokenKind};

/// Bound on login, register and refresh round trips.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Logout is best effort; don't keep the user waiting on it.
const DEFAULT_LOGOUT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub request_timeout: Duration,
    pub logout_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            logout_timeout: Duration::from_secs(DEFAULT_LOGOUT_TIMEOUT_SECS),
        }
    }
}

impl SessionSettings {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_logout_timeout(mut self, timeout: Duration) -> Self {
        self.logout_timeout = timeout;
        self
    }
}

/// The refresh currently in flight, shared by everyone who asks for one.
struct Flight {
    id: u64,
    outcome: Shared<BoxFuture<'static, bool>>,
}

struct Inner {
    provider: Arc<dyn CredentialProvider>,
    store: Arc<dyn TokenStore>,
    policy: Arc<dyn RefreshFailurePolicy>,
    codec: Option<TokenCodec>,
    settings: SessionSettings,
    state: watch::Sender<SessionState>,
    epoch: AtomicU64,
    next_flight: AtomicU64,
    flight: Mutex<Option<Flight>>,
    /// Serializes the persist step of login, logout and refresh.
    /// Held only around store writes, never across provider calls.
    commit_gate: tokio::sync::Mutex<()>,
}

/// Handle to the session. Clone is cheap and every clone sees the same state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

pub struct SessionManagerBuilder {
    provider: Arc<dyn CredentialProvider>,
    store: Arc<dyn TokenStore>,
    policy: Arc<dyn RefreshFailurePolicy>,
    codec: Option<TokenCodec>,
    settings: SessionSettings,
}

impl SessionManagerBuilder {
    pub fn policy(mut self, policy: Arc<dyn RefreshFailurePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Verify access tokens locally with this key. Without one, stored
    /// tokens are only checked for expiry and the server stays the judge.
    pub fn codec(mut self, codec: TokenCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> SessionManager {
        let (state, _) = watch::channel(SessionState::default());
        SessionManager {
            inner: Arc::new(Inner {
                provider: self.provider,
                store: self.store,
                policy: self.policy,
                codec: self.codec,
                settings: self.settings,
                state,
                epoch: AtomicU64::new(0),
                next_flight: AtomicU64::new(0),
                flight: Mutex::new(None),
                commit_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

impl SessionManager {
    pub fn builder(
        provider: Arc<dyn CredentialProvider>,
        store: Arc<dyn TokenStore>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            provider,
            store,
            policy: Arc::new(KeepSession),
            codec: None,
            settings: SessionSettings::default(),
        }
    }

    pub fn new(provider: Arc<dyn CredentialProvider>, store: Arc<dyn TokenStore>) -> Self {
        Self::builder(provider, store).build()
    }

    // ===== State =====

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.borrow().phase
    }

    pub fn principal(&self) -> Option<Principal> {
        self.inner.state.borrow().principal.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    /// Watch state changes. The receiver starts at the current state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.inner.store
    }

    /// Currently stored pair, if any. Storage errors read as "no tokens".
    pub async fn tokens(&self) -> Option<TokenPair> {
        match self.inner.store.load().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Failed to read token store");
                None
            }
        }
    }

    // ===== Lifecycle =====

    /// Restore the session from storage on startup.
    pub async fn initialize(&self) -> SessionPhase {
        let epoch = self.current_epoch();
        self.inner.state.send_modify(|s| {
            s.phase = SessionPhase::Loading;
            s.warning = None;
        });

        let Some(pair) = self.tokens().await else {
            debug!("No stored session");
            return self.settle_unauthenticated(epoch);
        };

        let profile = match self.inner.store.load_profile().await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(error = %e, "Failed to read cached profile");
                None
            }
        };
        let principal =
            profile.or_else(|| token::decode(&pair.access_token).map(|c| c.principal()));

        if self.access_token_valid(&pair.access_token) {
            if let Some(principal) = principal {
                info!(user_id = %principal.user_id, "Restored session from storage");
                return self.settle(epoch, SessionState::authenticated(principal));
            }
        }

        debug!("Stored access token is not usable, refreshing");
        if self.refresh().await {
            return self.phase();
        }
        if self.current_epoch() != epoch {
            // The failure policy (or a concurrent logout) already ended the session.
            return self.phase();
        }

        match principal {
            Some(principal) => {
                warn!(
                    user_id = %principal.user_id,
                    "Token refresh failed during startup, keeping cached session"
                );
                let mut state = SessionState::authenticated(principal);
                state.warning = Some(SessionWarning::StaleSession {
                    reason: "Could not refresh the session; showing cached data.".to_string(),
                });
                self.settle(epoch, state)
            }
            None => {
                warn!("Token refresh failed and no cached profile exists");
                self.settle_unauthenticated(epoch)
            }
        }
    }

    /// Authenticate with email and password.
    ///
    /// A failed attempt ends whatever session was active before it.
    pub async fn login(&self, email: &str, password: &str) -> Result<Principal, SessionError> {
        if email.trim().is_empty() || password.is_empty() {
            self.end_session_locally().await;
            return Err(SessionError::InvalidInput(
                "Email and password required".to_string(),
            ));
        }

        let response = self.bounded(self.inner.provider.login(email, password)).await;
        match response {
            Ok(response) => self.establish(response).await,
            Err(e) => {
                error!(error = %e, "Login failed");
                self.end_session_locally().await;
                Err(e.into())
            }
        }
    }

    /// Create an account and sign in as it.
    pub async fn register(
        &self,
        registration: &Registration,
        password: &str,
    ) -> Result<Principal, SessionError> {
        if let Err(msg) = registration.validate() {
            self.end_session_locally().await;
            return Err(SessionError::InvalidInput(msg));
        }
        if password.is_empty() {
            self.end_session_locally().await;
            return Err(SessionError::InvalidInput("Password required".to_string()));
        }

        let response = self
            .bounded(self.inner.provider.register(registration, password))
            .await;
        match response {
            Ok(response) => self.establish(response).await,
            Err(e) => {
                error!(error = %e, "Registration failed");
                self.end_session_locally().await;
                Err(e.into())
            }
        }
    }

    /// End the session. Local state is always cleared, whatever the server says.
    pub async fn logout(&self) {
        let pair = self.tokens().await;
        self.end_session_locally().await;
        info!("Logged out");

        let Some(pair) = pair else {
            return;
        };
        let revoke = self.inner.provider.logout(&pair.refresh_token);
        match tokio::time::timeout(self.inner.settings.logout_timeout, revoke).await {
            Ok(Ok(())) => debug!("Server acknowledged logout"),
            Ok(Err(e)) => warn!(error = %e, "Server logout failed; local session already cleared"),
            Err(_) => warn!("Server logout timed out; local session already cleared"),
        }
    }

    /// Exchange the stored refresh token for a new pair.
    ///
    /// Overlapping calls share one provider round trip and its outcome.
    /// The round trip runs on its own task, so a caller that stops waiting
    /// does not stop the refresh.
    ///
    /// Returns `false` on any failure; whether the session survives a
    /// failure is up to the configured [`RefreshFailurePolicy`].
    pub async fn refresh(&self) -> bool {
        let outcome = {
            let mut flight = self.inner.flight.lock();
            match flight.as_ref() {
                Some(existing) => {
                    debug!(flight = existing.id, "Joining in-flight refresh");
                    existing.outcome.clone()
                }
                None => {
                    let id = self.inner.next_flight.fetch_add(1, Ordering::SeqCst);
                    let this = self.clone();
                    let task = tokio::spawn(async move {
                        let refreshed = this.run_refresh().await;
                        this.finish_flight(id);
                        refreshed
                    });
                    let outcome = async move {
                        task.await.unwrap_or_else(|e| {
                            error!(error = %e, "Refresh task failed");
                            false
                        })
                    }
                    .boxed()
                    .shared();
                    *flight = Some(Flight {
                        id,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };
        outcome.await
    }

    /// Whether a refresh is currently in flight at this layer.
    pub fn is_refreshing(&self) -> bool {
        self.inner.flight.lock().is_some()
    }

    // ===== Internals =====

    fn current_epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Start a new session generation, orphaning any in-flight refresh.
    fn advance_epoch(&self) -> u64 {
        self.inner.flight.lock().take();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn finish_flight(&self, id: u64) {
        let mut flight = self.inner.flight.lock();
        if flight.as_ref().map(|f| f.id) == Some(id) {
            *flight = None;
        }
    }

    fn settle(&self, epoch: u64, state: SessionState) -> SessionPhase {
        if self.current_epoch() == epoch {
            self.inner.state.send_replace(state);
        }
        self.phase()
    }

    fn settle_unauthenticated(&self, epoch: u64) -> SessionPhase {
        self.settle(epoch, SessionState::unauthenticated())
    }

    fn set_refreshing(&self, epoch: u64, refreshing: bool) {
        if self.current_epoch() == epoch {
            self.inner.state.send_modify(|s| s.refreshing = refreshing);
        }
    }

    fn access_token_valid(&self, access_token: &str) -> bool {
        match &self.inner.codec {
            Some(codec) => match codec.verify_kind(access_token, TokenKind::Access) {
                Ok(_) => true,
                Err(e) => {
                    debug!(error = %e, "Stored access token failed verification");
                    false
                }
            },
            None => !token::is_expiring(access_token, 0, token::now_unix()),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        tokio::time::timeout(self.inner.settings.request_timeout, call)
            .await
            .unwrap_or(Err(ProviderError::Timeout))
    }

    /// Persist a fresh login or registration and make it the current session.
    async fn establish(&self, response: AuthResponse) -> Result<Principal, SessionError> {
        if let Some(codec) = &self.inner.codec {
            if let Err(e) = codec.verify_kind(&response.tokens.access_token, TokenKind::Access) {
                error!(error = %e, "Provider issued an access token that does not verify");
                self.end_session_locally().await;
                return Err(e.into());
            }
        }

        self.advance_epoch();
        let _gate = self.inner.commit_gate.lock().await;
        if let Err(e) = self
            .inner
            .store
            .commit(&response.tokens, &response.principal)
            .await
        {
            error!(error = %e, "Failed to persist session");
            if let Err(clear_err) = self.inner.store.clear_all().await {
                error!(error = %clear_err, "Failed to clear stored credentials");
            }
            self.inner.state.send_replace(SessionState::unauthenticated());
            return Err(e.into());
        }

        info!(
            user_id = %response.principal.user_id,
            role = %response.principal.role,
            "Signed in"
        );
        self.inner
            .state
            .send_replace(SessionState::authenticated(response.principal.clone()));
        Ok(response.principal)
    }

    async fn end_session_locally(&self) {
        self.advance_epoch();
        let _gate = self.inner.commit_gate.lock().await;
        if let Err(e) = self.inner.store.clear_all().await {
            error!(error = %e, "Failed to clear stored credentials");
        }
        self.inner.state.send_replace(SessionState::unauthenticated());
    }

    async fn run_refresh(&self) -> bool {
        let epoch = self.current_epoch();
        let Some(pair) = self.tokens().await else {
            debug!("No refresh token stored, nothing to refresh");
            return false;
        };

        self.set_refreshing(epoch, true);
        let response = self
            .bounded(self.inner.provider.refresh(&pair.refresh_token))
            .await;
        let refreshed = match response {
            Ok(response) => self.apply_refresh(epoch, response).await,
            Err(e) => {
                self.handle_refresh_failure(epoch, &e).await;
                false
            }
        };
        self.set_refreshing(epoch, false);
        refreshed
    }

    async fn apply_refresh(&self, epoch: u64, response: AuthResponse) -> bool {
        let _gate = self.inner.commit_gate.lock().await;
        if self.current_epoch() != epoch {
            info!("Discarding refresh that completed after the session changed");
            return false;
        }
        if let Some(codec) = &self.inner.codec {
            if let Err(e) = codec.verify_kind(&response.tokens.access_token, TokenKind::Access) {
                warn!(error = %e, "Refreshed access token does not verify");
                return false;
            }
        }
        if let Err(e) = self
            .inner
            .store
            .commit(&response.tokens, &response.principal)
            .await
        {
            warn!(error = %e, "Failed to persist refreshed tokens");
            return false;
        }

        debug!(user_id = %response.principal.user_id, "Session refreshed");
        self.inner.state.send_modify(|s| {
            s.phase = SessionPhase::Authenticated;
            s.principal = Some(response.principal);
            s.warning = None;
        });
        true
    }

    async fn handle_refresh_failure(&self, epoch: u64, error: &ProviderError) {
        warn!(error = %error, transient = error.is_transient(), "Token refresh failed");
        match self.inner.policy.decide(error) {
            FailureAction::KeepSession => {}
            FailureAction::Logout => {
                if self.current_epoch() == epoch {
                    info!(policy = ?self.inner.policy, "Refresh failure ends the session");
                    self.end_session_locally().await;
                }
            }
        }
    }
}
