//! End-to-end session flows against the mock provider.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;

use ridepass_core::interceptor::{AuthStatus, RefreshOutcome};
use ridepass_core::provider::{MockCredentialProvider, MockSettings};
use ridepass_core::session::{LogoutOnRejection, SessionWarning};
use ridepass_core::store::{FileTokenStore, MemoryTokenStore};
use ridepass_core::{
    AuthInterceptor, Intercepted, Role, SessionManager, SessionPhase, TokenCodec, TokenKind,
    TokenPair, TokenStore,
};

const SECRET: &str = "integration-secret";

/// What the fake API saw and how it answered.
#[derive(Debug)]
struct Reply {
    status: u16,
    authorization: String,
}

impl AuthStatus for Reply {
    fn is_unauthorized(&self) -> bool {
        self.status == 401
    }
}

/// Resource server that rejects revoked access tokens.
#[derive(Default)]
struct FakeApi {
    revoked: Mutex<HashSet<String>>,
}

impl FakeApi {
    fn revoke(&self, authorization: String) {
        self.revoked.lock().insert(authorization);
    }

    async fn call(&self, authorization: String) -> Result<Reply, Infallible> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = if self.revoked.lock().contains(&authorization) {
            401
        } else {
            200
        };
        Ok(Reply {
            status,
            authorization,
        })
    }
}

async fn signed_in(settings: MockSettings) -> (Arc<MockCredentialProvider>, SessionManager) {
    let provider = Arc::new(MockCredentialProvider::with_settings(
        TokenCodec::new(SECRET),
        settings,
    ));
    provider.add_account("rider@x", "pw", Role::Client, "5551230000", Some("Rae"));
    let session = SessionManager::new(provider.clone(), Arc::new(MemoryTokenStore::new()));
    session.login("rider@x", "pw").await.unwrap();
    (provider, session)
}

/// Replace the stored pair with one whose access token expired a minute ago.
async fn expire_access_token(provider: &MockCredentialProvider, session: &SessionManager) -> String {
    let principal = session.principal().unwrap();
    let codec = provider.codec();
    let pair = TokenPair::new(
        codec.sign(&principal, TokenKind::Access, -60).unwrap(),
        codec.sign(&principal, TokenKind::Refresh, 3600).unwrap(),
        -60,
    );
    session.store().save(&pair).await.unwrap();
    pair.authorization()
}

// ===== Sign-in =====

#[tokio::test]
async fn test_login_stores_client_claims_and_bearer_header() {
    let (provider, session) = signed_in(MockSettings::default()).await;
    let pair = session.tokens().await.unwrap();

    let claims = provider.codec().verify(&pair.access_token).unwrap();
    assert_eq!(claims.role, Role::Client);
    assert_eq!(claims.email, "rider@x");

    let interceptor = AuthInterceptor::new(session.clone());
    assert_eq!(
        interceptor.authorization_header().await,
        Some(format!("Bearer {}", pair.access_token))
    );
}

#[tokio::test]
async fn test_failed_login_leaves_no_bearer_header() {
    let (provider, session) = signed_in(MockSettings::default()).await;
    let interceptor = AuthInterceptor::new(session.clone());
    assert!(interceptor.authorization_header().await.is_some());

    assert!(session.login("rider@x", "not-the-password").await.is_err());
    assert_eq!(interceptor.authorization_header().await, None);

    let api = FakeApi::default();
    let result = interceptor.execute(|auth| api.call(auth)).await.unwrap();
    assert!(matches!(result, Intercepted::AuthenticationRequired));
    assert_eq!(session.phase(), SessionPhase::Unauthenticated);
    assert_eq!(provider.refresh_calls(), 0);
}

// ===== Concurrent rejection =====

#[tokio::test(start_paused = true)]
async fn test_concurrent_unauthorized_requests_share_one_refresh() {
    let (provider, session) =
        signed_in(MockSettings::default().with_latency(Duration::from_millis(200))).await;
    let interceptor = AuthInterceptor::new(session.clone());
    let api = Arc::new(FakeApi::default());
    api.revoke(session.tokens().await.unwrap().authorization());

    let results = join_all((0..5).map(|_| {
        let api = Arc::clone(&api);
        interceptor.execute(move |auth| async move { api.call(auth).await })
    }))
    .await;

    assert_eq!(provider.refresh_calls(), 1);
    for result in results {
        assert!(matches!(result, Ok(Intercepted::RetryWithNewToken)));
    }
    assert!(!interceptor.coordinator().is_in_flight());

    let replayed = join_all((0..5).map(|_| {
        let api = Arc::clone(&api);
        interceptor.execute(move |auth| async move { api.call(auth).await })
    }))
    .await;

    let current = session.tokens().await.unwrap().authorization();
    for result in replayed {
        match result {
            Ok(Intercepted::Completed(reply)) => {
                assert_eq!(reply.status, 200);
                assert_eq!(reply.authorization, current);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(provider.refresh_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_requires_authentication_for_every_waiter() {
    let (provider, session) =
        signed_in(MockSettings::default().with_latency(Duration::from_millis(200))).await;
    let interceptor = AuthInterceptor::new(session.clone());
    let api = Arc::new(FakeApi::default());
    api.revoke(session.tokens().await.unwrap().authorization());
    provider.set_reject_refresh(true);

    let results = join_all((0..3).map(|_| {
        let api = Arc::clone(&api);
        interceptor.execute(move |auth| async move { api.call(auth).await })
    }))
    .await;

    assert_eq!(provider.refresh_calls(), 1);
    for result in results {
        assert!(matches!(result, Ok(Intercepted::AuthenticationRequired)));
    }
}

// ===== Logout during refresh =====

#[tokio::test(start_paused = true)]
async fn test_logout_during_refresh_discards_the_result() {
    let (_provider, session) =
        signed_in(MockSettings::default().with_latency(Duration::from_millis(500))).await;
    let interceptor = AuthInterceptor::new(session.clone());

    let pending = {
        let coordinator = interceptor.coordinator().clone();
        tokio::spawn(async move { coordinator.recover().await })
    };
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    session.logout().await;
    assert_eq!(session.phase(), SessionPhase::Unauthenticated);

    assert_eq!(pending.await.unwrap(), Ok(RefreshOutcome::Failed));
    assert_eq!(session.phase(), SessionPhase::Unauthenticated);
    assert!(session.principal().is_none());
    assert!(session.tokens().await.is_none());
    assert!(session.store().load_profile().await.unwrap().is_none());
}

// ===== Proactive refresh =====

#[tokio::test]
async fn test_expired_access_token_is_refreshed_before_the_request() {
    let (provider, session) = signed_in(MockSettings::default()).await;
    let stale = expire_access_token(&provider, &session).await;
    let interceptor = AuthInterceptor::new(session.clone());
    let api = FakeApi::default();

    let result = interceptor
        .execute(|auth| api.call(auth))
        .await
        .unwrap();

    assert_eq!(provider.refresh_calls(), 1);
    let current = session.tokens().await.unwrap().authorization();
    match result {
        Intercepted::Completed(reply) => {
            assert_ne!(reply.authorization, stale);
            assert_eq!(reply.authorization, current);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_expired_token_with_unreachable_provider_requires_authentication() {
    let (provider, session) = signed_in(MockSettings::default()).await;
    expire_access_token(&provider, &session).await;
    provider.set_offline(true);
    let interceptor = AuthInterceptor::new(session.clone());
    let api = FakeApi::default();

    let result = interceptor.execute(|auth| api.call(auth)).await.unwrap();
    assert!(matches!(result, Intercepted::AuthenticationRequired));
    // The session itself survives; the user can retry once back online.
    assert!(session.is_authenticated());
}

#[tokio::test]
async fn test_token_inside_leeway_is_still_used_when_refresh_fails() {
    let (provider, session) =
        signed_in(MockSettings::default().with_access_ttl(10)).await;
    let issued = session.tokens().await.unwrap().authorization();
    provider.set_offline(true);
    let interceptor = AuthInterceptor::new(session.clone());
    let api = FakeApi::default();

    let result = interceptor.execute(|auth| api.call(auth)).await.unwrap();
    match result {
        Intercepted::Completed(reply) => assert_eq!(reply.authorization, issued),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

// ===== Unreachable provider =====

#[tokio::test]
async fn test_unreachable_refresh_keeps_session() {
    let (provider, session) = signed_in(MockSettings::default()).await;
    let before = session.tokens().await.unwrap();
    provider.set_offline(true);

    assert!(!session.refresh().await);
    assert_eq!(session.phase(), SessionPhase::Authenticated);
    assert!(!session.state().refreshing);
    assert_eq!(
        session.tokens().await.unwrap().access_token,
        before.access_token
    );
}

#[tokio::test]
async fn test_rejected_refresh_ends_session_under_logout_policy() {
    let provider = Arc::new(MockCredentialProvider::new(TokenCodec::new(SECRET)));
    provider.add_account("driver@x", "pw", Role::Driver, "5550009999", None);
    let session = SessionManager::builder(provider.clone(), Arc::new(MemoryTokenStore::new()))
        .policy(Arc::new(LogoutOnRejection))
        .build();
    session.login("driver@x", "pw").await.unwrap();

    provider.set_offline(true);
    assert!(!session.refresh().await);
    assert!(session.is_authenticated());

    provider.set_offline(false);
    provider.set_reject_refresh(true);
    assert!(!session.refresh().await);
    assert_eq!(session.phase(), SessionPhase::Unauthenticated);
    assert!(session.tokens().await.is_none());
}

// ===== Restart =====

#[tokio::test]
async fn test_session_survives_restart_with_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockCredentialProvider::new(TokenCodec::new(SECRET)));
    provider.add_account("rider@x", "pw", Role::Client, "5551230000", None);

    let principal = {
        let store = FileTokenStore::encrypted(dir.path(), "hunter2").await.unwrap();
        let session = SessionManager::new(provider.clone(), Arc::new(store));
        session.login("rider@x", "pw").await.unwrap()
    };

    let store = FileTokenStore::encrypted(dir.path(), "hunter2").await.unwrap();
    let restarted = SessionManager::builder(provider.clone(), Arc::new(store))
        .codec(TokenCodec::new(SECRET))
        .build();
    assert_eq!(restarted.initialize().await, SessionPhase::Authenticated);
    assert_eq!(restarted.principal(), Some(principal));
    assert_eq!(provider.refresh_calls(), 0);
}

#[tokio::test]
async fn test_offline_restart_with_expired_token_shows_stale_session() {
    let store = Arc::new(MemoryTokenStore::new());
    let provider = Arc::new(MockCredentialProvider::new(TokenCodec::new(SECRET)));
    provider.add_account("rider@x", "pw", Role::Client, "5551230000", None);

    let session = SessionManager::new(provider.clone(), store.clone());
    session.login("rider@x", "pw").await.unwrap();
    expire_access_token(&provider, &session).await;
    provider.set_offline(true);

    let restarted = SessionManager::new(provider.clone(), store);
    assert_eq!(restarted.initialize().await, SessionPhase::Authenticated);
    assert!(matches!(
        restarted.state().warning,
        Some(SessionWarning::StaleSession { .. })
    ));
}
