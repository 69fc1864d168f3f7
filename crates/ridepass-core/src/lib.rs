//! Core library for ridepass.
//!
//! Authentication session and token lifecycle for the ridepass clients:
//! signing and verifying compact HMAC-SHA256 tokens, persisting the token
//! pair, tracking the signed-in principal, and authorizing outbound
//! requests with a single coordinated refresh when tokens go stale.
//!
//! The usual wiring is a [`CredentialProvider`] and a [`TokenStore`] handed
//! to a [`SessionManager`], whose [`AuthInterceptor`] is shared by every
//! request path.

pub mod api;
pub mod error;
pub mod interceptor;
pub mod models;
pub mod provider;
pub mod session;
pub mod store;
pub mod token;

pub use api::{ApiError, AuthorizedClient};
pub use error::{ProviderError, SessionError, StoreError, TokenError};
pub use interceptor::{AuthInterceptor, Intercepted, InterceptorSettings};
pub use models::{Principal, Registration, Role, TokenPair};
pub use provider::{AuthResponse, CredentialProvider};
pub use session::{RefreshPolicyKind, SessionManager, SessionPhase, SessionState};
pub use store::TokenStore;
pub use token::{Claims, TokenCodec, TokenKind};
