//! What to do with a session when a token refresh fails.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Leave the session as it is and let the caller retry later.
    KeepSession,
    /// Clear stored credentials and become unauthenticated.
    Logout,
}

pub trait RefreshFailurePolicy: Send + Sync + fmt::Debug {
    fn decide(&self, error: &ProviderError) -> FailureAction;
}

/// Never end the session because a refresh failed.
///
/// Offline use keeps working on cached data, at the cost of also keeping a
/// session the server has revoked until the next explicit logout.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepSession;

impl RefreshFailurePolicy for KeepSession {
    fn decide(&self, _error: &ProviderError) -> FailureAction {
        FailureAction::KeepSession
    }
}

/// End the session only when the server actively rejected the refresh token.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogoutOnRejection;

impl RefreshFailurePolicy for LogoutOnRejection {
    fn decide(&self, error: &ProviderError) -> FailureAction {
        match error {
            ProviderError::Rejected(_) => FailureAction::Logout,
            _ => FailureAction::KeepSession,
        }
    }
}

/// Serializable policy selector for configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicyKind {
    #[default]
    KeepSession,
    LogoutOnRejection,
}

impl RefreshPolicyKind {
    pub fn into_policy(self) -> Arc<dyn RefreshFailurePolicy> {
        match self {
            RefreshPolicyKind::KeepSession => Arc::new(KeepSession),
            RefreshPolicyKind::LogoutOnRejection => Arc::new(LogoutOnRejection),
        }
    }
}
