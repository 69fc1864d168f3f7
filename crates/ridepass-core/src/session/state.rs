use serde::Serialize;

use crate::models::Principal;

/// Top-level authentication state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Uninitialized,
    Loading,
    Authenticated,
    Unauthenticated,
}

/// Something the UI should tell the user about an otherwise usable session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionWarning {
    /// Tokens could not be refreshed; the session runs on cached data.
    StaleSession { reason: String },
}

/// Snapshot of the session as exposed to collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// A refresh is in flight. Orthogonal to `phase`.
    pub refreshing: bool,
    pub principal: Option<Principal>,
    pub warning: Option<SessionWarning>,
}

impl SessionState {
    pub fn authenticated(principal: Principal) -> Self {
        Self {
            phase: SessionPhase::Authenticated,
            refreshing: false,
            principal: Some(principal),
            warning: None,
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            phase: SessionPhase::Unauthenticated,
            ..Self::default()
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Authenticated
    }
}
