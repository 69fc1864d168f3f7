//! Session management.
//!
//! This module provides:
//! - `SessionManager`: the state machine that owns the current session
//! - `SessionState`: the snapshot collaborators render
//! - `RefreshFailurePolicy`: what a failed refresh does to the session

pub mod manager;
pub mod policy;
pub mod state;

pub use manager::{SessionManager, SessionManagerBuilder, SessionSettings};
pub use policy::{
    FailureAction, KeepSession, LogoutOnRejection, RefreshFailurePolicy, RefreshPolicyKind,
};
pub use state::{SessionPhase, SessionState, SessionWarning};
