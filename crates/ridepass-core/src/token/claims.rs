use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{Principal, Role};

/// Which half of a token pair a token is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    #[default]
    Access,
    Refresh,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Access => f.write_str("access"),
            TokenKind::Refresh => f.write_str("refresh"),
        }
    }
}

/// The signed payload of a token. Times are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    pub email: String,
    pub role: Role,
    pub phone: String,
    pub issued_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub token_kind: TokenKind,
    /// Unique per signed token, so two pairs issued in the same second differ.
    #[serde(default, rename = "jti", skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
}

impl Claims {
    pub fn new(principal: &Principal, kind: TokenKind, issued_at: i64, expires_at: i64) -> Self {
        Self {
            user_id: principal.user_id.clone(),
            email: principal.email.clone(),
            role: principal.role,
            phone: principal.phone.clone(),
            issued_at,
            expires_at,
            token_kind: kind,
            token_id: None,
        }
    }

    /// Rebuild the identity carried by these claims. Claims have no display name.
    pub fn principal(&self) -> Principal {
        Principal {
            user_id: self.user_id.clone(),
            email: self.email.clone(),
            role: self.role,
            phone: self.phone.clone(),
            name: None,
        }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    pub fn lifetime(&self) -> i64 {
        self.expires_at.saturating_sub(self.issued_at)
    }
}

/// First token segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Header {
    pub alg: String,
    pub typ: String,
}
