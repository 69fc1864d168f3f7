//! Token codec: sign, verify and decode compact HMAC-signed tokens.
//!
//! Verification failures are local and recoverable. Upper layers treat any
//! `TokenError` as "no valid token" and move on to the refresh path.

pub mod claims;
pub mod codec;

pub use claims::{Claims, TokenKind};
pub use codec::{
    decode, is_expiring, now_unix, sign, sign_at, sign_claims, verify, verify_at, TokenCodec,
};
