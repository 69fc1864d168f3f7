//! Compact HMAC-SHA256 token signing and verification.
//!
//! Tokens are `header.claims.signature`, each segment base64url without
//! padding. The signature is a keyed MAC over the first two segments exactly
//! as they appear in the token.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Serialize};
use sha2::Sha256;

use super::claims::{Claims, Header, TokenKind};
use crate::error::TokenError;
use crate::models::{Principal, TokenPair};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HS256";
const TOKEN_TYPE: &str = "JWT";
const SEGMENT_COUNT: usize = 3;

/// Current time as Unix seconds.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Sign a token for `principal` valid for `ttl_seconds` from now.
pub fn sign(
    principal: &Principal,
    kind: TokenKind,
    secret: &[u8],
    ttl_seconds: i64,
) -> Result<String, TokenError> {
    sign_at(principal, kind, secret, ttl_seconds, now_unix())
}

/// Sign with an explicit issue time.
pub fn sign_at(
    principal: &Principal,
    kind: TokenKind,
    secret: &[u8],
    ttl_seconds: i64,
    now: i64,
) -> Result<String, TokenError> {
    let mut claims = Claims::new(principal, kind, now, now.saturating_add(ttl_seconds));
    claims.token_id = Some(URL_SAFE_NO_PAD.encode(rand::random::<[u8; 12]>()));
    sign_claims(&claims, secret)
}

/// Sign claims as given, without touching their timestamps.
pub fn sign_claims(claims: &Claims, secret: &[u8]) -> Result<String, TokenError> {
    let header = Header {
        alg: ALGORITHM.to_string(),
        typ: TOKEN_TYPE.to_string(),
    };
    let signing_input = format!("{}.{}", encode_segment(&header)?, encode_segment(claims)?);
    let signature = mac_for(secret, &signing_input)?.finalize().into_bytes();
    Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature)))
}

/// Verify authenticity and expiry against the current time.
pub fn verify(token: &str, secret: &[u8]) -> Result<Claims, TokenError> {
    verify_at(token, secret, now_unix())
}

/// Verify against an explicit clock.
///
/// Order matters: segment count, header, signature, claims, then expiry. An
/// expired token with a valid signature reports `Expired`; a forged one never
/// gets that far.
pub fn verify_at(token: &str, secret: &[u8], now: i64) -> Result<Claims, TokenError> {
    let [header_b64, claims_b64, signature_b64] = split(token)?;

    let header: Header = decode_segment(header_b64)?;
    if header.alg != ALGORITHM {
        return Err(TokenError::Format(format!(
            "unsupported algorithm {}",
            header.alg
        )));
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| TokenError::Signature)?;
    let signing_input = &token[..header_b64.len() + 1 + claims_b64.len()];
    mac_for(secret, signing_input)?
        .verify_slice(&signature)
        .map_err(|_| TokenError::Signature)?;

    let claims: Claims = decode_segment(claims_b64)?;
    if claims.is_expired_at(now) {
        return Err(TokenError::Expired {
            expired_at: claims.expires_at,
        });
    }
    Ok(claims)
}

/// Read the claims without checking the signature.
///
/// For diagnostics and scheduling only. Never base a trust decision on this.
pub fn decode(token: &str) -> Option<Claims> {
    let [_, claims_b64, _] = split(token).ok()?;
    decode_segment(claims_b64).ok()
}

/// Whether a token is expired or will be within `leeway_seconds`.
///
/// Undecodable tokens count as expiring so the caller refreshes them.
pub fn is_expiring(token: &str, leeway_seconds: i64, now: i64) -> bool {
    match decode(token) {
        Some(claims) => claims.expires_at.saturating_sub(leeway_seconds) <= now,
        None => true,
    }
}

fn split(token: &str) -> Result<[&str; SEGMENT_COUNT], TokenError> {
    let segments: Vec<&str> = token.split('.').collect();
    match segments.as_slice() {
        [header, claims, signature] => Ok([*header, *claims, *signature]),
        _ => Err(TokenError::Format(format!(
            "expected {} segments, found {}",
            SEGMENT_COUNT,
            segments.len()
        ))),
    }
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value).map_err(|e| TokenError::Encode(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| TokenError::Format(format!("bad base64: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| TokenError::Format(format!("bad json: {}", e)))
}

fn mac_for(secret: &[u8], signing_input: &str) -> Result<HmacSha256, TokenError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| TokenError::Encode(e.to_string()))?;
    mac.update(signing_input.as_bytes());
    Ok(mac)
}

/// A signing key plus the operations that need it.
#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    pub fn sign(
        &self,
        principal: &Principal,
        kind: TokenKind,
        ttl_seconds: i64,
    ) -> Result<String, TokenError> {
        sign(principal, kind, &self.secret, ttl_seconds)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        verify(token, &self.secret)
    }

    /// Verify and additionally require a specific token kind.
    pub fn verify_kind(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let claims = self.verify(token)?;
        if claims.token_kind != kind {
            return Err(TokenError::WrongKind {
                expected: kind.to_string(),
                actual: claims.token_kind.to_string(),
            });
        }
        Ok(claims)
    }

    /// Issue an access/refresh pair sharing one issue time.
    pub fn issue_pair(
        &self,
        principal: &Principal,
        access_ttl: i64,
        refresh_ttl: i64,
    ) -> Result<TokenPair, TokenError> {
        if access_ttl > refresh_ttl {
            return Err(TokenError::InvalidLifetime {
                access: access_ttl,
                refresh: refresh_ttl,
            });
        }
        let now = now_unix();
        let access = sign_at(principal, TokenKind::Access, &self.secret, access_ttl, now)?;
        let refresh = sign_at(principal, TokenKind::Refresh, &self.secret, refresh_ttl, now)?;
        Ok(TokenPair::new(access, refresh, access_ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    const SECRET: &[u8] = b"test-signing-secret";

    fn rider() -> Principal {
        Principal {
            user_id: "user-1".into(),
            email: "client@x".into(),
            role: Role::Client,
            phone: "5551234567".into(),
            name: Some("Riley Rider".into()),
        }
    }

    fn flip_low_bit(token: &str, index: usize) -> String {
        let mut bytes = token.as_bytes().to_vec();
        bytes[index] ^= 1;
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_sign_then_verify_returns_claims() {
        let token = sign_at(&rider(), TokenKind::Access, SECRET, 900, 1_000).unwrap();
        let claims = verify_at(&token, SECRET, 1_500).unwrap();
        assert_eq!(claims.user_id, "user-1");
        assert_eq!(claims.role, Role::Client);
        assert_eq!(claims.issued_at, 1_000);
        assert_eq!(claims.expires_at, 1_900);
        assert_eq!(claims.token_kind, TokenKind::Access);
        assert!(claims.token_id.is_some());
    }

    #[test]
    fn test_same_second_tokens_differ() {
        let first = sign_at(&rider(), TokenKind::Access, SECRET, 60, 1_000).unwrap();
        let second = sign_at(&rider(), TokenKind::Access, SECRET, 60, 1_000).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_token_has_three_segments_and_hs256_header() {
        let token = sign(&rider(), TokenKind::Access, SECRET, 60).unwrap();
        let segments: Vec<&str> = token.split('.').collect();
        assert_eq!(segments.len(), 3);
        let header: Header = decode_segment(segments[0]).unwrap();
        assert_eq!(header.alg, "HS256");
        assert_eq!(header.typ, "JWT");
    }

    #[test]
    fn test_wrong_secret_fails_signature() {
        let token = sign(&rider(), TokenKind::Access, SECRET, 60).unwrap();
        assert_eq!(verify(&token, b"other-secret"), Err(TokenError::Signature));
    }

    #[test]
    fn test_flipped_bit_in_claims_or_signature_fails_signature() {
        let token = sign_at(&rider(), TokenKind::Access, SECRET, 900, 1_000).unwrap();
        let claims_start = token.find('.').unwrap() + 1;
        for index in claims_start..token.len() {
            if token.as_bytes()[index] == b'.' {
                continue;
            }
            let tampered = flip_low_bit(&token, index);
            assert_eq!(
                verify_at(&tampered, SECRET, 1_500),
                Err(TokenError::Signature),
                "tampering at byte {} was not detected",
                index
            );
        }
    }

    #[test]
    fn test_flipped_bit_in_header_fails() {
        let token = sign_at(&rider(), TokenKind::Access, SECRET, 900, 1_000).unwrap();
        let header_end = token.find('.').unwrap();
        for index in 0..header_end {
            let tampered = flip_low_bit(&token, index);
            assert!(verify_at(&tampered, SECRET, 1_500).is_err());
        }
    }

    #[test]
    fn test_expired_token_with_valid_signature() {
        let token = sign_at(&rider(), TokenKind::Access, SECRET, 60, 1_000).unwrap();
        assert_eq!(
            verify_at(&token, SECRET, 1_060),
            Err(TokenError::Expired { expired_at: 1_060 })
        );
        // One second earlier it is still fine.
        assert!(verify_at(&token, SECRET, 1_059).is_ok());
    }

    #[test]
    fn test_expired_and_forged_reports_signature() {
        let token = sign_at(&rider(), TokenKind::Access, SECRET, 60, 1_000).unwrap();
        assert_eq!(
            verify_at(&token, b"wrong", 5_000),
            Err(TokenError::Signature)
        );
    }

    #[test]
    fn test_segment_count_is_checked_first() {
        assert!(matches!(
            verify("only.two", SECRET),
            Err(TokenError::Format(_))
        ));
        assert!(matches!(
            verify("a.b.c.d", SECRET),
            Err(TokenError::Format(_))
        ));
        // Garbage that would fail to decode still reports the segment count.
        match verify("!!!.???", SECRET) {
            Err(TokenError::Format(msg)) => assert!(msg.contains("segments")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_algorithm_is_format_error() {
        let header = encode_segment(&Header {
            alg: "none".into(),
            typ: "JWT".into(),
        })
        .unwrap();
        let claims = encode_segment(&Claims::new(&rider(), TokenKind::Access, 0, i64::MAX)).unwrap();
        let token = format!("{}.{}.", header, claims);
        assert!(matches!(verify(&token, SECRET), Err(TokenError::Format(_))));
    }

    #[test]
    fn test_decode_ignores_signature() {
        let token = sign_at(&rider(), TokenKind::Refresh, SECRET, 60, 1_000).unwrap();
        let forged = format!("{}AAAA", &token[..token.rfind('.').unwrap() + 1]);
        let claims = decode(&forged).unwrap();
        assert_eq!(claims.email, "client@x");
        assert_eq!(claims.token_kind, TokenKind::Refresh);
        assert!(decode("not-a-token").is_none());
    }

    #[test]
    fn test_missing_token_kind_defaults_to_access() {
        let json = r#"{"userId":"u","email":"e@x","role":"driver","phone":"1","issuedAt":1,"expiresAt":2}"#;
        let claims: Claims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.token_kind, TokenKind::Access);
    }

    #[test]
    fn test_is_expiring_with_leeway() {
        let token = sign_at(&rider(), TokenKind::Access, SECRET, 100, 1_000).unwrap();
        assert!(!is_expiring(&token, 10, 1_050));
        assert!(is_expiring(&token, 10, 1_090));
        assert!(is_expiring(&token, 0, 1_100));
        assert!(is_expiring("garbage", 0, 0));
    }

    #[test]
    fn test_extreme_lifetimes_saturate() {
        let forever = sign_at(&rider(), TokenKind::Access, SECRET, i64::MAX, 1_000).unwrap();
        let claims = decode(&forever).unwrap();
        assert_eq!(claims.expires_at, i64::MAX);
        assert!(verify_at(&forever, SECRET, i64::MAX - 1).is_ok());
        assert!(!is_expiring(&forever, i64::MIN, 0));

        let ancient = sign_at(&rider(), TokenKind::Access, SECRET, i64::MIN, -1).unwrap();
        assert_eq!(decode(&ancient).unwrap().expires_at, i64::MIN);
        assert!(is_expiring(&ancient, i64::MAX, i64::MIN));
        assert_eq!(
            verify_at(&ancient, SECRET, 0).unwrap_err(),
            TokenError::Expired { expired_at: i64::MIN }
        );
    }

    #[test]
    fn test_issue_pair_shares_subject() {
        let codec = TokenCodec::new(SECRET);
        let pair = codec.issue_pair(&rider(), 900, 86_400).unwrap();
        let access = codec.verify_kind(&pair.access_token, TokenKind::Access).unwrap();
        let refresh = codec.verify_kind(&pair.refresh_token, TokenKind::Refresh).unwrap();
        assert_eq!(access.principal(), refresh.principal());
        assert!(access.lifetime() <= refresh.lifetime());
        assert_eq!(pair.expires_in_seconds, 900);
        assert_eq!(pair.token_type, "Bearer");
    }

    #[test]
    fn test_issue_pair_rejects_inverted_lifetimes() {
        let codec = TokenCodec::new(SECRET);
        assert_eq!(
            codec.issue_pair(&rider(), 600, 60),
            Err(TokenError::InvalidLifetime {
                access: 600,
                refresh: 60
            })
        );
    }

    #[test]
    fn test_verify_kind_rejects_access_as_refresh() {
        let codec = TokenCodec::new(SECRET);
        let token = codec.sign(&rider(), TokenKind::Access, 60).unwrap();
        assert!(matches!(
            codec.verify_kind(&token, TokenKind::Refresh),
            Err(TokenError::WrongKind { .. })
        ));
    }
}
