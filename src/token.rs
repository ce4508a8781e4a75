//! Bearer token parsing and scope rules.
//!
//! The auth endpoint yields an opaque signed token. The client never
//! verifies the signature (the server does); it only decodes the payload
//! segment to learn its own actor id, scopes, user identity, and expiry.
//! Tokens are cached across reconnects until expired.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

use crate::error::RoomError;

/// Scope granting read access to the room.
pub const SCOPE_ROOM_READ: &str = "room:read";
/// Scope granting write access to storage.
pub const SCOPE_ROOM_WRITE: &str = "room:write";
/// Scope granting presence writes only.
pub const SCOPE_PRESENCE_WRITE: &str = "room:presence:write";

/// Allowed clock skew when judging expiry, in seconds.
const EXPIRY_SKEW_SECS: u64 = 30;

/// A parsed bearer token: the raw signed string plus the payload fields
/// the client needs.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthToken {
    pub raw: String,
    pub actor: i64,
    pub scopes: Vec<String>,
    pub user_id: Option<String>,
    pub user_info: Option<Value>,
    pub exp: u64,
    pub iat: u64,
}

impl AuthToken {
    /// Decode the payload segment of a three-segment signed token.
    pub fn parse(raw: &str) -> Result<AuthToken, RoomError> {
        let mut segments = raw.split('.');
        let (Some(_header), Some(payload), Some(_sig), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(RoomError::Authentication(
                "token is not a three-segment bearer token".into(),
            ));
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| RoomError::Authentication(format!("token payload is not base64: {e}")))?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| RoomError::Authentication(format!("token payload is not JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| RoomError::Authentication("token payload is not an object".into()))?;

        let actor = obj
            .get("actor")
            .and_then(Value::as_i64)
            .ok_or_else(|| RoomError::Authentication("token payload has no actor".into()))?;
        let exp = obj
            .get("exp")
            .and_then(Value::as_u64)
            .ok_or_else(|| RoomError::Authentication("token payload has no exp".into()))?;
        let iat = obj.get("iat").and_then(Value::as_u64).unwrap_or(0);
        let scopes = obj
            .get("scopes")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(AuthToken {
            raw: raw.to_string(),
            actor,
            scopes,
            user_id: obj.get("id").and_then(Value::as_str).map(String::from),
            user_info: match obj.get("info") {
                Some(Value::Null) | None => None,
                Some(v) => Some(v.clone()),
            },
            exp,
            iat,
        })
    }

    /// Expired iff `now >= exp` minus the skew allowance.
    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs + EXPIRY_SKEW_SECS >= self.exp
    }

    /// Whether this token only permits reading storage and writing
    /// presence. Storage mutations are denied for such sessions.
    pub fn is_read_only(&self) -> bool {
        scopes_are_read_only(&self.scopes)
    }
}

/// Read-only iff the scope set has `room:read` and `room:presence:write`
/// but not `room:write`.
pub fn scopes_are_read_only(scopes: &[String]) -> bool {
    let has = |s: &str| scopes.iter().any(|x| x == s);
    has(SCOPE_ROOM_READ) && has(SCOPE_PRESENCE_WRITE) && !has(SCOPE_ROOM_WRITE)
}

/// Seconds since the UNIX epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Build an unsigned test token with the given payload.
    pub(crate) fn fake_token(payload: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        format!("{header}.{body}.sig")
    }

    #[test]
    fn test_parse_full_payload() {
        let raw = fake_token(json!({
            "actor": 12,
            "scopes": ["room:read", "room:write"],
            "id": "user-12",
            "info": {"name": "Ada"},
            "exp": 2_000_000_000u64,
            "iat": 1_000_000_000u64,
        }));
        let token = AuthToken::parse(&raw).unwrap();
        assert_eq!(token.actor, 12);
        assert_eq!(token.user_id.as_deref(), Some("user-12"));
        assert_eq!(token.user_info.clone().unwrap()["name"], json!("Ada"));
        assert_eq!(token.exp, 2_000_000_000);
        assert!(!token.is_read_only());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(AuthToken::parse("nope").is_err());
        assert!(AuthToken::parse("a.b").is_err());
        assert!(AuthToken::parse("a.@@@.c").is_err());
        // Valid base64, not JSON.
        let bad = format!("h.{}.s", URL_SAFE_NO_PAD.encode(b"hello"));
        assert!(AuthToken::parse(&bad).is_err());
        // Missing actor.
        let raw = fake_token(json!({ "exp": 99u64 }));
        assert!(AuthToken::parse(&raw).is_err());
    }

    #[test]
    fn test_expiry_with_skew() {
        let raw = fake_token(json!({ "actor": 1, "exp": 1000u64, "iat": 0u64 }));
        let token = AuthToken::parse(&raw).unwrap();
        assert!(!token.is_expired(900));
        // Within the skew window counts as expired.
        assert!(token.is_expired(980));
        assert!(token.is_expired(1000));
        assert!(token.is_expired(5000));
    }

    #[test]
    fn test_read_only_rule() {
        let ro = vec![
            SCOPE_ROOM_READ.to_string(),
            SCOPE_PRESENCE_WRITE.to_string(),
        ];
        assert!(scopes_are_read_only(&ro));

        let rw = vec![
            SCOPE_ROOM_READ.to_string(),
            SCOPE_PRESENCE_WRITE.to_string(),
            SCOPE_ROOM_WRITE.to_string(),
        ];
        assert!(!scopes_are_read_only(&rw));

        // Without presence write the combination is not the read-only shape.
        let odd = vec![SCOPE_ROOM_READ.to_string()];
        assert!(!scopes_are_read_only(&odd));
    }
}
