//! Stateless session tokens for the static-credential login path.
//!
//! A token is `username:issued_at_millis`, base64-encoded. This is a
//! reversible encoding, not a signature: anyone who can read the cookie can
//! forge one, and there is no server-side store, so revocation before expiry
//! is impossible. Kept deliberately: this is a placeholder session, and
//! validity is computed purely from the embedded timestamp and a fixed TTL.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use std::time::Duration;

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "funneldeck-auth";

/// Fixed validity window from issuance.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of verifying a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionVerification {
    pub valid: bool,
    pub username: Option<String>,
}

impl SessionVerification {
    fn invalid() -> Self {
        Self {
            valid: false,
            username: None,
        }
    }
}

/// Issues and verifies session tokens. No state beyond the TTL.
#[derive(Debug, Clone, Copy)]
pub struct SessionManager {
    ttl_millis: i64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            ttl_millis: SESSION_TTL.as_millis() as i64,
        }
    }

    /// Issue a token for a username, stamped with the current time.
    pub fn issue(&self, username: &str) -> String {
        BASE64.encode(format!("{}:{}", username, Utc::now().timestamp_millis()))
    }

    /// Verify a token against the current time.
    pub fn verify(&self, token: &str) -> SessionVerification {
        self.verify_at(token, Utc::now().timestamp_millis())
    }

    /// Verify against an explicit clock. Any decode failure is an invalid
    /// token, never an error.
    fn verify_at(&self, token: &str, now_millis: i64) -> SessionVerification {
        let decoded = match BASE64.decode(token) {
            Ok(bytes) => bytes,
            Err(_) => return SessionVerification::invalid(),
        };
        let decoded = match String::from_utf8(decoded) {
            Ok(text) => text,
            Err(_) => return SessionVerification::invalid(),
        };

        // Usernames may themselves contain ':'; the timestamp is always the
        // final segment.
        let (username, stamp) = match decoded.rsplit_once(':') {
            Some(parts) => parts,
            None => return SessionVerification::invalid(),
        };
        let issued_at: i64 = match stamp.parse() {
            Ok(ms) => ms,
            Err(_) => return SessionVerification::invalid(),
        };

        if username.is_empty() || now_millis - issued_at > self.ttl_millis {
            return SessionVerification::invalid();
        }

        SessionVerification {
            valid: true,
            username: Some(username.to_string()),
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_at(username: &str, issued_millis: i64) -> String {
        BASE64.encode(format!("{}:{}", username, issued_millis))
    }

    #[test]
    fn issue_then_verify_round_trips() {
        let sessions = SessionManager::new();
        let token = sessions.issue("admin");
        let check = sessions.verify(&token);
        assert!(check.valid);
        assert_eq!(check.username.as_deref(), Some("admin"));
    }

    #[test]
    fn validity_boundary_around_ttl() {
        let sessions = SessionManager::new();
        let issued = 1_700_000_000_000i64;
        let ttl = SESSION_TTL.as_millis() as i64;
        let token = token_at("admin", issued);

        // Valid one second before the TTL elapses, invalid one second after.
        assert!(sessions.verify_at(&token, issued + ttl - 1_000).valid);
        assert!(!sessions.verify_at(&token, issued + ttl + 1_000).valid);
    }

    #[test]
    fn malformed_tokens_are_invalid_not_errors() {
        let sessions = SessionManager::new();
        let bad_tokens = vec![
            String::new(),
            "not-base64!!!".to_string(),
            BASE64.encode("no-separator"),
            BASE64.encode("user:not-a-number"),
            BASE64.encode(":1700000000000"),
            BASE64.encode([0xffu8, 0xfe, 0x00]),
        ];
        for bad in &bad_tokens {
            let check = sessions.verify(bad);
            assert!(!check.valid, "token {:?} should be invalid", bad);
            assert!(check.username.is_none());
        }
    }

    #[test]
    fn username_with_colon_survives() {
        let sessions = SessionManager::new();
        let token = sessions.issue("user:with:colons");
        let check = sessions.verify(&token);
        assert!(check.valid);
        assert_eq!(check.username.as_deref(), Some("user:with:colons"));
    }
}
