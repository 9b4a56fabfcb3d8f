//! Signed, short-lived, single-purpose terminal tickets.
//!
//! A ticket authorizes exactly one thing: attaching an interactive terminal
//! to an already-created session. It carries no session-creation power. The
//! API process mints tickets; the terminal gateway verifies them with a
//! constant-time signature check before any shell is spawned.
//!
//! Format: `base64url(claims json) "." hex(hmac_sha256(secret, payload))`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// The only scope the terminal gateway accepts.
pub const TERMINAL_SCOPE: &str = "terminal";

/// Ticket lifetime.
pub const TICKET_TTL_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketClaims {
    /// Subject: the user the ticket was minted for.
    pub sub: String,
    pub scope: String,
    /// Target session identifier.
    pub sid: String,
    /// Expiry, unix seconds.
    pub exp: i64,
}

pub fn mint(secret: &[u8], user_id: &str, session_id: &str) -> String {
    let claims = TicketClaims {
        sub: user_id.to_string(),
        scope: TERMINAL_SCOPE.to_string(),
        sid: session_id.to_string(),
        exp: Utc::now().timestamp() + TICKET_TTL_SECS,
    };
    encode(secret, &claims)
}

pub fn verify(secret: &[u8], token: &str) -> Result<TicketClaims, String> {
    let (payload, sig_hex) = token.split_once('.').ok_or_else(|| "malformed ticket".to_string())?;
    let presented = hex::decode(sig_hex).map_err(|_| "malformed ticket signature".to_string())?;
    let expected = signature(secret, payload.as_bytes());
    if presented.len() != expected.len() || !bool::from(presented.ct_eq(expected.as_slice())) {
        return Err("ticket signature mismatch".to_string());
    }

    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| "malformed ticket payload".to_string())?;
    let claims: TicketClaims =
        serde_json::from_slice(&raw).map_err(|_| "malformed ticket payload".to_string())?;

    if claims.scope != TERMINAL_SCOPE {
        return Err(format!("ticket scope {:?} is not valid for terminal attach", claims.scope));
    }
    if claims.exp < Utc::now().timestamp() {
        return Err("ticket expired".to_string());
    }
    Ok(claims)
}

fn encode(secret: &[u8], claims: &TicketClaims) -> String {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims serialize"));
    let sig = hex::encode(signature(secret, payload.as_bytes()));
    format!("{payload}.{sig}")
}

fn signature(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"unit-test-secret-0123456789";

    #[test]
    fn mint_verify_round_trip() {
        let token = mint(SECRET, "u1", "s1");
        let claims = verify(SECRET, &token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.sid, "s1");
        assert_eq!(claims.scope, TERMINAL_SCOPE);
    }

    #[test]
    fn wrong_scope_is_always_rejected() {
        let claims = TicketClaims {
            sub: "u1".into(),
            scope: "session-create".into(),
            sid: "s1".into(),
            exp: Utc::now().timestamp() + 60,
        };
        let token = encode(SECRET, &claims);
        let err = verify(SECRET, &token).unwrap_err();
        assert!(err.contains("scope"));
    }

    #[test]
    fn expired_ticket_is_rejected() {
        let claims = TicketClaims {
            sub: "u1".into(),
            scope: TERMINAL_SCOPE.into(),
            sid: "s1".into(),
            exp: Utc::now().timestamp() - 1,
        };
        let token = encode(SECRET, &claims);
        assert_eq!(verify(SECRET, &token).unwrap_err(), "ticket expired");
    }

    #[test]
    fn any_tampered_signature_byte_is_rejected() {
        let token = mint(SECRET, "u1", "s1");
        let (payload, sig) = token.split_once('.').unwrap();
        for i in 0..sig.len() {
            let mut bytes = sig.as_bytes().to_vec();
            bytes[i] = if bytes[i] == b'0' { b'1' } else { b'0' };
            let forged = format!("{payload}.{}", String::from_utf8(bytes).unwrap());
            assert!(verify(SECRET, &forged).is_err(), "tampered byte {i} accepted");
        }
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let token = mint(SECRET, "u1", "s1");
        let (_, sig) = token.split_once('.').unwrap();
        let other = URL_SAFE_NO_PAD.encode(b"{\"sub\":\"u2\"}");
        assert!(verify(SECRET, &format!("{other}.{sig}")).is_err());
    }

    #[test]
    fn different_secret_is_rejected() {
        let token = mint(SECRET, "u1", "s1");
        assert!(verify(b"another-secret-another-secret", &token).is_err());
    }

    #[test]
    fn garbage_tokens_are_rejected_not_panicking() {
        for garbage in ["", ".", "a.b", "not-a-ticket", "xx.zz"] {
            assert!(verify(SECRET, garbage).is_err());
        }
    }
}
