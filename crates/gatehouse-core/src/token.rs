//! HMAC bearer tokens for gatehouse.
//!
//! Format: `<subject>.<expiry unix secs>.<hex HMAC-SHA256(subject || "." || expiry)>`.
//! The subject must not contain `.`.

use crate::error::{GateError, GateResult};
use ring::hmac;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn sign(secret: &[u8], subject: &str, expiry: u64) -> hmac::Tag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::sign(&key, format!("{subject}.{expiry}").as_bytes())
}

/// Create a bearer token for `subject` valid for `ttl_secs`.
pub fn create_token(secret: &[u8], subject: &str, ttl_secs: u64) -> GateResult<String> {
    if subject.is_empty() || subject.contains('.') {
        return Err(GateError::Config(format!(
            "invalid token subject: {subject:?}"
        )));
    }
    let expiry = now_secs() + ttl_secs;
    let tag = sign(secret, subject, expiry);
    Ok(format!("{subject}.{expiry}.{}", hex::encode(tag.as_ref())))
}

/// Verify a bearer token and return its subject.
///
/// Checks the HMAC signature and the expiry time.
pub fn verify_token(secret: &[u8], token: &str) -> GateResult<String> {
    let mut parts = token.splitn(3, '.');
    let (Some(subject), Some(expiry), Some(mac)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(GateError::Unauthenticated("malformed token".into()));
    };
    if subject.is_empty() {
        return Err(GateError::Unauthenticated("empty token subject".into()));
    }
    let expiry: u64 = expiry
        .parse()
        .map_err(|_| GateError::Unauthenticated("malformed token expiry".into()))?;
    let mac = hex::decode(mac)
        .map_err(|_| GateError::Unauthenticated("malformed token signature".into()))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, format!("{subject}.{expiry}").as_bytes(), &mac)
        .map_err(|_| GateError::Unauthenticated("invalid token signature".into()))?;

    if now_secs() > expiry {
        return Err(GateError::Unauthenticated("token expired".into()));
    }
    Ok(subject.to_string())
}

/// Generate a random server secret (32 bytes).
pub fn generate_secret() -> GateResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| GateError::Internal("RNG failure".into()))?;
    Ok(secret)
}
