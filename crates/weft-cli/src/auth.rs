//! Challenge-response authentication primitives.
//!
//! Passwords are stored as `SHA1(login ':' password)` hex. To log in, the
//! server hands out a random nonce and the client answers with
//! `HMAC-SHA1(stored_hash, nonce_bytes)` hex; the plaintext password never
//! crosses the wire.

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};

type HmacSha1 = Hmac<Sha1>;

/// Hash a password for storage: `SHA1(login ':' password)` hex.
pub fn hash_password(login: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(login.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// A fresh 32-byte nonce, hex-encoded.
pub fn generate_nonce() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// The expected challenge response: HMAC-SHA1 keyed by the stored hash
/// (its hex form, as stored) over the raw nonce bytes.
pub fn challenge_response(stored_hash: &str, nonce_hex: &str) -> Option<String> {
    let nonce = hex::decode(nonce_hex).ok()?;
    let mut mac = HmacSha1::new_from_slice(stored_hash.as_bytes()).ok()?;
    mac.update(&nonce);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time-ish comparison of a client response against the expected
/// value.
pub fn verify_response(stored_hash: &str, nonce_hex: &str, response_hex: &str) -> bool {
    let Some(nonce) = hex::decode(nonce_hex).ok() else {
        return false;
    };
    let Some(response) = hex::decode(response_hex).ok() else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(stored_hash.as_bytes()) else {
        return false;
    };
    mac.update(&nonce);
    mac.verify_slice(&response).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_is_sha1_hex() {
        let hash = hash_password("admin", "secret");
        assert_eq!(hash.len(), 40);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic.
        assert_eq!(hash, hash_password("admin", "secret"));
        // Login is part of the hash.
        assert_ne!(hash, hash_password("other", "secret"));
    }

    #[test]
    fn nonce_is_unique_hex() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn challenge_round_trip() {
        let stored = hash_password("admin", "secret");
        let nonce = generate_nonce();
        let response = challenge_response(&stored, &nonce).unwrap();
        assert!(verify_response(&stored, &nonce, &response));
    }

    #[test]
    fn wrong_password_fails() {
        let stored = hash_password("admin", "secret");
        let wrong = hash_password("admin", "guess");
        let nonce = generate_nonce();
        let response = challenge_response(&wrong, &nonce).unwrap();
        assert!(!verify_response(&stored, &nonce, &response));
    }

    #[test]
    fn malformed_inputs_fail_closed() {
        let stored = hash_password("admin", "secret");
        assert!(!verify_response(&stored, "not-hex", "00"));
        assert!(!verify_response(&stored, "00ff", "not-hex"));
    }
}
