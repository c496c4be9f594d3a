//! Webhook signing and verification
//!
//! Signatures are `sha256=<hex(HMAC-SHA256(secret, raw_body))>` over the raw
//! request bytes. The header name is configurable per trigger; the algorithm
//! is fixed.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the signature header value for a body.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a presented signature in constant time.
pub fn verify(secret: &str, body: &[u8], presented: &str) -> bool {
    let Some(hex_digest) = presented.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(presented_bytes) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(body);
    mac.verify_slice(&presented_bytes).is_ok()
}

/// A fresh 32-byte hex secret for a new webhook trigger.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let secret = "shh";
        let body = br#"{"hello":"world"}"#;

        let signature = sign(secret, body);
        assert!(signature.starts_with("sha256="));
        assert!(verify(secret, body, &signature));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = b"payload";
        let signature = sign("right", body);
        assert!(!verify("wrong", body, &signature));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let signature = sign("secret", b"original");
        assert!(!verify("secret", b"tampered", &signature));
    }

    #[test]
    fn test_malformed_signatures_rejected() {
        assert!(!verify("secret", b"body", "md5=abcdef"));
        assert!(!verify("secret", b"body", "sha256=not-hex"));
        assert!(!verify("secret", b"body", ""));
    }

    #[test]
    fn test_generated_secrets_are_unique() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
