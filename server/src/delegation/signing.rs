//! HMAC-SHA256 Request Signing
//!
//! Signs outbound delegation request bodies so application endpoints can
//! verify authenticity with the out-of-band shared secret. The wire form
//! carried in `X-Delegation-Signature` is `sha256=<hex digest>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix identifying the digest scheme in the signature header.
const SCHEME_PREFIX: &str = "sha256=";

/// Sign a payload with HMAC-SHA256 and return the hex-encoded digest.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// The header value for a signed payload: `sha256=<hex digest>`.
pub fn signature_header(secret: &str, payload: &[u8]) -> String {
    format!("{SCHEME_PREFIX}{}", sign_payload(secret, payload))
}

/// Verify a signature header against a payload. Accepts both the prefixed
/// wire form and a bare hex digest.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let digest = signature.strip_prefix(SCHEME_PREFIX).unwrap_or(signature);
    let expected = sign_payload(secret, payload);
    // Constant-time comparison
    expected.len() == digest.len()
        && expected
            .as_bytes()
            .iter()
            .zip(digest.as_bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Generate a random 32-byte hex signing secret.
pub fn generate_signing_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let secret = "test_secret_12345";
        let payload = b"{\"giveaway_id\":\"g1\",\"participants\":[\"ana\"]}";
        let sig = sign_payload(secret, payload);
        assert!(verify_signature(secret, payload, &sig));
        assert!(!verify_signature("wrong_secret", payload, &sig));
        assert!(!verify_signature(secret, b"tampered", &sig));
    }

    #[test]
    fn wire_form_verifies_with_its_prefix() {
        let secret = "test_secret_12345";
        let payload = b"{\"winner_count\":2}";
        let header = signature_header(secret, payload);
        assert!(header.starts_with("sha256="));
        assert!(verify_signature(secret, payload, &header));
    }

    #[test]
    fn generate_secret_length() {
        let secret = generate_signing_secret();
        assert_eq!(secret.len(), 64); // 32 bytes = 64 hex chars
    }
}
