//! HMAC-SHA256 signatures on inbound reservation payloads.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Optional prefix some channels put in front of the hex digest.
const PREFIX: &str = "sha256=";

/// Hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a signature in constant time.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let provided = signature.trim();
    let provided = provided.strip_prefix(PREFIX).unwrap_or(provided);
    let expected = sign(secret, body);
    provided
        .to_ascii_lowercase()
        .as_bytes()
        .ct_eq(expected.as_bytes())
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn verify_accepts_own_signature() {
        let body = br#"{"externalId":"R-1"}"#;
        let sig = sign(SECRET, body);
        assert_eq!(sig.len(), 64);
        assert!(verify(SECRET, body, &sig));
        assert!(verify(SECRET, body, &format!("sha256={}", sig.to_uppercase())));
    }

    #[test]
    fn verify_rejects_tampering() {
        let body = br#"{"externalId":"R-1"}"#;
        let sig = sign(SECRET, body);
        assert!(!verify(SECRET, br#"{"externalId":"R-2"}"#, &sig));
        assert!(!verify("other", body, &sig));
        assert!(!verify(SECRET, body, ""));
    }
}
