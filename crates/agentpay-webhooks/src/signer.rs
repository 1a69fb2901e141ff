//! HMAC-SHA256 payload signing
//!
//! The key is the subscription secret exactly as handed out at registration
//! (the hex string's bytes), and the signed bytes are the canonical JSON
//! serialized at enqueue - receivers verify over the request body they got.

use agentpay_types::{AgentPayError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Sign `payload` with `secret`, returning lowercase hex
pub fn sign(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AgentPayError::internal("HMAC key setup failed"))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a candidate signature against `payload`
///
/// Malformed candidates (odd length, non-hex) verify as false rather than
/// erroring, so probing cannot distinguish parse failures from mismatches.
pub fn verify(secret: &str, payload: &[u8], candidate: &str) -> Result<bool> {
    let expected = sign(secret, payload)?;
    let Ok(candidate_bytes) = hex::decode(candidate) else {
        return Ok(false);
    };
    let expected_bytes = hex::decode(&expected)
        .map_err(|_| AgentPayError::internal("signature encoding failed"))?;
    if candidate_bytes.len() != expected_bytes.len() {
        return Ok(false);
    }
    Ok(expected_bytes.ct_eq(&candidate_bytes).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_is_deterministic_lowercase_hex() {
        let sig = sign("secret", b"payload").unwrap();
        assert_eq!(sig, sign("secret", b"payload").unwrap());
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_verify_roundtrip() {
        let sig = sign("secret", b"payload").unwrap();
        assert!(verify("secret", b"payload", &sig).unwrap());
        assert!(!verify("secret", b"tampered", &sig).unwrap());
        assert!(!verify("other", b"payload", &sig).unwrap());
    }

    #[test]
    fn test_malformed_candidate_is_false_not_error() {
        assert!(!verify("secret", b"payload", "not-hex").unwrap());
        assert!(!verify("secret", b"payload", "abcd").unwrap());
    }
}
