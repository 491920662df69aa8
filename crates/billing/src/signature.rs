//! Keyed-hash verification of payment notifications.
//!
//! The provider signs the exact raw request body with the shared secret and
//! sends the hex digest in a header. Comparison goes through
//! `Mac::verify_slice`, which is constant-time.

use funnel_core::config::SignatureAlgorithm;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    algorithm: SignatureAlgorithm,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl AsRef<[u8]>, algorithm: SignatureAlgorithm) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            algorithm,
        }
    }

    /// Hex digest of `body`, as the provider would send it.
    pub fn sign(&self, body: &[u8]) -> String {
        match self.algorithm {
            SignatureAlgorithm::Sha256 => {
                let mut mac = HmacSha256::new_from_slice(&self.secret)
                    .expect("HMAC accepts any key length");
                mac.update(body);
                hex::encode(mac.finalize().into_bytes())
            }
            SignatureAlgorithm::Sha512 => {
                let mut mac = HmacSha512::new_from_slice(&self.secret)
                    .expect("HMAC accepts any key length");
                mac.update(body);
                hex::encode(mac.finalize().into_bytes())
            }
        }
    }

    /// `false` for a missing, non-hex or mismatching signature.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> bool {
        let Some(expected) = signature.and_then(|s| hex::decode(s.trim()).ok()) else {
            return false;
        };
        match self.algorithm {
            SignatureAlgorithm::Sha256 => HmacSha256::new_from_slice(&self.secret)
                .map(|mut mac| {
                    mac.update(body);
                    mac.verify_slice(&expected).is_ok()
                })
                .unwrap_or(false),
            SignatureAlgorithm::Sha512 => HmacSha512::new_from_slice(&self.secret)
                .map(|mut mac| {
                    mac.update(body);
                    mac.verify_slice(&expected).is_ok()
                })
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"order_id":"A_pack20_1","payment_status":"finished"}"#;

    #[test]
    fn test_round_trip_both_algorithms() {
        for algorithm in [SignatureAlgorithm::Sha256, SignatureAlgorithm::Sha512] {
            let verifier = SignatureVerifier::new("ipn-secret", algorithm);
            let signature = verifier.sign(BODY);
            assert!(verifier.verify(BODY, Some(&signature)));
        }
    }

    #[test]
    fn test_sha512_digest_length() {
        let verifier = SignatureVerifier::new("ipn-secret", SignatureAlgorithm::Sha512);
        assert_eq!(verifier.sign(BODY).len(), 128);
    }

    #[test]
    fn test_tampered_body_rejected() {
        let verifier = SignatureVerifier::new("ipn-secret", SignatureAlgorithm::Sha512);
        let signature = verifier.sign(BODY);
        let tampered = br#"{"order_id":"B_pack80_1","payment_status":"finished"}"#;
        assert!(!verifier.verify(tampered, Some(&signature)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let signer = SignatureVerifier::new("other", SignatureAlgorithm::Sha256);
        let verifier = SignatureVerifier::new("ipn-secret", SignatureAlgorithm::Sha256);
        assert!(!verifier.verify(BODY, Some(&signer.sign(BODY))));
    }

    #[test]
    fn test_missing_or_garbage_signature_rejected() {
        let verifier = SignatureVerifier::new("ipn-secret", SignatureAlgorithm::Sha512);
        assert!(!verifier.verify(BODY, None));
        assert!(!verifier.verify(BODY, Some("not-hex")));
        assert!(!verifier.verify(BODY, Some("")));
    }
}
