//! HMAC-SHA256 webhook signatures.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Optional scheme prefix on the signature header.
const PREFIX: &str = "sha256=";

/// Signature verification failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,

    #[error("signature is not valid hex")]
    Malformed,

    #[error("signature mismatch")]
    Mismatch,

    #[error("unusable signing secret")]
    InvalidKey,
}

/// Verifies hex HMAC-SHA256 signatures over raw request bodies.
#[derive(Clone)]
pub struct SignatureVerifier {
    keyed: HmacSha256,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, SignatureError> {
        let keyed = HmacSha256::new_from_slice(secret.as_ref()).map_err(|_| SignatureError::InvalidKey)?;
        Ok(Self { keyed })
    }

    fn mac(&self) -> HmacSha256 {
        self.keyed.clone()
    }

    /// Hex signature for `body`, without prefix.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check `header` against `body` in constant time.
    pub fn verify(&self, body: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
        let header = header.map(str::trim).filter(|h| !h.is_empty()).ok_or(SignatureError::Missing)?;
        let hex_sig = header.strip_prefix(PREFIX).unwrap_or(header);
        let expected = hex::decode(hex_sig).map_err(|_| SignatureError::Malformed)?;

        let mut mac = self.mac();
        mac.update(body);
        mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"id":"evt_1","type":"message.status","data":{}}"#;

    #[test]
    fn test_sign_and_verify() {
        let v = SignatureVerifier::new("topsecret").unwrap();
        let sig = v.sign(BODY);
        assert_eq!(sig.len(), 64);
        assert!(v.verify(BODY, Some(&sig)).is_ok());
        assert!(v.verify(BODY, Some(&format!("sha256={sig}"))).is_ok());
    }

    #[test]
    fn test_rejects_tampering_and_wrong_secret() {
        let v = SignatureVerifier::new("topsecret").unwrap();
        let sig = v.sign(BODY);
        assert_eq!(v.verify(b"{}", Some(&sig)), Err(SignatureError::Mismatch));

        let other = SignatureVerifier::new("another").unwrap();
        assert_eq!(other.verify(BODY, Some(&sig)), Err(SignatureError::Mismatch));
    }

    #[test]
    fn test_missing_and_malformed() {
        let v = SignatureVerifier::new("topsecret").unwrap();
        assert_eq!(v.verify(BODY, None), Err(SignatureError::Missing));
        assert_eq!(v.verify(BODY, Some("  ")), Err(SignatureError::Missing));
        assert_eq!(v.verify(BODY, Some("sha256=zz")), Err(SignatureError::Malformed));
        // Valid hex, wrong length.
        assert_eq!(v.verify(BODY, Some("abcd")), Err(SignatureError::Mismatch));
    }
}
