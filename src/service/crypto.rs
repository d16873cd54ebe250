//! Shared secret handling.

use sha2::{Digest, Sha256};
use thiserror::Error;

const KEY_CONTEXT: &[u8] = b"xsocksd shared secret v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("secret must not be empty")]
    EmptySecret,
}

/// Key material derived once from the configured secret.
pub struct SharedSecret {
    key: [u8; 32],
}

impl SharedSecret {
    /// Derive the key from `secret`. Fails on an empty secret.
    pub fn init(secret: &str) -> Result<Self, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::EmptySecret);
        }
        Ok(Self {
            key: derive(secret.as_bytes()),
        })
    }

    /// Derived key bytes.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Check a presented credential in constant time.
    pub fn verify(&self, candidate: &[u8]) -> bool {
        let presented = derive(candidate);
        presented
            .iter()
            .zip(self.key.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").field("key", &"<redacted>").finish()
    }
}

fn derive(secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KEY_CONTEXT);
    hasher.update(secret);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_secret_fails_init() {
        assert_eq!(SharedSecret::init("").unwrap_err(), CryptoError::EmptySecret);
    }

    #[test]
    fn verifies_only_the_configured_secret() {
        let secret = SharedSecret::init("s3cret").unwrap();
        assert!(secret.verify(b"s3cret"));
        assert!(!secret.verify(b"s3cret "));
        assert!(!secret.verify(b""));
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = SharedSecret::init("s3cret").unwrap();
        let b = SharedSecret::init("s3cret").unwrap();
        let c = SharedSecret::init("other").unwrap();
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn debug_output_hides_key() {
        let secret = SharedSecret::init("s3cret").unwrap();
        assert!(format!("{secret:?}").contains("redacted"));
    }
}
