//! Deploy-keyed HMAC-SHA256 for worker secrets and bearer tokens.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum HasherError {
    #[error("secret hashing key is empty; set ONLYBOXES_HMAC_KEY")]
    EmptyKey,
}

/// Keyed hasher shared by every credential lookup path.
///
/// The key is deploy-wide and required at startup. Hashes are lowercase
/// hex so they can serve directly as unique index values.
#[derive(Clone)]
pub struct SecretHasher {
    key: Vec<u8>,
}

impl SecretHasher {
    pub fn new(key: &str) -> Result<Self, HasherError> {
        if key.is_empty() {
            return Err(HasherError::EmptyKey);
        }
        Ok(Self {
            key: key.as_bytes().to_vec(),
        })
    }

    /// HMAC-SHA256 of `secret`, hex-encoded.
    pub fn hash(&self, secret: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        mac.update(secret.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison of `secret` against a stored hex hash.
    pub fn verify(&self, secret: &str, stored_hex: &str) -> bool {
        let Ok(stored) = hex::decode(stored_hex) else {
            return false;
        };
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        mac.update(secret.as_bytes());
        mac.verify_slice(&stored).is_ok()
    }
}

impl std::fmt::Debug for SecretHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the key
        f.debug_struct("SecretHasher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_key_is_fatal() {
        assert!(SecretHasher::new("").is_err());
    }

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = SecretHasher::new("deploy-key").unwrap();
        assert_eq!(hasher.hash("obx_abc"), hasher.hash("obx_abc"));
        assert_ne!(hasher.hash("obx_abc"), hasher.hash("obx_abd"));
    }

    #[test]
    fn test_hash_depends_on_key() {
        let a = SecretHasher::new("key-a").unwrap();
        let b = SecretHasher::new("key-b").unwrap();
        assert_ne!(a.hash("obx_abc"), b.hash("obx_abc"));
    }

    #[test]
    fn test_verify() {
        let hasher = SecretHasher::new("deploy-key").unwrap();
        let stored = hasher.hash("obx_secret");
        assert!(hasher.verify("obx_secret", &stored));
        assert!(!hasher.verify("obx_other", &stored));
        assert!(!hasher.verify("obx_secret", "zz-not-hex"));
    }

    #[test]
    fn test_hash_is_hex_sha256_sized() {
        let hasher = SecretHasher::new("deploy-key").unwrap();
        assert_eq!(hasher.hash("x").len(), 64);
    }
}
