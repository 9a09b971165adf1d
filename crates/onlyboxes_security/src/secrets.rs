//! Secret and cookie generation, plus display masking.

use onlyboxes_protocol::defaults::SECRET_PREFIX;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng, RngCore};

const SECRET_LEN: usize = 40;
const MASK_SUFFIX_LEN: usize = 4;

/// Generate a worker secret or access token: `obx_` + 40 random
/// alphanumerics from the thread-local CSPRNG.
pub fn generate_secret() -> String {
    let body: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect();
    format!("{SECRET_PREFIX}{body}")
}

/// Generate an opaque dashboard session cookie (32 random bytes, hex).
pub fn generate_cookie() -> String {
    let mut bytes = [0u8; 32];
    thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Display form of a secret: prefix, stars, last four characters.
///
/// `obx_aB3…x9Zq` becomes `obx_******x9Zq`. Values too short to mask
/// safely are fully starred.
pub fn mask_secret(secret: &str) -> String {
    let body = secret.strip_prefix(SECRET_PREFIX).unwrap_or(secret);
    if body.len() <= MASK_SUFFIX_LEN {
        return format!("{SECRET_PREFIX}******");
    }
    let suffix = &body[body.len() - MASK_SUFFIX_LEN..];
    format!("{SECRET_PREFIX}******{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_secret_shape() {
        let secret = generate_secret();
        assert!(secret.starts_with("obx_"));
        assert_eq!(secret.len(), 4 + SECRET_LEN);
        assert!(secret[4..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_secrets_are_unique() {
        assert_ne!(generate_secret(), generate_secret());
        assert_ne!(generate_cookie(), generate_cookie());
    }

    #[test]
    fn test_mask_keeps_suffix_only() {
        let masked = mask_secret("obx_abcdefghij1f2e");
        assert_eq!(masked, "obx_******1f2e");
        assert!(!masked.contains("abcdef"));
    }

    #[test]
    fn test_mask_short_value() {
        assert_eq!(mask_secret("obx_ab"), "obx_******");
    }
}
