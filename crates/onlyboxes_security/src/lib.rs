//! Credential handling for the Onlyboxes console.
//!
//! Two hash families, never mixed:
//! - worker secrets and bearer tokens use a deploy-keyed HMAC-SHA256
//!   (deterministic, so the hash can serve as the lookup key);
//! - account passwords use bcrypt (offline brute-force resistance).

pub mod hasher;
pub mod password;
pub mod secrets;

pub use hasher::{HasherError, SecretHasher};
pub use password::{hash_password, verify_password, PasswordError};
pub use secrets::{generate_cookie, generate_secret, mask_secret};
