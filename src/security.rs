//! Queue password hashing — the only auth surface this service owns.
//!
//! Queue creation hashes the caller-supplied password; every subsequent
//! operation against that queue re-verifies it against the stored hash.
//! The cost parameters come from `SecurityConfig` so operators can tune
//! them without a code change.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Argon2, Params, Version};

use crate::config::SecurityConfig;
use crate::errors::AppResult;

fn build_argon2(config: &SecurityConfig) -> AppResult<Argon2<'static>> {
    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        None,
    )
    .map_err(|err| crate::errors::AppError::internal(format!("invalid argon2 params: {err}")))?;

    Ok(Argon2::new(
        argon2::Algorithm::Argon2id,
        Version::V0x13,
        params,
    ))
}

/// Hashes a plaintext queue password into a PHC string suitable for storage.
pub fn hash_password(config: &SecurityConfig, plain: &str) -> AppResult<String> {
    let argon2 = build_argon2(config)?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2.hash_password(plain.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verifies a plaintext queue password against a stored PHC hash.
pub fn verify_password(config: &SecurityConfig, plain: &str, stored_hash: &str) -> AppResult<bool> {
    let argon2 = build_argon2(config)?;
    let parsed = PasswordHash::new(stored_hash)?;
    Ok(argon2.verify_password(plain.as_bytes(), &parsed).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_round_trips() {
        let config = SecurityConfig::default();
        let hash = hash_password(&config, "correct horse battery staple").unwrap();
        assert!(verify_password(&config, "correct horse battery staple", &hash).unwrap());
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let config = SecurityConfig::default();
        let hash = hash_password(&config, "right-password").unwrap();
        assert!(!verify_password(&config, "wrong-password", &hash).unwrap());
    }
}
