//! Password hardening: Argon2id (password, salt) → session key

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit key owned by one transfer. Zeroized on drop.
#[derive(Clone)]
pub struct SessionKey {
    bytes: [u8; KEY_SIZE],
}

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id cost parameters. Encryptor and decryptor must agree on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub mem_cost_kib: u32,
    /// Passes over memory
    pub time_cost: u32,
    /// Lanes
    pub parallelism: u32,
}

impl KdfParams {
    /// 64 MiB, 2 passes: completes well under a second on commodity hardware.
    pub fn interactive() -> Self {
        Self {
            mem_cost_kib: 64 * 1024,
            time_cost: 2,
            parallelism: 1,
        }
    }

    /// 1 GiB, 4 passes.
    pub fn sensitive() -> Self {
        Self {
            mem_cost_kib: 1024 * 1024,
            time_cost: 4,
            parallelism: 1,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Generate a fresh random password salt.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive a session key from a password and public salt using Argon2id.
///
/// CPU and memory heavy; async callers should run it under `spawn_blocking`.
pub fn derive_session_key(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> Result<SessionKey, CryptoError> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::Kdf(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::Kdf(format!("Argon2id failed: {e}")))?;

    let session = SessionKey::from_bytes(key);
    key.zeroize();
    Ok(session)
}
