//! ALFA Identity Vault - Key Derivation
//!
//! Passphrase -> MasterKey (PBKDF2-HMAC-SHA256 by default, Argon2id optional)
//! and template bytes + salt -> DerivedSecret (HKDF-SHA256).

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::Hmac;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::keys::{DerivedSecret, MasterKey, KEY_LEN};
use crate::error::{IdentityError, IdentityResult};

/// Lowest accepted PBKDF2 iteration count
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Default PBKDF2 iteration count
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 200_000;

/// Password hashing parameters for the master key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum KdfParams {
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256 { iterations: u32 },

    #[serde(rename = "argon2id")]
    Argon2id {
        memory_kib: u32,
        time_cost: u32,
        parallelism: u32,
    },
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams::Pbkdf2Sha256 {
            iterations: DEFAULT_PBKDF2_ITERATIONS,
        }
    }
}

impl KdfParams {
    /// Argon2id with 64 MiB, 3 passes, 4 lanes
    pub fn argon2id_default() -> Self {
        KdfParams::Argon2id {
            memory_kib: 64 * 1024, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KdfParams::Pbkdf2Sha256 { .. } => "PBKDF2-HMAC-SHA256",
            KdfParams::Argon2id { .. } => "Argon2id",
        }
    }
}

/// Derive the session master key with PBKDF2-HMAC-SHA256
pub fn derive_master_key(
    passphrase: &SecretString,
    salt: &[u8],
    iterations: u32,
) -> IdentityResult<MasterKey> {
    derive_master_key_with(passphrase, salt, &KdfParams::Pbkdf2Sha256 { iterations })
}

/// Derive the session master key with explicit KDF parameters
///
/// Inputs are validated before any hashing work starts.
pub fn derive_master_key_with(
    passphrase: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> IdentityResult<MasterKey> {
    if passphrase.expose_secret().is_empty() {
        return Err(IdentityError::WeakInput("passphrase must not be empty".into()));
    }
    if salt.is_empty() {
        return Err(IdentityError::InvalidSalt);
    }

    let mut output = Zeroizing::new([0u8; KEY_LEN]);
    let password = passphrase.expose_secret().as_bytes();

    match *params {
        KdfParams::Pbkdf2Sha256 { iterations } => {
            if iterations < MIN_PBKDF2_ITERATIONS {
                return Err(IdentityError::WeakInput(format!(
                    "PBKDF2 iterations {} below minimum {}",
                    iterations, MIN_PBKDF2_ITERATIONS
                )));
            }
            pbkdf2_sha256(password, salt, iterations, &mut output[..])?;
        }
        KdfParams::Argon2id {
            memory_kib,
            time_cost,
            parallelism,
        } => {
            let params = Params::new(memory_kib, time_cost, parallelism, Some(KEY_LEN))
                .map_err(|e| IdentityError::KeyDerivationFailed(e.to_string()))?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                .hash_password_into(password, salt, &mut output[..])
                .map_err(|e| IdentityError::KeyDerivationFailed(e.to_string()))?;
        }
    }

    Ok(MasterKey::from_bytes(*output))
}

fn pbkdf2_sha256(password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8]) -> IdentityResult<()> {
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password, salt, rounds, out)
        .map_err(|e| IdentityError::KeyDerivationFailed(e.to_string()))
}

/// Derive a secret from template bytes and a salt using HKDF-SHA256
///
/// `output_bits` must be a positive multiple of 8.
pub fn derive_secret(
    template_bytes: &[u8],
    salt: &[u8],
    output_bits: usize,
) -> IdentityResult<DerivedSecret> {
    if salt.is_empty() {
        return Err(IdentityError::InvalidSalt);
    }
    if output_bits == 0 || output_bits % 8 != 0 {
        return Err(IdentityError::KeyDerivationFailed(format!(
            "output length of {} bits is not a positive whole number of bytes",
            output_bits
        )));
    }

    let hk = Hkdf::<Sha256>::new(Some(salt), template_bytes);
    let mut okm = vec![0u8; output_bits / 8];

    hk.expand(&[], &mut okm)
        .map_err(|e| IdentityError::KeyDerivationFailed(e.to_string()))?;

    Ok(DerivedSecret::from_vec(okm))
}
