//! ALFA Identity Vault - Key Material
//!
//! Secret wrappers for the session master key, per-record keys and
//! template-derived secrets. All of them zeroize when dropped.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret, SecretVec};

/// Key length for AES-256
pub const KEY_LEN: usize = 32;

/// Nonce length for AES-GCM
pub const NONCE_LEN: usize = 12;

/// Salt length for helper data and session salts
pub const SALT_LEN: usize = 16;

/// Length of the helper decorrelation nonce
pub const HELPER_RANDOM_LEN: usize = 32;

/// Default derived secret length (256 bits)
pub const SECRET_LEN: usize = 32;

/// Session master key, derived from the passphrase. Never persisted.
pub struct MasterKey {
    inner: Secret<[u8; KEY_LEN]>,
}

impl MasterKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    /// Expose the key bytes (use with caution)
    pub(crate) fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Fresh symmetric key protecting a single enrollment record
pub struct RecordKey {
    inner: Secret<[u8; KEY_LEN]>,
}

impl RecordKey {
    /// Generate a random key from the OS entropy source
    pub fn generate() -> Self {
        Self::from_bytes(random_bytes::<KEY_LEN>())
    }

    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecordKey([REDACTED])")
    }
}

/// Secret K derived from template bytes and a salt
pub struct DerivedSecret {
    inner: SecretVec<u8>,
}

impl DerivedSecret {
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            inner: SecretVec::new(bytes),
        }
    }

    pub fn expose(&self) -> &[u8] {
        self.inner.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.expose().len()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl fmt::Debug for DerivedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedSecret([REDACTED; {}])", self.len())
    }
}

/// Fill a fixed-size array from the OS entropy source
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate a random nonce for AES-GCM
pub(crate) fn generate_nonce() -> [u8; NONCE_LEN] {
    random_bytes::<NONCE_LEN>()
}

/// Generate a random salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    random_bytes::<SALT_LEN>()
}
