//! ALFA Identity Vault - AEAD Envelope
//!
//! AES-256-GCM for helper payloads (under the record key) and for wrapping
//! record keys (under the session master key). Nonces are generated inside
//! `seal`, so callers cannot supply or reuse one.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::keys::{generate_nonce, MasterKey, RecordKey, KEY_LEN, NONCE_LEN};
use crate::codec::base64_bytes;
use crate::error::{IdentityError, IdentityResult};

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Ciphertext (with tag) and the nonce it was sealed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
}

/// Record key encrypted under the master key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
}

fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> IdentityResult<Sealed> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| IdentityError::EncryptionFailed(e.to_string()))?;

    let iv = generate_nonce();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| IdentityError::EncryptionFailed(e.to_string()))?;

    Ok(Sealed { ciphertext, iv })
}

fn open(key: &[u8; KEY_LEN], ciphertext: &[u8], iv: &[u8]) -> IdentityResult<Vec<u8>> {
    // A malformed nonce or truncated body is corrupted data, same as a bad tag
    if iv.len() != NONCE_LEN || ciphertext.len() < TAG_LEN {
        return Err(IdentityError::AuthenticationFailed);
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| IdentityError::AuthenticationFailed)?;

    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| IdentityError::AuthenticationFailed)
}

/// Encrypt a payload under a record key with a fresh random IV
pub fn encrypt(key: &RecordKey, plaintext: &[u8]) -> IdentityResult<Sealed> {
    seal(key.expose(), plaintext)
}

/// Decrypt a payload; any tampering or wrong key yields `AuthenticationFailed`
pub fn decrypt(key: &RecordKey, ciphertext: &[u8], iv: &[u8]) -> IdentityResult<Vec<u8>> {
    open(key.expose(), ciphertext, iv)
}

/// Wrap a record key under the master key
pub fn wrap_key(master: &MasterKey, record_key: &RecordKey) -> IdentityResult<WrappedKey> {
    let sealed = seal(master.expose(), record_key.expose())?;
    Ok(WrappedKey {
        ciphertext: sealed.ciphertext,
        iv: sealed.iv.to_vec(),
    })
}

/// Unwrap a record key; a foreign master key fails authentication
pub fn unwrap_key(master: &MasterKey, wrapped: &WrappedKey) -> IdentityResult<RecordKey> {
    let raw = Zeroizing::new(open(master.expose(), &wrapped.ciphertext, &wrapped.iv)?);

    if raw.len() != KEY_LEN {
        return Err(IdentityError::AuthenticationFailed);
    }

    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&raw);
    Ok(RecordKey::from_bytes(bytes))
}
