//! ALFA Identity Vault - Cryptographic Core
//!
//! Key material, key derivation and the AES-256-GCM envelope.

pub mod keys;
pub mod kdf;
pub mod aead;

pub use keys::*;
pub use kdf::*;
pub use aead::*;
