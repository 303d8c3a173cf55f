//! # ALFA Identity Vault
//!
//! Biometric template protection with offline-first sync.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   ALFA IDENTITY VAULT                     │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐  │
//! │  │ ENROLLMENT  │  │   MATCHER   │  │  SYNC RECONCILER │  │
//! │  │ + TEMPLATE  │  │  Euclidean  │  │  content store + │  │
//! │  │   HELPER    │  │  threshold  │  │  ledger commit   │  │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬─────────┘  │
//! │         │                │                   │            │
//! │  ┌──────┴────────────────┴───────────────────┴─────────┐ │
//! │  │        SESSION (MasterKey, PBKDF2 / Argon2id)        │ │
//! │  │    RecordKey ─AES-256-GCM─> helper payload           │ │
//! │  │    MasterKey ─AES-256-GCM─> wrapped RecordKey        │ │
//! │  └──────────────────────────────────────────────────────┘ │
//! │                                                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐  │
//! │  │ RECORD STORE│  │ BLOB STORE  │  │  CODEC           │  │
//! │  │  (SQLite)   │  │  (samples)  │  │  base64/hex/f32  │  │
//! │  └─────────────┘  └─────────────┘  └──────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - Helper data (template + derived secret K) only leaves memory encrypted
//! - Sample images are sealed under their record key, locally and remotely
//! - One fresh AES-256-GCM key per record, wrapped under the session master key
//! - The master key lives only for the session and is zeroized on lock
//! - Published identity commitment = SHA-256(K)
//! - Remote stores and ledgers only see ciphertext and commitments

pub mod codec;
pub mod crypto;
pub mod session;
pub mod template;
pub mod matcher;
pub mod record;
pub mod store;
pub mod blob_store;
pub mod remote;
pub mod sync;
pub mod enrollment;
pub mod config;
pub mod vault;
pub mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use config::IdentityConfig;
pub use enrollment::{EmbeddingExtractor, Enroller, IdentifyOutcome, Identification};
pub use error::{IdentityError, IdentityResult};
pub use matcher::{distance, is_match, MatchOutcome};
pub use record::{EncryptedRecord, RecordState, RemoteBundle, SealedSample};
pub use session::Session;
pub use store::{MemoryRecordStore, RecordStore, SqliteRecordStore};
pub use sync::{SyncOptions, SyncOutcome, SyncReconciler, SyncReport};
pub use template::{compute_identity_commitment, create_helper, Embedding, Helper, IdentityCommitment};
pub use vault::IdentityVault;

/// ALFA Identity Vault version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
