//! ALFA Identity Vault - Encrypted Records
//!
//! Envelope-encrypted enrollment records and their persisted JSON layout:
//!
//! ```text
//! {id, ciphertext, iv, wrappedKey: {ciphertext, iv}, identityCommitment: "0x..",
//!  state, remotePointer?, createdAt (epoch ms), ...}
//! ```
//!
//! The helper payload is sealed under a fresh `RecordKey`; the record key is
//! wrapped under the session master key. A sample image, when kept, is sealed
//! under the same record key and travels inside the uploaded bundle. Unknown
//! fields are ignored on read.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::codec::base64_bytes;
use crate::crypto::{self, RecordKey, WrappedKey};
use crate::error::{IdentityError, IdentityResult};
use crate::session::Session;
use crate::template::{Helper, IdentityCommitment};

/// Version tag written into uploaded bundles
pub const BUNDLE_VERSION: u32 = 1;

/// Sync state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Local only, waiting for upload
    Pending,
    /// Published to the content store (terminal)
    Uploaded,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Uploaded => "uploaded",
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a ledger commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    pub success: bool,
    pub tx_hash: String,
    pub block_ref: u64,
}

/// Encrypted enrollment record as stored on the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRecord {
    pub id: String,
    /// Helper payload sealed under the record key
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    pub wrapped_key: WrappedKey,
    pub identity_commitment: IdentityCommitment,
    pub state: RecordState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_pointer: Option<String>,
    /// Epoch milliseconds
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Blob store key of the sealed sample image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_receipt: Option<LedgerReceipt>,
}

impl EncryptedRecord {
    /// Encrypt a helper into a new pending record
    pub fn seal(session: &Session, helper: &Helper, label: Option<String>) -> IdentityResult<Self> {
        let record_key = RecordKey::generate();
        let payload = helper.to_payload()?;
        let sealed = crypto::encrypt(&record_key, &payload)?;
        let wrapped_key = session.wrap_key(&record_key)?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            ciphertext: sealed.ciphertext,
            iv: sealed.iv.to_vec(),
            wrapped_key,
            identity_commitment: helper.commitment(),
            state: RecordState::Pending,
            remote_pointer: None,
            created_at: Utc::now().timestamp_millis(),
            uploaded_at: None,
            label,
            sample_key: None,
            ledger_receipt: None,
        })
    }

    /// Unwrap the record key and decrypt the helper
    pub fn open(&self, session: &Session) -> IdentityResult<Helper> {
        let record_key = session.unwrap_key(&self.wrapped_key)?;
        let payload = Zeroizing::new(crypto::decrypt(&record_key, &self.ciphertext, &self.iv)?);
        Helper::from_payload(&payload)
    }

    /// Seal a sample image under this record's key (fresh IV)
    pub fn seal_sample(&self, session: &Session, sample: &[u8]) -> IdentityResult<SealedSample> {
        let record_key = session.unwrap_key(&self.wrapped_key)?;
        let sealed = crypto::encrypt(&record_key, sample)?;
        Ok(SealedSample {
            ciphertext: sealed.ciphertext,
            iv: sealed.iv.to_vec(),
        })
    }

    pub fn open_sample(&self, session: &Session, sample: &SealedSample) -> IdentityResult<Zeroizing<Vec<u8>>> {
        let record_key = session.unwrap_key(&self.wrapped_key)?;
        Ok(Zeroizing::new(crypto::decrypt(&record_key, &sample.ciphertext, &sample.iv)?))
    }

    pub fn is_pending(&self) -> bool {
        self.state == RecordState::Pending
    }

    pub fn is_uploaded(&self) -> bool {
        self.state == RecordState::Uploaded
    }

    /// Copy of this record moved to `uploaded` with its remote pointer
    pub fn mark_uploaded(&self, pointer: String) -> IdentityResult<Self> {
        if !self.is_pending() {
            return Err(IdentityError::InvalidState(format!(
                "record {} is already {}",
                self.id, self.state
            )));
        }

        let mut next = self.clone();
        next.state = RecordState::Uploaded;
        next.remote_pointer = Some(pointer);
        next.uploaded_at = Some(Utc::now().timestamp_millis());
        Ok(next)
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_at).single()
    }

    pub fn to_json(&self) -> IdentityResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> IdentityResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Sample image encrypted under its record key; the blob store and the
/// remote bundle only ever hold this form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSample {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
}

impl SealedSample {
    pub fn to_bytes(&self) -> IdentityResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> IdentityResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// REMOTE BUNDLE
// ═══════════════════════════════════════════════════════════════════════════

/// What gets published to the content store: ciphertext and metadata only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBundle {
    pub version: u32,
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    pub wrapped_key: WrappedKey,
    pub identity_commitment: IdentityCommitment,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<SealedSample>,
}

impl RemoteBundle {
    pub fn from_record(record: &EncryptedRecord) -> Self {
        Self {
            version: BUNDLE_VERSION,
            id: record.id.clone(),
            ciphertext: record.ciphertext.clone(),
            iv: record.iv.clone(),
            wrapped_key: record.wrapped_key.clone(),
            identity_commitment: record.identity_commitment,
            created_at: record.created_at,
            sample: None,
        }
    }

    pub fn with_sample(mut self, sample: SealedSample) -> Self {
        self.sample = Some(sample);
        self
    }

    pub fn to_bytes(&self) -> IdentityResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> IdentityResult<Self> {
        let bundle: RemoteBundle = serde_json::from_slice(bytes)?;
        if bundle.version != BUNDLE_VERSION {
            return Err(IdentityError::InvalidEncoding(format!(
                "unsupported bundle version {}",
                bundle.version
            )));
        }
        Ok(bundle)
    }

    /// Rebuild the local record this bundle was published from
    ///
    /// The sample, if any, is returned separately; the caller decides where
    /// it is stored and sets `sample_key`.
    pub fn into_record(self, pointer: String) -> (EncryptedRecord, Option<SealedSample>) {
        let record = EncryptedRecord {
            id: self.id,
            ciphertext: self.ciphertext,
            iv: self.iv,
            wrapped_key: self.wrapped_key,
            identity_commitment: self.identity_commitment,
            state: RecordState::Uploaded,
            remote_pointer: Some(pointer),
            created_at: self.created_at,
            uploaded_at: None,
            label: None,
            sample_key: None,
            ledger_receipt: None,
        };
        (record, self.sample)
    }
}
