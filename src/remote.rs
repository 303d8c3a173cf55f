//! ALFA Identity Vault - Remote Collaborators
//!
//! Content-addressed store and ledger interfaces, plus local stand-ins:
//! a directory store (USB drive / NAS mount) and an append-only journal
//! ledger. Only encrypted bundles and commitments ever reach these.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::codec;
use crate::error::{IdentityError, IdentityResult};
use crate::record::LedgerReceipt;
use crate::template::IdentityCommitment;

/// Content-addressed remote store; `put` may deliver more than once
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> IdentityResult<String>;

    async fn get(&self, content_id: &str) -> IdentityResult<Vec<u8>>;
}

/// Ledger that records identity commitments
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn commit(
        &self,
        commitment: &IdentityCommitment,
        pointer: &str,
    ) -> IdentityResult<LedgerReceipt>;
}

/// Content id: lowercase SHA-256 hex of the bytes
pub fn content_id(bytes: &[u8]) -> String {
    codec::bytes_to_hex(&Sha256::digest(bytes))
}

fn transport(e: std::io::Error) -> IdentityError {
    IdentityError::Network(e.to_string())
}

// ═══════════════════════════════════════════════════════════════════════════
// DIRECTORY CONTENT STORE
// ═══════════════════════════════════════════════════════════════════════════

/// Content store backed by a directory, one file per content id
pub struct DirContentStore {
    root: PathBuf,
}

impl DirContentStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn object_path(&self, content_id: &str) -> IdentityResult<PathBuf> {
        let valid = content_id.len() == 64
            && content_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if !valid {
            return Err(IdentityError::InvalidEncoding(format!(
                "invalid content id {:?}",
                content_id
            )));
        }
        Ok(self.root.join(format!("{}.json", content_id)))
    }
}

#[async_trait]
impl ContentStore for DirContentStore {
    async fn put(&self, bytes: Vec<u8>) -> IdentityResult<String> {
        let cid = content_id(&bytes);
        let path = self.object_path(&cid)?;

        if tokio::fs::try_exists(&path).await.map_err(transport)? {
            log::debug!("Content {} already present", cid);
            return Ok(cid);
        }

        tokio::fs::create_dir_all(&self.root).await.map_err(transport)?;
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &bytes).await.map_err(transport)?;
        tokio::fs::rename(&temp_path, &path).await.map_err(transport)?;

        log::info!("Stored content {} ({} bytes)", cid, bytes.len());
        Ok(cid)
    }

    async fn get(&self, content_id_str: &str) -> IdentityResult<Vec<u8>> {
        let path = self.object_path(content_id_str)?;

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IdentityError::RecordNotFound(content_id_str.to_string()))
            }
            Err(e) => return Err(transport(e)),
        };

        if content_id(&bytes) != content_id_str {
            return Err(IdentityError::IntegrityMismatch(content_id_str.to_string()));
        }
        Ok(bytes)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// JOURNAL LEDGER
// ═══════════════════════════════════════════════════════════════════════════

/// One committed entry, stored as a JSON line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub block_ref: u64,
    pub tx_hash: String,
    pub commitment: IdentityCommitment,
    pub pointer: String,
    pub timestamp: i64,
}

/// Append-only JSON-lines ledger; block refs count entries from 1
pub struct JournalLedger {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JournalLedger {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// All entries in commit order
    pub async fn entries(&self) -> IdentityResult<Vec<JournalEntry>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(transport(e)),
        };

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(IdentityError::from))
            .collect()
    }
}

#[async_trait]
impl LedgerClient for JournalLedger {
    async fn commit(
        &self,
        commitment: &IdentityCommitment,
        pointer: &str,
    ) -> IdentityResult<LedgerReceipt> {
        let _guard = self.lock.lock().await;

        let block_ref = self.entries().await?.len() as u64 + 1;

        let mut hasher = Sha256::new();
        hasher.update(commitment.as_bytes());
        hasher.update(pointer.as_bytes());
        hasher.update(block_ref.to_be_bytes());
        let tx_hash = format!("0x{}", codec::bytes_to_hex(&hasher.finalize()));

        let entry = JournalEntry {
            block_ref,
            tx_hash: tx_hash.clone(),
            commitment: *commitment,
            pointer: pointer.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(transport)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(transport)?;
        file.write_all(line.as_bytes()).await.map_err(transport)?;
        file.sync_all().await.map_err(transport)?;

        log::info!("Committed {} at block {}", commitment, block_ref);
        Ok(LedgerReceipt {
            success: true,
            tx_hash,
            block_ref,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::compute_identity_commitment;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_dir_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = DirContentStore::new(&dir.path().join("remote"));

        let cid = store.put(b"bundle".to_vec()).await.unwrap();
        assert_eq!(cid, content_id(b"bundle"));
        assert_eq!(store.get(&cid).await.unwrap(), b"bundle");

        // same bytes, same id
        assert_eq!(store.put(b"bundle".to_vec()).await.unwrap(), cid);
    }

    #[tokio::test]
    async fn test_dir_store_detects_tampering() {
        let dir = tempdir().unwrap();
        let store = DirContentStore::new(dir.path());
        let cid = store.put(b"original".to_vec()).await.unwrap();

        std::fs::write(dir.path().join(format!("{}.json", cid)), b"swapped").unwrap();

        assert!(matches!(
            store.get(&cid).await,
            Err(IdentityError::IntegrityMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_dir_store_bad_ids() {
        let dir = tempdir().unwrap();
        let store = DirContentStore::new(dir.path());

        assert!(matches!(
            store.get("../../secret").await,
            Err(IdentityError::InvalidEncoding(_))
        ));
        assert!(matches!(
            store.get(&content_id(b"missing")).await,
            Err(IdentityError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_journal_ledger_appends() {
        let dir = tempdir().unwrap();
        let ledger = JournalLedger::new(&dir.path().join("ledger.jsonl"));
        let c1 = compute_identity_commitment(b"one");
        let c2 = compute_identity_commitment(b"two");

        let r1 = ledger.commit(&c1, "cid-1").await.unwrap();
        let r2 = ledger.commit(&c2, "cid-2").await.unwrap();

        assert!(r1.success);
        assert_eq!(r1.block_ref, 1);
        assert_eq!(r2.block_ref, 2);
        assert_ne!(r1.tx_hash, r2.tx_hash);
        assert_eq!(r1.tx_hash.len(), 66);

        let entries = ledger.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].commitment, c2);
        assert_eq!(entries[1].pointer, "cid-2");
    }
}
