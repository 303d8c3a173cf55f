//! Shared fixtures and remote doubles for unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::crypto::{random_bytes, MasterKey, WrappedKey, KEY_LEN};
use crate::error::{IdentityError, IdentityResult};
use crate::record::{EncryptedRecord, LedgerReceipt, RecordState};
use crate::remote::{ContentStore, LedgerClient};
use crate::session::Session;
use crate::template::{compute_identity_commitment, Embedding, IdentityCommitment, EMBEDDING_DIM};

/// Session around a random master key, skipping the slow KDF
pub(crate) fn test_session() -> Session {
    Session::from_master_key(MasterKey::from_bytes(random_bytes::<KEY_LEN>()), vec![0u8; 16])
}

/// 128 floats: 0.100, 0.101, ... 0.227
pub(crate) fn sample_embedding() -> Embedding {
    let values = (0..EMBEDDING_DIM).map(|i| 0.1 + i as f32 * 0.001).collect();
    Embedding::new(values).unwrap()
}

/// Copy of `e` whose first component moved by `delta`, so the distance is `delta`
pub(crate) fn shifted(e: &Embedding, delta: f32) -> Embedding {
    let mut values = e.values().to_vec();
    values[0] += delta;
    Embedding::new(values).unwrap()
}

/// Pending record with placeholder ciphertext, for storage tests
pub(crate) fn dummy_record(id: &str) -> EncryptedRecord {
    EncryptedRecord {
        id: id.to_string(),
        ciphertext: id.as_bytes().to_vec(),
        iv: vec![0u8; 12],
        wrapped_key: WrappedKey {
            ciphertext: vec![1u8; 48],
            iv: vec![2u8; 12],
        },
        identity_commitment: compute_identity_commitment(id.as_bytes()),
        state: RecordState::Pending,
        remote_pointer: None,
        created_at: 1_700_000_000_000,
        uploaded_at: None,
        label: None,
        sample_key: None,
        ledger_receipt: None,
    }
}

/// In-memory content store keyed by sha256 hex, counting puts
#[derive(Default)]
pub(crate) struct MemoryContentStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    offline: AtomicBool,
    delay: Mutex<Option<Duration>>,
    reject: Mutex<Option<Vec<u8>>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryContentStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Fail puts whose bytes contain `marker`
    pub(crate) fn reject_containing(&self, marker: &str) {
        *self.reject.lock() = Some(marker.as_bytes().to_vec());
    }

    /// Highest number of calls seen running at once
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn maybe_wait(&self) -> IdentityResult<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.offline.load(Ordering::SeqCst) {
            return Err(IdentityError::Network("content store offline".into()));
        }
        Ok(())
    }

    fn rejects(&self, bytes: &[u8]) -> bool {
        match self.reject.lock().as_deref() {
            Some(marker) => bytes.windows(marker.len()).any(|w| w == marker),
            None => false,
        }
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, bytes: Vec<u8>) -> IdentityResult<String> {
        self.maybe_wait().await?;
        if self.rejects(&bytes) {
            return Err(IdentityError::Network("upload rejected".into()));
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        let cid = hex::encode(Sha256::digest(&bytes));
        self.blobs.lock().insert(cid.clone(), bytes);
        Ok(cid)
    }

    async fn get(&self, content_id: &str) -> IdentityResult<Vec<u8>> {
        self.maybe_wait().await?;
        self.blobs
            .lock()
            .get(content_id)
            .cloned()
            .ok_or_else(|| IdentityError::Network(format!("content {} not found", content_id)))
    }
}

/// Ledger double recording every commit; can be switched to fail or slowed down
#[derive(Default)]
pub(crate) struct MemoryLedger {
    commits: Mutex<Vec<(IdentityCommitment, String)>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MemoryLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub(crate) fn commits(&self) -> Vec<(IdentityCommitment, String)> {
        self.commits.lock().clone()
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn commit(
        &self,
        commitment: &IdentityCommitment,
        pointer: &str,
    ) -> IdentityResult<LedgerReceipt> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(IdentityError::Network("ledger unreachable".into()));
        }
        let mut commits = self.commits.lock();
        commits.push((*commitment, pointer.to_string()));
        Ok(LedgerReceipt {
            success: true,
            tx_hash: format!("0x{:064x}", commits.len()),
            block_ref: commits.len() as u64,
        })
    }
}
