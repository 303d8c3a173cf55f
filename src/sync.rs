//! ALFA Identity Vault - Sync Reconciler
//!
//! Pushes pending records to the content store and marks them uploaded.
//! Safe to retry and safe to run offline:
//! - an uploaded record is never uploaded again
//! - a failed upload leaves the record pending and reports the error
//! - the ledger commit is a separate step; its failure never undoes an upload
//! - a sealed sample image is shipped inside the bundle before any local purge
//! - every state change is one `RecordStore::put` after the remote call returned

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::blob_store::BlobStore;
use crate::error::{IdentityError, IdentityResult};
use crate::record::{EncryptedRecord, RemoteBundle, SealedSample};
use crate::remote::{ContentStore, LedgerClient};
use crate::store::RecordStore;

/// Reconciler settings
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Bound on each remote call
    pub timeout: Duration,
    /// Uploads running at once during `sync_all`
    pub max_concurrent: usize,
    /// Commit to the ledger right after a successful upload
    pub commit_after_upload: bool,
    /// Delete the local sample image once uploaded
    pub purge_samples_after_upload: bool,
    /// Delete the local record once its commitment is on the ledger
    pub purge_records_after_commit: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_concurrent: 4,
            commit_after_upload: false,
            purge_samples_after_upload: false,
            purge_records_after_commit: false,
        }
    }
}

/// Per-record result of a batch run
#[derive(Debug)]
pub struct SyncOutcome {
    pub id: String,
    pub result: IdentityResult<EncryptedRecord>,
}

impl SyncOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Sync report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub total: usize,
    pub synced: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn from_outcomes(outcomes: &[SyncOutcome]) -> Self {
        let mut report = SyncReport {
            total: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match &outcome.result {
                Ok(_) => report.synced += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", outcome.id, e));
                }
            }
        }
        report
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Marks a record id as busy in one set (uploads or commits); released on
/// drop, including when the owning future is abandoned
struct InFlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl InFlightGuard {
    fn acquire(ids: &Arc<Mutex<HashSet<String>>>, id: &str) -> IdentityResult<Self> {
        if !ids.lock().insert(id.to_string()) {
            return Err(IdentityError::SyncInProgress(id.to_string()));
        }
        Ok(Self {
            ids: Arc::clone(ids),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids.lock().remove(&self.id);
    }
}

/// Reconciles local records with the remote content store and ledger
#[derive(Clone)]
pub struct SyncReconciler {
    store: Arc<dyn RecordStore>,
    content: Arc<dyn ContentStore>,
    ledger: Option<Arc<dyn LedgerClient>>,
    blobs: Option<Arc<dyn BlobStore>>,
    options: SyncOptions,
    in_flight: Arc<Mutex<HashSet<String>>>,
    committing: Arc<Mutex<HashSet<String>>>,
}

impl SyncReconciler {
    pub fn new(store: Arc<dyn RecordStore>, content: Arc<dyn ContentStore>, options: SyncOptions) -> Self {
        Self {
            store,
            content,
            ledger: None,
            blobs: None,
            options,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            committing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerClient>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Blob store holding sealed sample images
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    async fn bounded<T>(&self, what: &str, call: impl Future<Output = IdentityResult<T>>) -> IdentityResult<T> {
        match tokio::time::timeout(self.options.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(IdentityError::Network(format!(
                "{} timed out after {:?}",
                what, self.options.timeout
            ))),
        }
    }

    /// Sealed sample of `record` to ship with its bundle
    ///
    /// A read failure fails the upload: purging later would lose the sample.
    fn shipped_sample(&self, record: &EncryptedRecord) -> IdentityResult<Option<SealedSample>> {
        let (Some(blobs), Some(key)) = (self.blobs.as_ref(), record.sample_key.as_deref()) else {
            return Ok(None);
        };
        match blobs.load(key)? {
            Some(bytes) => Ok(Some(SealedSample::from_bytes(&bytes)?)),
            None => {
                log::warn!("Sample {} of {} is missing, uploading without it", key, record.id);
                Ok(None)
            }
        }
    }

    fn purge_sample(&self, record: &mut EncryptedRecord) {
        let (Some(blobs), Some(key)) = (self.blobs.as_ref(), record.sample_key.clone()) else {
            return;
        };
        match blobs.delete(&key) {
            Ok(()) => record.sample_key = None,
            Err(e) => log::warn!("Could not purge sample {} of {}: {}", key, record.id, e),
        }
    }

    /// Upload one pending record; an uploaded record is returned unchanged
    pub async fn sync_one(&self, record: &EncryptedRecord) -> IdentityResult<EncryptedRecord> {
        if record.is_uploaded() {
            log::debug!("Record {} already uploaded, skipping", record.id);
            return Ok(record.clone());
        }

        let _guard = InFlightGuard::acquire(&self.in_flight, &record.id)?;

        // The caller's copy may be stale
        let current = self
            .store
            .get(&record.id)?
            .ok_or_else(|| IdentityError::RecordNotFound(record.id.clone()))?;
        if current.is_uploaded() {
            return Ok(current);
        }

        let sample = self.shipped_sample(&current)?;
        let has_sample = sample.is_some();
        let mut bundle = RemoteBundle::from_record(&current);
        if let Some(sample) = sample {
            bundle = bundle.with_sample(sample);
        }
        let bundle = bundle.to_bytes()?;
        let pointer = self
            .bounded("upload", self.content.put(bundle))
            .await
            .map_err(|e| {
                log::warn!("Upload of {} failed: {}", current.id, e);
                e
            })?;

        // Deleted while the upload was running: do not bring it back
        if self.store.get(&current.id)?.is_none() {
            return Err(IdentityError::RecordNotFound(current.id.clone()));
        }

        let mut uploaded = current.mark_uploaded(pointer)?;
        if self.options.purge_samples_after_upload && has_sample {
            self.purge_sample(&mut uploaded);
        }
        self.store.put(&uploaded)?;
        log::info!(
            "Record {} uploaded as {}",
            uploaded.id,
            uploaded.remote_pointer.as_deref().unwrap_or_default()
        );

        if self.options.commit_after_upload && self.ledger.is_some() {
            match self.commit_to_ledger(&uploaded.id).await {
                Ok(committed) => return Ok(committed),
                Err(e) => log::warn!("Ledger commit for {} deferred: {}", uploaded.id, e),
            }
        }

        Ok(uploaded)
    }

    /// Upload every record pending at call time; failures are collected per record
    pub async fn sync_all(&self) -> IdentityResult<Vec<SyncOutcome>> {
        let snapshot = self.store.pending()?;
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }
        log::info!("Syncing {} pending record(s)", snapshot.len());

        let permits = Arc::new(Semaphore::new(self.options.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();
        let mut outcomes: Vec<Option<SyncOutcome>> = Vec::with_capacity(snapshot.len());

        for (idx, record) in snapshot.iter().enumerate() {
            outcomes.push(None);
            let this = self.clone();
            let permits = Arc::clone(&permits);
            let record = record.clone();

            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => this.sync_one(&record).await,
                    Err(e) => Err(IdentityError::InvalidState(e.to_string())),
                };
                (idx, SyncOutcome { id: record.id, result })
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(e) => log::error!("Sync task failed: {}", e),
            }
        }

        Ok(outcomes
            .into_iter()
            .zip(snapshot)
            .map(|(outcome, record)| {
                outcome.unwrap_or_else(|| SyncOutcome {
                    id: record.id,
                    result: Err(IdentityError::InvalidState("sync task aborted".into())),
                })
            })
            .collect())
    }

    /// Record an uploaded record's commitment on the ledger
    ///
    /// Already committed records are returned as they are. A second commit of
    /// the same id while one is running fails with `SyncInProgress`.
    pub async fn commit_to_ledger(&self, id: &str) -> IdentityResult<EncryptedRecord> {
        let ledger = self
            .ledger
            .as_ref()
            .ok_or_else(|| IdentityError::Config("no ledger configured".into()))?;

        let _guard = InFlightGuard::acquire(&self.committing, id)?;

        let mut record = self
            .store
            .get(id)?
            .ok_or_else(|| IdentityError::RecordNotFound(id.to_string()))?;

        let pointer = match (&record.remote_pointer, record.is_uploaded()) {
            (Some(pointer), true) => pointer.clone(),
            _ => {
                return Err(IdentityError::InvalidState(format!(
                    "record {} must be uploaded before it is committed",
                    id
                )))
            }
        };

        if matches!(&record.ledger_receipt, Some(receipt) if receipt.success) {
            return Ok(record);
        }

        let receipt = self
            .bounded("ledger commit", ledger.commit(&record.identity_commitment, &pointer))
            .await?;
        let committed = receipt.success;

        // Deleted while the commit was running: do not bring it back
        if self.store.get(id)?.is_none() {
            log::warn!("Record {} deleted during ledger commit ({})", id, receipt.tx_hash);
            return Err(IdentityError::RecordNotFound(id.to_string()));
        }
        record.ledger_receipt = Some(receipt);

        if !committed {
            self.store.put(&record)?;
            return Err(IdentityError::Network(format!("ledger rejected commit for {}", id)));
        }

        if self.options.purge_records_after_commit {
            self.purge_sample(&mut record);
            self.store.delete(&record.id)?;
            log::info!("Record {} committed and purged locally", record.id);
        } else {
            self.store.put(&record)?;
            log::info!("Record {} committed", record.id);
        }

        Ok(record)
    }

    /// Commit every uploaded record that has no successful receipt yet
    pub async fn commit_all(&self) -> IdentityResult<Vec<SyncOutcome>> {
        let waiting: Vec<EncryptedRecord> = self
            .store
            .get_all()?
            .into_iter()
            .filter(|r| r.is_uploaded() && !r.ledger_receipt.as_ref().is_some_and(|rc| rc.success))
            .collect();

        let mut outcomes = Vec::with_capacity(waiting.len());
        for record in waiting {
            let result = self.commit_to_ledger(&record.id).await;
            outcomes.push(SyncOutcome { id: record.id, result });
        }
        Ok(outcomes)
    }

    /// Download and parse a published bundle
    pub async fn fetch_bundle(&self, pointer: &str) -> IdentityResult<RemoteBundle> {
        let bytes = self.bounded("fetch", self.content.get(pointer)).await?;
        RemoteBundle::from_bytes(&bytes)
    }

    /// Rebuild a local record from its published bundle
    ///
    /// A record already present locally is returned as it is. A shipped
    /// sample goes back into the blob store when one is configured.
    pub async fn restore(&self, pointer: &str) -> IdentityResult<EncryptedRecord> {
        let bundle = self.fetch_bundle(pointer).await?;

        if let Some(existing) = self.store.get(&bundle.id)? {
            return Ok(existing);
        }

        let (mut record, sample) = bundle.into_record(pointer.to_string());
        record.uploaded_at = Some(chrono::Utc::now().timestamp_millis());
        match (sample, &self.blobs) {
            (Some(sample), Some(blobs)) => record.sample_key = Some(blobs.save(&sample.to_bytes()?)?),
            (Some(_), None) => log::debug!("No blob store configured, sample of {} not restored", record.id),
            (None, _) => {}
        }

        if let Err(e) = self.store.put(&record) {
            if let (Some(key), Some(blobs)) = (&record.sample_key, &self.blobs) {
                if let Err(cleanup) = blobs.delete(key) {
                    log::warn!("Could not remove restored sample {}: {}", key, cleanup);
                }
            }
            return Err(e);
        }
        log::info!("Record {} restored from {}", record.id, pointer);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::blob_store::MemoryBlobStore;
    use crate::record::{LedgerReceipt, RecordState};
    use crate::store::MemoryRecordStore;
    use crate::template::IdentityCommitment;
    use crate::testing::{dummy_record, MemoryContentStore, MemoryLedger};

    /// Ledger that deletes the record it is committing, as a user would mid-call
    struct DeletingLedger {
        store: Arc<MemoryRecordStore>,
        id: String,
        inner: MemoryLedger,
    }

    #[async_trait]
    impl LedgerClient for DeletingLedger {
        async fn commit(&self, commitment: &IdentityCommitment, pointer: &str) -> IdentityResult<LedgerReceipt> {
            self.store.delete(&self.id)?;
            self.inner.commit(commitment, pointer).await
        }
    }

    struct Fixture {
        store: Arc<MemoryRecordStore>,
        content: Arc<MemoryContentStore>,
        ledger: Arc<MemoryLedger>,
        blobs: Arc<MemoryBlobStore>,
        sync: SyncReconciler,
    }

    fn fixture(options: SyncOptions) -> Fixture {
        let store = Arc::new(MemoryRecordStore::new());
        let content = Arc::new(MemoryContentStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let sync = SyncReconciler::new(store.clone(), content.clone(), options)
            .with_ledger(ledger.clone())
            .with_blob_store(blobs.clone());
        Fixture {
            store,
            content,
            ledger,
            blobs,
            sync,
        }
    }

    fn sealed_sample(marker: &[u8]) -> SealedSample {
        SealedSample {
            ciphertext: marker.to_vec(),
            iv: vec![7u8; 12],
        }
    }

    fn stored(f: &Fixture, id: &str) -> EncryptedRecord {
        let record = dummy_record(id);
        f.store.put(&record).unwrap();
        record
    }

    #[tokio::test]
    async fn test_sync_one_uploads_pending() {
        let f = fixture(SyncOptions::default());
        let record = stored(&f, "r1");

        let uploaded = f.sync.sync_one(&record).await.unwrap();
        assert!(uploaded.is_uploaded());
        assert!(uploaded.remote_pointer.is_some());
        assert_eq!(f.content.put_count(), 1);
        assert_eq!(f.store.get("r1").unwrap().unwrap(), uploaded);
    }

    #[tokio::test]
    async fn test_sync_one_idempotent_on_uploaded() {
        let f = fixture(SyncOptions::default());
        let record = dummy_record("r1").mark_uploaded("cid123".into()).unwrap();
        f.store.put(&record).unwrap();

        let again = f.sync.sync_one(&record).await.unwrap();
        assert_eq!(again, record);
        assert_eq!(again.remote_pointer.as_deref(), Some("cid123"));
        assert_eq!(f.content.put_count(), 0);

        // stale pending copy of an uploaded record is not re-uploaded either
        let stale = dummy_record("r1");
        let result = f.sync.sync_one(&stale).await.unwrap();
        assert_eq!(result.remote_pointer.as_deref(), Some("cid123"));
        assert_eq!(f.content.put_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_keeps_pending() {
        let f = fixture(SyncOptions::default());
        let record = stored(&f, "r1");
        f.content.set_offline(true);

        let err = f.sync.sync_one(&record).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.store.get("r1").unwrap().unwrap(), record);

        f.content.set_offline(false);
        assert!(f.sync.sync_one(&record).await.unwrap().is_uploaded());
    }

    #[tokio::test]
    async fn test_timeout_is_network_error() {
        let f = fixture(SyncOptions {
            timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let record = stored(&f, "r1");
        f.content.set_delay(Duration::from_millis(500));

        let err = f.sync.sync_one(&record).await.unwrap_err();
        assert!(matches!(err, IdentityError::Network(_)));
        assert!(f.store.get("r1").unwrap().unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_concurrent_sync_of_same_record_uploads_once() {
        let f = fixture(SyncOptions::default());
        let record = stored(&f, "r1");
        f.content.set_delay(Duration::from_millis(100));

        let (a, b) = tokio::join!(f.sync.sync_one(&record), f.sync.sync_one(&record));
        let results = [a, b];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(IdentityError::SyncInProgress(_)))));
        assert_eq!(f.content.put_count(), 1);
    }

    #[tokio::test]
    async fn test_sync_all_partial_failure() {
        let f = fixture(SyncOptions::default());
        stored(&f, "ok-1");
        stored(&f, "bad");
        stored(&f, "ok-2");
        let done = dummy_record("done").mark_uploaded("cid-done".into()).unwrap();
        f.store.put(&done).unwrap();
        f.content.reject_containing("\"id\":\"bad\"");

        let outcomes = f.sync.sync_all().await.unwrap();
        let ids: Vec<&str> = outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["ok-1", "bad", "ok-2"]);

        let report = SyncReport::from_outcomes(&outcomes);
        assert_eq!(report.total, 3);
        assert_eq!(report.synced, 2);
        assert_eq!(report.failed, 1);
        assert!(report.errors[0].starts_with("bad:"));
        assert!(!report.success());

        assert!(f.store.get("bad").unwrap().unwrap().is_pending());
        assert!(f.store.get("ok-2").unwrap().unwrap().is_uploaded());
        assert_eq!(f.content.put_count(), 2);
    }

    #[tokio::test]
    async fn test_sync_all_respects_concurrency_bound() {
        let f = fixture(SyncOptions {
            max_concurrent: 2,
            ..Default::default()
        });
        for i in 0..6 {
            stored(&f, &format!("r{}", i));
        }
        f.content.set_delay(Duration::from_millis(30));

        let outcomes = f.sync.sync_all().await.unwrap();
        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert!(f.content.peak_concurrency() <= 2);
        assert!(f.store.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_record_is_not_uploaded() {
        let f = fixture(SyncOptions::default());
        let record = dummy_record("gone");

        assert!(matches!(
            f.sync.sync_one(&record).await,
            Err(IdentityError::RecordNotFound(_))
        ));
        assert_eq!(f.content.put_count(), 0);
    }

    #[tokio::test]
    async fn test_ledger_failure_keeps_upload() {
        let f = fixture(SyncOptions::default());
        let record = stored(&f, "r1");
        let uploaded = f.sync.sync_one(&record).await.unwrap();

        f.ledger.set_failing(true);
        let err = f.sync.commit_to_ledger("r1").await.unwrap_err();
        assert!(err.is_retryable());

        let after = f.store.get("r1").unwrap().unwrap();
        assert!(after.is_uploaded());
        assert_eq!(after.remote_pointer, uploaded.remote_pointer);
        assert!(after.ledger_receipt.is_none());

        f.ledger.set_failing(false);
        let committed = f.sync.commit_to_ledger("r1").await.unwrap();
        let receipt = committed.ledger_receipt.clone().unwrap();
        assert!(receipt.success);
        assert_eq!(f.ledger.commits().len(), 1);
        assert_eq!(f.ledger.commits()[0].0, record.identity_commitment);

        // second commit is a no-op
        f.sync.commit_to_ledger("r1").await.unwrap();
        assert_eq!(f.ledger.commits().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_requires_upload() {
        let f = fixture(SyncOptions::default());
        stored(&f, "r1");

        assert!(matches!(
            f.sync.commit_to_ledger("r1").await,
            Err(IdentityError::InvalidState(_))
        ));
        assert!(f.ledger.commits().is_empty());
    }

    #[tokio::test]
    async fn test_commit_after_upload_and_purge_policy() {
        let f = fixture(SyncOptions {
            commit_after_upload: true,
            purge_samples_after_upload: true,
            purge_records_after_commit: true,
            ..Default::default()
        });
        let sample = sealed_sample(b"sealed-jpeg");
        let sample_key = f.blobs.save(&sample.to_bytes().unwrap()).unwrap();
        let mut record = dummy_record("r1");
        record.sample_key = Some(sample_key.clone());
        f.store.put(&record).unwrap();

        let result = f.sync.sync_one(&record).await.unwrap();
        assert!(result.ledger_receipt.is_some());
        assert!(result.sample_key.is_none());
        assert!(f.blobs.load(&sample_key).unwrap().is_none());
        assert!(f.store.get("r1").unwrap().is_none());

        // the sample survives remotely and comes back with the record
        let pointer = result.remote_pointer.clone().unwrap();
        let restored = f.sync.restore(&pointer).await.unwrap();
        let key = restored.sample_key.clone().unwrap();
        let bytes = f.blobs.load(&key).unwrap().unwrap();
        assert_eq!(SealedSample::from_bytes(&bytes).unwrap(), sample);
    }

    #[tokio::test]
    async fn test_missing_sample_keeps_its_key() {
        let f = fixture(SyncOptions {
            purge_samples_after_upload: true,
            ..Default::default()
        });
        let mut record = dummy_record("r1");
        record.sample_key = Some("img-gone".into());
        f.store.put(&record).unwrap();

        let uploaded = f.sync.sync_one(&record).await.unwrap();
        assert!(uploaded.is_uploaded());
        assert_eq!(uploaded.sample_key.as_deref(), Some("img-gone"));
        let bundle = f.sync.fetch_bundle(uploaded.remote_pointer.as_deref().unwrap()).await.unwrap();
        assert!(bundle.sample.is_none());
    }

    #[tokio::test]
    async fn test_unreadable_sample_keeps_record_pending() {
        let f = fixture(SyncOptions {
            purge_samples_after_upload: true,
            ..Default::default()
        });
        let key = f.blobs.save(b"not a sealed sample").unwrap();
        let mut record = dummy_record("r1");
        record.sample_key = Some(key.clone());
        f.store.put(&record).unwrap();

        assert!(f.sync.sync_one(&record).await.is_err());
        assert!(f.store.get("r1").unwrap().unwrap().is_pending());
        assert!(f.blobs.load(&key).unwrap().is_some());
        assert_eq!(f.content.put_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_does_not_resurrect_deleted_record() {
        let f = fixture(SyncOptions::default());
        let record = stored(&f, "r1");
        f.sync.sync_one(&record).await.unwrap();

        let deleting = SyncReconciler::new(f.store.clone(), f.content.clone(), SyncOptions::default())
            .with_ledger(Arc::new(DeletingLedger {
                store: f.store.clone(),
                id: "r1".into(),
                inner: MemoryLedger::new(),
            }));

        assert!(matches!(
            deleting.commit_to_ledger("r1").await,
            Err(IdentityError::RecordNotFound(_))
        ));
        assert!(f.store.get("r1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_commit_of_same_record_commits_once() {
        let f = fixture(SyncOptions::default());
        let record = stored(&f, "r1");
        f.sync.sync_one(&record).await.unwrap();
        f.ledger.set_delay(Duration::from_millis(50));

        let (a, b) = tokio::join!(f.sync.commit_to_ledger("r1"), f.sync.commit_to_ledger("r1"));
        let results = [a, b];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(IdentityError::SyncInProgress(_)))));
        assert_eq!(f.ledger.commits().len(), 1);

        // guard released: a later commit is the usual no-op
        f.sync.commit_to_ledger("r1").await.unwrap();
        assert_eq!(f.ledger.commits().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_all_ignores_records_added_during_run() {
        let f = fixture(SyncOptions::default());
        stored(&f, "a");
        stored(&f, "b");
        f.content.set_delay(Duration::from_millis(100));

        let add_late = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.store.put(&dummy_record("late")).unwrap();
        };
        let (outcomes, ()) = tokio::join!(f.sync.sync_all(), add_late);

        let ids: Vec<String> = outcomes.unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(f.store.get("late").unwrap().unwrap().is_pending());
        assert_eq!(f.content.put_count(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_sync_all_leaves_no_half_updated_record() {
        let f = fixture(SyncOptions {
            max_concurrent: 1,
            ..Default::default()
        });
        for i in 0..4 {
            stored(&f, &format!("r{}", i));
        }
        f.content.set_delay(Duration::from_millis(100));

        let abandoned = tokio::time::timeout(Duration::from_millis(150), f.sync.sync_all()).await;
        assert!(abandoned.is_err());

        let records = f.store.get_all().unwrap();
        assert_eq!(records.len(), 4);
        for record in &records {
            match record.state {
                RecordState::Uploaded => assert!(record.remote_pointer.is_some(), "{}", record.id),
                RecordState::Pending => assert!(record.remote_pointer.is_none(), "{}", record.id),
            }
        }
        assert!(records.iter().any(|r| r.is_pending()));

        // aborted tasks release their ids; a later run finishes the rest
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.content.set_delay(Duration::from_millis(1));
        let outcomes = f.sync.sync_all().await.unwrap();
        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert!(f.store.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_all_skips_committed() {
        let f = fixture(SyncOptions::default());
        stored(&f, "a");
        stored(&f, "b");
        f.sync.sync_all().await.unwrap();
        f.sync.commit_to_ledger("a").await.unwrap();

        let outcomes = f.sync.commit_all().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].id, "b");
        assert_eq!(f.ledger.commits().len(), 2);
    }

    #[tokio::test]
    async fn test_restore_from_pointer() {
        let f = fixture(SyncOptions::default());
        let record = stored(&f, "r1");
        let uploaded = f.sync.sync_one(&record).await.unwrap();
        let pointer = uploaded.remote_pointer.clone().unwrap();

        let bundle = f.sync.fetch_bundle(&pointer).await.unwrap();
        assert_eq!(bundle.id, "r1");

        f.store.delete("r1").unwrap();
        let restored = f.sync.restore(&pointer).await.unwrap();
        assert!(restored.is_uploaded());
        assert_eq!(restored.remote_pointer.as_deref(), Some(pointer.as_str()));
        assert_eq!(restored.ciphertext, record.ciphertext);
        assert_eq!(restored.identity_commitment, record.identity_commitment);
        assert!(restored.sample_key.is_none());
        assert!(f.store.get("r1").unwrap().is_some());
    }
}
