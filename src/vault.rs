//! ALFA Identity Vault - Vault Facade
//!
//! Wires configuration, the session, local stores and the sync reconciler
//! behind one entry point. On-disk layout of a data directory:
//!
//! ```text
//! <data_dir>/
//!   manifest.json   salt, KDF parameters, passphrase verifier
//!   config.json     IdentityConfig
//!   records.db      encrypted records (SQLite)
//!   samples/        sample images, sealed under their record keys
//!   remote/         local content store
//!   ledger.jsonl    local ledger journal
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::blob_store::{BlobStore, FsBlobStore};
use crate::codec::base64_bytes;
use crate::config::{IdentityConfig, CONFIG_FILE};
use crate::crypto::{generate_salt, KdfParams, RecordKey, WrappedKey};
use crate::enrollment::{EmbeddingExtractor, Enroller, IdentifyOutcome};
use crate::error::{IdentityError, IdentityResult};
use crate::matcher::MatchOutcome;
use crate::record::{EncryptedRecord, RemoteBundle};
use crate::remote::{ContentStore, DirContentStore, JournalLedger, LedgerClient};
use crate::session::Session;
use crate::store::{RecordStore, SqliteRecordStore, StoreStats};
use crate::sync::{SyncOutcome, SyncReconciler};
use crate::template::Embedding;

/// Manifest file name inside the data directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Unlock parameters persisted next to the records. Holds no secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    pub kdf: KdfParams,
    /// Random key wrapped under the master key; unwraps only with the right passphrase
    pub verifier: WrappedKey,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    fn load(path: &Path) -> IdentityResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                IdentityError::Config(format!("no identity vault at {}", path.display()))
            }
            _ => e.into(),
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    fn save(&self, path: &Path) -> IdentityResult<()> {
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

/// Identity vault - main entry point
pub struct IdentityVault {
    root: PathBuf,
    config: IdentityConfig,
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    enroller: Enroller,
    sync: SyncReconciler,
    session: RwLock<Option<Arc<Session>>>,
}

impl IdentityVault {
    // ═══════════════════════════════════════════════════════════════════════
    // INITIALIZATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Initialize a new vault in `config.data_dir` and unlock it
    pub async fn create(config: IdentityConfig, passphrase: SecretString) -> IdentityResult<Self> {
        config.validate()?;
        let root = config.data_dir.clone();
        let manifest_path = root.join(MANIFEST_FILE);

        if manifest_path.exists() {
            return Err(IdentityError::InvalidState(format!(
                "identity vault already exists at {}",
                root.display()
            )));
        }
        std::fs::create_dir_all(&root)?;

        let salt = generate_salt().to_vec();
        let session = Session::open(passphrase, salt.clone(), config.kdf.clone()).await?;

        let manifest = Manifest {
            version: crate::VERSION.into(),
            salt,
            kdf: config.kdf.clone(),
            verifier: session.wrap_key(&RecordKey::generate())?,
            created_at: Utc::now(),
        };
        manifest.save(&manifest_path)?;
        config.save(&root.join(CONFIG_FILE))?;

        let vault = Self::assemble(root.clone(), config)?;
        *vault.session.write() = Some(Arc::new(session));

        log::info!("Identity vault created at {}", root.display());
        Ok(vault)
    }

    /// Open an existing vault; it starts locked
    pub fn open(data_dir: &Path) -> IdentityResult<Self> {
        if !data_dir.join(MANIFEST_FILE).exists() {
            return Err(IdentityError::Config(format!(
                "no identity vault at {}",
                data_dir.display()
            )));
        }

        let mut config = IdentityConfig::load(&data_dir.join(CONFIG_FILE))?;
        config.data_dir = data_dir.to_path_buf();
        Self::assemble(data_dir.to_path_buf(), config)
    }

    fn assemble(root: PathBuf, config: IdentityConfig) -> IdentityResult<Self> {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open(&root.join("records.db"))?);
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&root.join("samples")));
        let content: Arc<dyn ContentStore> = Arc::new(DirContentStore::new(&root.join("remote")));
        let ledger: Arc<dyn LedgerClient> = Arc::new(JournalLedger::new(&root.join("ledger.jsonl")));

        let enroller = Enroller::new(Arc::clone(&store), config.embedding_dim)
            .with_blob_store(Arc::clone(&blobs));
        let sync = SyncReconciler::new(Arc::clone(&store), content, config.sync_options())
            .with_ledger(ledger)
            .with_blob_store(Arc::clone(&blobs));

        Ok(Self {
            root,
            config,
            store,
            blobs,
            enroller,
            sync,
            session: RwLock::new(None),
        })
    }

    /// Replace the local content store and ledger with real services
    pub fn with_remote(mut self, content: Arc<dyn ContentStore>, ledger: Arc<dyn LedgerClient>) -> Self {
        self.sync = SyncReconciler::new(Arc::clone(&self.store), content, self.config.sync_options())
            .with_ledger(ledger)
            .with_blob_store(Arc::clone(&self.blobs));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &SyncReconciler {
        &self.sync
    }

    // ═══════════════════════════════════════════════════════════════════════
    // UNLOCK / LOCK
    // ═══════════════════════════════════════════════════════════════════════

    /// Derive the master key and check it against the manifest verifier
    pub async fn unlock(&self, passphrase: SecretString) -> IdentityResult<()> {
        let manifest = Manifest::load(&self.root.join(MANIFEST_FILE))?;
        let session = Session::open(passphrase, manifest.salt, manifest.kdf).await?;

        if let Err(e) = session.unwrap_key(&manifest.verifier) {
            session.end();
            log::warn!("Unlock rejected for {}", self.root.display());
            return Err(e);
        }

        if let Some(previous) = self.session.write().replace(Arc::new(session)) {
            previous.end();
        }
        log::info!("Identity vault unlocked");
        Ok(())
    }

    /// End the session; the master key is dropped
    pub fn lock(&self) {
        if let Some(session) = self.session.write().take() {
            session.end();
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.session.read().as_ref().is_some_and(|s| s.is_active())
    }

    fn session(&self) -> IdentityResult<Arc<Session>> {
        self.session
            .read()
            .as_ref()
            .filter(|s| s.is_active())
            .cloned()
            .ok_or(IdentityError::SessionClosed)
    }

    fn tolerance(&self, tolerance: Option<f64>) -> f64 {
        tolerance.unwrap_or(self.config.match_tolerance)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ENROLLMENT & VERIFICATION
    // ═══════════════════════════════════════════════════════════════════════

    pub fn enroll(
        &self,
        embedding: &Embedding,
        label: Option<String>,
        sample: Option<&[u8]>,
    ) -> IdentityResult<EncryptedRecord> {
        self.enroller.enroll_embedding(&*self.session()?, embedding, label, sample)
    }

    pub fn enroll_frame(
        &self,
        extractor: &dyn EmbeddingExtractor,
        frame: &[u8],
        label: Option<String>,
    ) -> IdentityResult<EncryptedRecord> {
        self.enroller.enroll_frame(&*self.session()?, extractor, frame, label)
    }

    pub fn verify_commitment(&self, id: &str) -> IdentityResult<bool> {
        self.enroller.verify_commitment(&*self.session()?, id)
    }

    /// Match a probe against one record; `None` uses the configured tolerance
    pub fn verify(&self, id: &str, probe: &Embedding, tolerance: Option<f64>) -> IdentityResult<MatchOutcome> {
        self.enroller
            .verify_by_matching(&*self.session()?, id, probe, self.tolerance(tolerance))
    }

    pub fn identify(&self, probe: &Embedding, tolerance: Option<f64>) -> IdentityResult<IdentifyOutcome> {
        self.enroller
            .identify(&*self.session()?, probe, self.tolerance(tolerance))
    }

    /// Decrypted sample image of a record, if one is kept
    pub fn sample(&self, id: &str) -> IdentityResult<Option<Zeroizing<Vec<u8>>>> {
        self.enroller.load_sample(&*self.session()?, id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // RECORDS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn list(&self) -> IdentityResult<Vec<EncryptedRecord>> {
        self.store.get_all()
    }

    pub fn get(&self, id: &str) -> IdentityResult<EncryptedRecord> {
        self.store
            .get(id)?
            .ok_or_else(|| IdentityError::RecordNotFound(id.to_string()))
    }

    pub fn stats(&self) -> IdentityResult<StoreStats> {
        self.store.stats()
    }

    pub fn delete(&self, id: &str) -> IdentityResult<bool> {
        self.enroller.delete_record(id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SYNC (works while locked: records are already encrypted)
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn sync_one(&self, id: &str) -> IdentityResult<EncryptedRecord> {
        let record = self.get(id)?;
        self.sync.sync_one(&record).await
    }

    pub async fn sync_all(&self) -> IdentityResult<Vec<SyncOutcome>> {
        self.sync.sync_all().await
    }

    pub async fn commit(&self, id: &str) -> IdentityResult<EncryptedRecord> {
        self.sync.commit_to_ledger(id).await
    }

    pub async fn commit_all(&self) -> IdentityResult<Vec<SyncOutcome>> {
        self.sync.commit_all().await
    }

    pub async fn fetch_bundle(&self, pointer: &str) -> IdentityResult<RemoteBundle> {
        self.sync.fetch_bundle(pointer).await
    }

    pub async fn restore(&self, pointer: &str) -> IdentityResult<EncryptedRecord> {
        self.sync.restore(pointer).await
    }
}

impl Drop for IdentityVault {
    fn drop(&mut self) {
        self.lock();
    }
}
