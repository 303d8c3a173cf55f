//! ALFA Identity Vault - Configuration
//!
//! Runtime settings, stored as `config.json` in the data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{KdfParams, MIN_PBKDF2_ITERATIONS};
use crate::error::{IdentityError, IdentityResult};
use crate::matcher::DEFAULT_TOLERANCE;
use crate::sync::SyncOptions;
use crate::template::EMBEDDING_DIM;

/// Config file name inside the data directory
pub const CONFIG_FILE: &str = "config.json";

/// Identity vault configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Where records, samples and the local remote live
    pub data_dir: PathBuf,
    /// Master key derivation
    pub kdf: KdfParams,
    /// Default acceptance threshold (overridable per call)
    pub match_tolerance: f64,
    pub embedding_dim: usize,
    pub remote_timeout_secs: u64,
    pub max_concurrent_uploads: usize,
    /// Commit to the ledger right after upload
    pub commit_to_ledger: bool,
    pub purge_samples_after_upload: bool,
    pub purge_records_after_commit: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./identity"),
            kdf: KdfParams::default(),
            match_tolerance: DEFAULT_TOLERANCE,
            embedding_dim: EMBEDDING_DIM,
            remote_timeout_secs: 30,
            max_concurrent_uploads: 4,
            commit_to_ledger: false,
            purge_samples_after_upload: false,
            purge_records_after_commit: false,
        }
    }
}

impl IdentityConfig {
    /// Defaults rooted at `data_dir`
    pub fn for_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            ..Default::default()
        }
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> IdentityResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: Self = serde_json::from_str(&text)
            .map_err(|e| IdentityError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> IdentityResult<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> IdentityResult<()> {
        if !self.match_tolerance.is_finite() || self.match_tolerance <= 0.0 {
            return Err(IdentityError::Config(format!(
                "match_tolerance must be positive, got {}",
                self.match_tolerance
            )));
        }
        if self.embedding_dim == 0 {
            return Err(IdentityError::Config("embedding_dim must not be zero".into()));
        }
        if self.remote_timeout_secs == 0 {
            return Err(IdentityError::Config("remote_timeout_secs must not be zero".into()));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(IdentityError::Config("max_concurrent_uploads must not be zero".into()));
        }
        if let KdfParams::Pbkdf2Sha256 { iterations } = self.kdf {
            if iterations < MIN_PBKDF2_ITERATIONS {
                return Err(IdentityError::Config(format!(
                    "PBKDF2 iterations must be at least {}",
                    MIN_PBKDF2_ITERATIONS
                )));
            }
        }
        Ok(())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    /// Reconciler settings derived from this config
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            timeout: self.remote_timeout(),
            max_concurrent: self.max_concurrent_uploads,
            commit_after_upload: self.commit_to_ledger,
            purge_samples_after_upload: self.purge_samples_after_upload,
            purge_records_after_commit: self.purge_records_after_commit,
        }
    }
}
