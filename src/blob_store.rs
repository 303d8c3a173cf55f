//! ALFA Identity Vault - Sample Blob Store
//!
//! Key/value storage for raw sample images kept next to (never inside)
//! encrypted records. Files are written atomically and zero-filled before
//! removal.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;

use crate::crypto::random_bytes;
use crate::error::{IdentityError, IdentityResult};

/// Local blob storage contract
pub trait BlobStore: Send + Sync {
    /// Store a blob and return its key
    fn save(&self, blob: &[u8]) -> IdentityResult<String>;

    fn load(&self, key: &str) -> IdentityResult<Option<Vec<u8>>>;

    /// Remove a blob; unknown keys are ignored
    fn delete(&self, key: &str) -> IdentityResult<()>;
}

/// New blob key: `img-<epoch ms>-<random hex>`
pub fn new_blob_key() -> String {
    format!(
        "img-{}-{}",
        Utc::now().timestamp_millis(),
        hex::encode(random_bytes::<6>())
    )
}

fn check_key(key: &str) -> IdentityResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(IdentityError::InvalidEncoding(format!("invalid blob key {:?}", key)));
    }
    Ok(())
}

/// Blob store rooted in a directory, one file per key
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn blob_path(&self, key: &str) -> IdentityResult<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(format!("{}.bin", key)))
    }

    fn write_atomic(path: &Path, data: &[u8]) -> IdentityResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;

        fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn overwrite_with_zeros(path: &Path) -> IdentityResult<()> {
        let size = fs::metadata(path)?.len() as usize;
        if size == 0 {
            return Ok(());
        }

        let mut file = OpenOptions::new().write(true).open(path)?;
        let zeros = vec![0u8; size.min(1024 * 1024)];
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(zeros.len());
            file.write_all(&zeros[..n])?;
            remaining -= n;
        }
        file.sync_all()?;
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn save(&self, blob: &[u8]) -> IdentityResult<String> {
        let key = new_blob_key();
        Self::write_atomic(&self.blob_path(&key)?, blob)?;
        log::debug!("Saved sample {} ({} bytes)", key, blob.len());
        Ok(key)
    }

    fn load(&self, key: &str) -> IdentityResult<Option<Vec<u8>>> {
        let path = self.blob_path(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> IdentityResult<()> {
        let path = self.blob_path(key)?;
        if !path.exists() {
            return Ok(());
        }

        if let Err(e) = Self::overwrite_with_zeros(&path) {
            log::warn!("Could not zero sample {} before delete: {}", key, e);
        }
        fs::remove_file(&path)?;
        Ok(())
    }
}

/// Volatile blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn save(&self, blob: &[u8]) -> IdentityResult<String> {
        let key = new_blob_key();
        self.blobs.write().insert(key.clone(), blob.to_vec());
        Ok(key)
    }

    fn load(&self, key: &str) -> IdentityResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> IdentityResult<()> {
        self.blobs.write().remove(key);
        Ok(())
    }
}
