//! ALFA Identity Vault - Session Context
//!
//! Holds the master key for one unlocked session. Every wrap/unwrap goes
//! through a `Session`; after `end()` the key is dropped (zeroized) and the
//! session refuses further use. A session is never re-opened implicitly.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use secrecy::SecretString;
use uuid::Uuid;

use crate::crypto::{derive_master_key_with, unwrap_key, wrap_key, KdfParams, MasterKey, RecordKey, WrappedKey};
use crate::error::{IdentityError, IdentityResult};

pub struct Session {
    id: Uuid,
    salt: Vec<u8>,
    started_at: DateTime<Utc>,
    master: RwLock<Option<MasterKey>>,
}

impl Session {
    /// Derive the master key off the async executor and start a session
    pub async fn open(
        passphrase: SecretString,
        salt: Vec<u8>,
        params: KdfParams,
    ) -> IdentityResult<Self> {
        let kdf_salt = salt.clone();
        let key = tokio::task::spawn_blocking(move || {
            derive_master_key_with(&passphrase, &kdf_salt, &params)
        })
        .await
        .map_err(|e| IdentityError::KeyDerivationFailed(e.to_string()))??;

        let session = Self::from_master_key(key, salt);
        log::info!("Session {} opened", session.id);
        Ok(session)
    }

    /// Start a session around an already derived key
    pub fn from_master_key(key: MasterKey, salt: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            salt,
            started_at: Utc::now(),
            master: RwLock::new(Some(key)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Salt the master key was derived with
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_active(&self) -> bool {
        self.master.read().is_some()
    }

    fn with_master<T>(&self, f: impl FnOnce(&MasterKey) -> IdentityResult<T>) -> IdentityResult<T> {
        let guard = self.master.read();
        let master = guard.as_ref().ok_or(IdentityError::SessionClosed)?;
        f(master)
    }

    /// Wrap a record key under this session's master key
    pub fn wrap_key(&self, record_key: &RecordKey) -> IdentityResult<WrappedKey> {
        self.with_master(|master| wrap_key(master, record_key))
    }

    /// Unwrap a record key; keys wrapped by another session fail authentication
    pub fn unwrap_key(&self, wrapped: &WrappedKey) -> IdentityResult<RecordKey> {
        self.with_master(|master| unwrap_key(master, wrapped))
    }

    /// End the session and drop the master key
    pub fn end(&self) {
        if self.master.write().take().is_some() {
            log::info!("Session {} ended", self.id);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .field("active", &self.is_active())
            .finish()
    }
}
