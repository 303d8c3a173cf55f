//! ALFA Identity Vault - Record Store
//!
//! Durable keyed storage of encrypted records. Records are already
//! envelope-encrypted, so rows hold their JSON form as-is.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::IdentityResult;
use crate::record::{EncryptedRecord, RecordState};

/// Keyed record storage. `put` is an upsert; concurrent puts of one id are
/// last-write-wins and never interleave.
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record by id
    fn put(&self, record: &EncryptedRecord) -> IdentityResult<()>;

    fn get(&self, id: &str) -> IdentityResult<Option<EncryptedRecord>>;

    /// Snapshot of every record, in insertion order
    fn get_all(&self) -> IdentityResult<Vec<EncryptedRecord>>;

    /// Remove a record; absent ids are not an error
    fn delete(&self, id: &str) -> IdentityResult<()>;

    /// Records still waiting for upload
    fn pending(&self) -> IdentityResult<Vec<EncryptedRecord>> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|r| r.is_pending())
            .collect())
    }

    fn stats(&self) -> IdentityResult<StoreStats> {
        let all = self.get_all()?;
        Ok(StoreStats {
            total: all.len(),
            pending: all.iter().filter(|r| r.is_pending()).count(),
            uploaded: all.iter().filter(|r| r.is_uploaded()).count(),
            committed: all.iter().filter(|r| r.ledger_receipt.is_some()).count(),
        })
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub pending: usize,
    pub uploaded: usize,
    pub committed: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// SQLITE
// ═══════════════════════════════════════════════════════════════════════════

/// SQLite-backed record store
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteRecordStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> IdentityResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> IdentityResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> IdentityResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_state ON records(state);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn decode_rows(rows: Vec<(String, String)>) -> Vec<EncryptedRecord> {
        let mut records = Vec::with_capacity(rows.len());
        for (id, data) in rows {
            match EncryptedRecord::from_json(&data) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping unreadable record {}: {}", id, e),
            }
        }
        records
    }

    fn query_rows(&self, sql: &str, state: Option<RecordState>) -> IdentityResult<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = match state {
            Some(state) => stmt.query_map(params![state.as_str()], id_and_data)?,
            None => stmt.query_map([], id_and_data)?,
        };
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn id_and_data(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String)> {
    Ok((row.get(0)?, row.get(1)?))
}

impl RecordStore for SqliteRecordStore {
    fn put(&self, record: &EncryptedRecord) -> IdentityResult<()> {
        let data = record.to_json()?;
        let conn = self.conn.lock();
        // Upsert keeps the original rowid, so listing order stays stable
        conn.execute(
            "INSERT INTO records (id, state, data, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET state = excluded.state, data = excluded.data",
            params![record.id, record.state.as_str(), data, record.created_at],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> IdentityResult<Option<EncryptedRecord>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row("SELECT data FROM records WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;

        data.map(|json| EncryptedRecord::from_json(&json)).transpose()
    }

    fn get_all(&self) -> IdentityResult<Vec<EncryptedRecord>> {
        let rows = self.query_rows("SELECT id, data FROM records ORDER BY rowid", None)?;
        Ok(Self::decode_rows(rows))
    }

    fn delete(&self, id: &str) -> IdentityResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn pending(&self) -> IdentityResult<Vec<EncryptedRecord>> {
        let rows = self.query_rows(
            "SELECT id, data FROM records WHERE state = ?1 ORDER BY rowid",
            Some(RecordState::Pending),
        )?;
        Ok(Self::decode_rows(rows))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// IN-MEMORY
// ═══════════════════════════════════════════════════════════════════════════

/// Volatile store, for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<Vec<EncryptedRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn put(&self, record: &EncryptedRecord) -> IdentityResult<()> {
        let mut records = self.records.write();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    fn get(&self, id: &str) -> IdentityResult<Option<EncryptedRecord>> {
        Ok(self.records.read().iter().find(|r| r.id == id).cloned())
    }

    fn get_all(&self) -> IdentityResult<Vec<EncryptedRecord>> {
        Ok(self.records.read().clone())
    }

    fn delete(&self, id: &str) -> IdentityResult<()> {
        self.records.write().retain(|r| r.id != id);
        Ok(())
    }
}
