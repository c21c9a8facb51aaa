use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::FetchResult;
use crate::resource::StoragePriority;

/// Persisted record of a locally materialized resource file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalFileRecord {
    /// Resource id; primary key
    pub id: String,

    /// Mirror the file was fetched from
    pub mirror_id: String,

    /// Absolute path of the stored file
    pub file_path: PathBuf,

    /// Storage tier the file lives under
    pub storage: StoragePriority,

    /// Freshness timestamp copied from the resource at store time
    pub created_at: Option<DateTime<Utc>>,
}

/// SQLite-backed store of local-file records.
pub struct LocalFileStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> FetchResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Ephemeral store for tests.
    pub fn in_memory() -> FetchResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> FetchResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS local_files (
                id TEXT PRIMARY KEY,
                mirror_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                storage TEXT NOT NULL,
                created_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_local_files_storage ON local_files(storage)",
            [],
        )?;

        Ok(())
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: &LocalFileRecord) -> FetchResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO local_files (id, mirror_id, file_path, storage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.mirror_id,
                record.file_path.to_string_lossy(),
                record.storage.as_str(),
                record.created_at.map(|dt| dt.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> FetchResult<Option<LocalFileRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, mirror_id, file_path, storage, created_at
                 FROM local_files WHERE id = ?1",
                params![id],
                Self::parse_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn delete(&self, id: &str) -> FetchResult<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM local_files WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn all(&self) -> FetchResult<Vec<LocalFileRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, mirror_id, file_path, storage, created_at
             FROM local_files ORDER BY id",
        )?;
        let records = stmt
            .query_map([], Self::parse_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count(&self) -> FetchResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM local_files", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn parse_record(row: &rusqlite::Row) -> rusqlite::Result<LocalFileRecord> {
        let storage_str: String = row.get(3)?;
        let created_at_str: Option<String> = row.get(4)?;
        let created_at = created_at_str.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        });

        Ok(LocalFileRecord {
            id: row.get(0)?,
            mirror_id: row.get(1)?,
            file_path: PathBuf::from(row.get::<_, String>(2)?),
            storage: StoragePriority::parse(&storage_str),
            created_at,
        })
    }
}

impl std::fmt::Debug for LocalFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileStore").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> LocalFileRecord {
        LocalFileRecord {
            id: id.to_string(),
            mirror_id: "m1".to_string(),
            file_path: PathBuf::from(format!("/data/resources/{id}.bin")),
            storage: StoragePriority::Cached,
            created_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_upsert_and_get_round_trip() {
        let store = LocalFileStore::in_memory().unwrap();
        let rec = record("r1");
        store.upsert(&rec).unwrap();

        let loaded = store.get("r1").unwrap().unwrap();
        assert_eq!(loaded.id, rec.id);
        assert_eq!(loaded.mirror_id, rec.mirror_id);
        assert_eq!(loaded.file_path, rec.file_path);
        assert_eq!(loaded.storage, rec.storage);
        // rfc3339 keeps sub-second precision
        assert_eq!(
            loaded.created_at.unwrap().timestamp_millis(),
            rec.created_at.unwrap().timestamp_millis()
        );
    }

    #[test]
    fn test_upsert_replaces_existing() {
        let store = LocalFileStore::in_memory().unwrap();
        store.upsert(&record("r1")).unwrap();

        let mut updated = record("r1");
        updated.storage = StoragePriority::Permanent;
        updated.mirror_id = "m2".to_string();
        store.upsert(&updated).unwrap();

        let loaded = store.get("r1").unwrap().unwrap();
        assert_eq!(loaded.storage, StoragePriority::Permanent);
        assert_eq!(loaded.mirror_id, "m2");
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let store = LocalFileStore::in_memory().unwrap();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let store = LocalFileStore::in_memory().unwrap();
        store.upsert(&record("r1")).unwrap();
        assert!(store.delete("r1").unwrap());
        assert!(!store.delete("r1").unwrap());
        assert!(store.get("r1").unwrap().is_none());
    }

    #[test]
    fn test_all_is_ordered() {
        let store = LocalFileStore::in_memory().unwrap();
        store.upsert(&record("b")).unwrap();
        store.upsert(&record("a")).unwrap();
        let ids: Vec<String> = store.all().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_missing_created_at_survives() {
        let store = LocalFileStore::in_memory().unwrap();
        let mut rec = record("r1");
        rec.created_at = None;
        store.upsert(&rec).unwrap();
        assert!(store.get("r1").unwrap().unwrap().created_at.is_none());
    }
}
