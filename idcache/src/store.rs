use redb::TableDefinition;
use std::path::Path;

/// Single-table, single-key layout: the whole cache tree is one JSON blob.
/// The schema is versionless; loaders ignore unknown top-level keys instead.
const SNAPSHOT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("proxy_ids");
const SNAPSHOT_KEY: &str = "snapshot";

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("failed to open cache store: {0}")]
    Open(String),
    #[error("cache store read failed: {0}")]
    Read(String),
    #[error("cache store write failed: {0}")]
    Write(String),
    #[error("snapshot serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Embedded file store for the serialized cache tree.
pub struct SnapshotStore {
    db: redb::Database,
}

impl SnapshotStore {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = redb::Database::create(path).map_err(|e| CacheError::Open(e.to_string()))?;
        Ok(SnapshotStore { db })
    }

    /// Returns the stored blob, or `None` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<Vec<u8>>, CacheError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| CacheError::Read(e.to_string()))?;

        let table = match txn.open_table(SNAPSHOT_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(CacheError::Read(e.to_string())),
        };

        match table
            .get(SNAPSHOT_KEY)
            .map_err(|e| CacheError::Read(e.to_string()))?
        {
            Some(guard) => Ok(Some(guard.value().to_vec())),
            None => Ok(None),
        }
    }

    /// Replaces the stored blob in a single write transaction.
    pub fn save(&self, blob: &[u8]) -> Result<(), CacheError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| CacheError::Write(e.to_string()))?;
        {
            let mut table = txn
                .open_table(SNAPSHOT_TABLE)
                .map_err(|e| CacheError::Write(e.to_string()))?;
            table
                .insert(SNAPSHOT_KEY, blob)
                .map_err(|e| CacheError::Write(e.to_string()))?;
        }
        txn.commit().map_err(|e| CacheError::Write(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_from_fresh_store_is_none() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(&dir.path().join("cache.redb")).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(&dir.path().join("cache.redb")).unwrap();

        store.save(b"{\"cacheType\":{}}").unwrap();
        assert_eq!(store.load().unwrap().unwrap(), b"{\"cacheType\":{}}");
    }

    #[test]
    fn save_overwrites_previous_blob() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(&dir.path().join("cache.redb")).unwrap();

        store.save(b"first").unwrap();
        store.save(b"second").unwrap();
        assert_eq!(store.load().unwrap().unwrap(), b"second");
    }

    #[test]
    fn reopen_preserves_blob() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.redb");
        {
            let store = SnapshotStore::open(&path).unwrap();
            store.save(b"persisted").unwrap();
        }
        let store = SnapshotStore::open(&path).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), b"persisted");
    }

    #[test]
    fn open_creates_missing_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/dirs/cache.redb");
        let _store = SnapshotStore::open(&path).unwrap();
        assert!(path.exists());
    }
}
