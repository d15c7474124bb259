//! Persistent cache of work items and their processing records, using redb.
//!
//! One `ITEMS` table, keyed by the work item id in big-endian bytes so the
//! natural byte order equals id order. Values are JSON-encoded
//! [`CacheEntry`] blobs. Each operation is a single redb transaction, which
//! gives the per-key atomicity the resume path relies on: a reader never
//! observes a partially-written record.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{BridgeError, Result};
use crate::types::CacheEntry;

/// Key: work item id (u64 big-endian). Value: JSON-encoded CacheEntry.
const ITEMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("items");

fn item_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// Persistent store for fetched work items and processing state.
pub struct CacheStore {
    db: Database,
}

impl CacheStore {
    /// Open or create the redb database at `path`.
    ///
    /// Creates the `ITEMS` table if it doesn't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| BridgeError::Cache(e.to_string()))?;
        let wt = db
            .begin_write()
            .map_err(|e| BridgeError::Cache(e.to_string()))?;
        wt.open_table(ITEMS)
            .map_err(|e| BridgeError::Cache(e.to_string()))?;
        wt.commit().map_err(|e| BridgeError::Cache(e.to_string()))?;
        Ok(Self { db })
    }

    pub fn get(&self, id: u64) -> Result<Option<CacheEntry>> {
        let rt = self
            .db
            .begin_read()
            .map_err(|e| BridgeError::Cache(e.to_string()))?;
        let table = rt
            .open_table(ITEMS)
            .map_err(|e| BridgeError::Cache(e.to_string()))?;
        let key = item_key(id);
        match table
            .get(key.as_slice())
            .map_err(|e| BridgeError::Cache(e.to_string()))?
        {
            Some(value) => {
                let entry: CacheEntry = serde_json::from_slice(value.value())?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace the entry for `entry.record.work_item_id`.
    pub fn put(&self, entry: &CacheEntry) -> Result<()> {
        let key = item_key(entry.record.work_item_id);
        let value = serde_json::to_vec(entry)?;
        let wt = self
            .db
            .begin_write()
            .map_err(|e| BridgeError::Cache(e.to_string()))?;
        {
            let mut table = wt
                .open_table(ITEMS)
                .map_err(|e| BridgeError::Cache(e.to_string()))?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(|e| BridgeError::Cache(e.to_string()))?;
        }
        wt.commit().map_err(|e| BridgeError::Cache(e.to_string()))?;
        Ok(())
    }

    /// All entries in ascending id order.
    pub fn list(&self) -> Result<Vec<CacheEntry>> {
        let rt = self
            .db
            .begin_read()
            .map_err(|e| BridgeError::Cache(e.to_string()))?;
        let table = rt
            .open_table(ITEMS)
            .map_err(|e| BridgeError::Cache(e.to_string()))?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(|e| BridgeError::Cache(e.to_string()))? {
            let (_, v) = entry.map_err(|e| BridgeError::Cache(e.to_string()))?;
            let parsed: CacheEntry = serde_json::from_slice(v.value())?;
            result.push(parsed);
        }
        Ok(result)
    }

    /// Remove every entry. Explicit operator action only.
    pub fn clear(&self) -> Result<usize> {
        let wt = self
            .db
            .begin_write()
            .map_err(|e| BridgeError::Cache(e.to_string()))?;
        let removed;
        {
            let mut table = wt
                .open_table(ITEMS)
                .map_err(|e| BridgeError::Cache(e.to_string()))?;
            let keys: Vec<Vec<u8>> = table
                .iter()
                .map_err(|e| BridgeError::Cache(e.to_string()))?
                .filter_map(|r| r.ok())
                .map(|(k, _)| k.value().to_vec())
                .collect();
            removed = keys.len();
            for key in keys {
                table
                    .remove(key.as_slice())
                    .map_err(|e| BridgeError::Cache(e.to_string()))?;
            }
        }
        wt.commit().map_err(|e| BridgeError::Cache(e.to_string()))?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemState, ProcessingRecord, WorkItem};
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, CacheStore) {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(&dir.path().join("cache.redb")).unwrap();
        (dir, store)
    }

    fn entry(id: u64) -> CacheEntry {
        CacheEntry {
            item: WorkItem::new(id, format!("item {id}"), "desc"),
            record: ProcessingRecord::new(id),
            target: None,
        }
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = open_tmp();
        store.put(&entry(42)).unwrap();

        let loaded = store.get(42).unwrap().unwrap();
        assert_eq!(loaded.item.id, 42);
        assert_eq!(loaded.record.state, ItemState::Fetched);
        assert!(store.get(43).unwrap().is_none());
    }

    #[test]
    fn put_replaces_existing_record() {
        let (_dir, store) = open_tmp();
        let mut e = entry(7);
        store.put(&e).unwrap();

        e.record.transition(ItemState::IssueCreated);
        e.record.issue_url = Some("https://github.com/o/r/issues/1".into());
        store.put(&e).unwrap();

        let loaded = store.get(7).unwrap().unwrap();
        assert_eq!(loaded.record.state, ItemState::IssueCreated);
        assert_eq!(
            loaded.record.issue_url.as_deref(),
            Some("https://github.com/o/r/issues/1")
        );
    }

    #[test]
    fn list_is_id_ordered() {
        let (_dir, store) = open_tmp();
        store.put(&entry(30)).unwrap();
        store.put(&entry(10)).unwrap();
        store.put(&entry(20)).unwrap();

        let ids: Vec<u64> = store.list().unwrap().iter().map(|e| e.item.id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn clear_removes_everything() {
        let (_dir, store) = open_tmp();
        store.put(&entry(1)).unwrap();
        store.put(&entry(2)).unwrap();

        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn reopen_preserves_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.redb");
        {
            let store = CacheStore::open(&path).unwrap();
            let mut e = entry(5);
            e.record.transition(ItemState::IssuePending);
            store.put(&e).unwrap();
        }
        let store = CacheStore::open(&path).unwrap();
        let loaded = store.get(5).unwrap().unwrap();
        assert_eq!(loaded.record.state, ItemState::IssuePending);
    }
}
