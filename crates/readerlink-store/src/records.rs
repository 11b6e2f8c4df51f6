// ABOUTME: Durable queue of records waiting for delivery, persisted as one JSON snapshot file.
// ABOUTME: Every mutation rewrites the whole snapshot atomically under a single async lock.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use readerlink_core::record::now_millis;
use readerlink_core::{Fields, Record, RecordDraft, RecordKey};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::snapshot::{SnapshotError, read_json, write_json};

/// Errors that can occur when mutating the record store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("record key already present: {0}")]
    DuplicateKey(RecordKey),

    #[error("store is full ({capacity} pending records)")]
    Full { capacity: usize },
}

struct StoreInner {
    records: Vec<Record>,
    last_timestamp: u64,
}

impl StoreInner {
    /// Current time, nudged forward so assigned timestamps strictly increase
    /// even when the clock stalls or steps backwards.
    fn next_timestamp(&self) -> u64 {
        now_millis().max(self.last_timestamp.saturating_add(1))
    }
}

/// Pending records backed by a single snapshot file.
///
/// The in-memory copy is authoritative while the process runs; it only
/// changes after the snapshot holding the change has been written. All
/// operations take the same lock for their whole read-modify-persist
/// sequence.
pub struct RecordStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl RecordStore {
    /// Open the store at `path`, creating an empty snapshot if none exists.
    ///
    /// An unreadable or corrupt snapshot is logged and treated as empty so
    /// the device keeps running; it is overwritten by the next mutation.
    pub fn open(path: &Path) -> Self {
        let records: Vec<Record> = match read_json(path) {
            Ok(Some(records)) => records,
            Ok(None) => {
                if let Err(e) = write_json(path, &Vec::<Record>::new()) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to create record store file");
                }
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "record store snapshot unreadable, starting empty"
                );
                Vec::new()
            }
        };

        let last_timestamp = records.iter().map(|r| r.timestamp).max().unwrap_or(0);
        tracing::info!(path = %path.display(), pending = records.len(), "record store opened");

        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(StoreInner {
                records,
                last_timestamp,
            }),
        }
    }

    /// Returns the path to the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record and persist the snapshot. Key and timestamp are
    /// assigned when the draft leaves them out.
    pub async fn add(&self, draft: RecordDraft) -> Result<Record, StorageError> {
        self.add_bounded(draft, None).await
    }

    /// Like `add`, but refuses the record when `limit` records are already
    /// pending.
    pub async fn add_bounded(
        &self,
        draft: RecordDraft,
        limit: Option<usize>,
    ) -> Result<Record, StorageError> {
        let mut inner = self.inner.lock().await;

        if let Some(capacity) = limit
            && inner.records.len() >= capacity
        {
            return Err(StorageError::Full { capacity });
        }

        let key = draft.key.unwrap_or_else(RecordKey::generate);
        if inner.records.iter().any(|r| r.key == key) {
            return Err(StorageError::DuplicateKey(key));
        }

        let timestamp = draft.timestamp.unwrap_or_else(|| inner.next_timestamp());
        let record = Record {
            key,
            fields: draft.fields,
            timestamp,
        };

        inner.records.push(record.clone());
        if let Err(e) = write_json(&self.path, &inner.records) {
            inner.records.pop();
            tracing::error!(key = %record.key, error = %e, "failed to persist added record");
            return Err(e.into());
        }
        inner.last_timestamp = inner.last_timestamp.max(timestamp);

        tracing::debug!(
            key = %record.key,
            timestamp,
            pending = inner.records.len(),
            "record added"
        );
        Ok(record)
    }

    /// Producer entry point: store `fields` under a fresh key and timestamp.
    pub async fn submit(&self, fields: Fields) -> Result<Record, StorageError> {
        self.add(RecordDraft::new(fields)).await
    }

    /// The record with the smallest timestamp whose key is not excluded.
    /// Equal timestamps are broken by the lowest key.
    pub async fn oldest_excluding(&self, excluded: &HashSet<RecordKey>) -> Option<Record> {
        let inner = self.inner.lock().await;
        inner
            .records
            .iter()
            .filter(|r| !excluded.contains(&r.key))
            .min_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)))
            .cloned()
    }

    /// Delete the record with `key` and persist the snapshot. Returns false,
    /// without touching the file, when no such record exists.
    pub async fn remove(&self, key: &RecordKey) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().await;

        let Some(pos) = inner.records.iter().position(|r| &r.key == key) else {
            return Ok(false);
        };

        let removed = inner.records.remove(pos);
        if let Err(e) = write_json(&self.path, &inner.records) {
            inner.records.insert(pos, removed);
            tracing::warn!(key = %key, error = %e, "failed to persist record removal");
            return Err(e.into());
        }

        tracing::debug!(key = %key, pending = inner.records.len(), "record removed");
        Ok(true)
    }

    pub async fn contains(&self, key: &RecordKey) -> bool {
        self.inner.lock().await.records.iter().any(|r| &r.key == key)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Copy of the pending records in insertion order.
    pub async fn records(&self) -> Vec<Record> {
        self.inner.lock().await.records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fields(pairs: &[(&str, serde_json::Value)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn open_store(dir: &TempDir) -> RecordStore {
        RecordStore::open(&dir.path().join("records.json"))
    }

    /// Put a directory where the snapshot's temp file goes so every write fails.
    fn break_writes(store: &RecordStore) {
        let mut name = store.path().file_name().unwrap().to_os_string();
        name.push(".tmp");
        fs::create_dir(store.path().with_file_name(name)).unwrap();
    }

    #[tokio::test]
    async fn open_creates_empty_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        assert!(store.is_empty().await);
        let on_disk: Vec<Record> = read_json(store.path()).unwrap().unwrap();
        assert!(on_disk.is_empty());
    }

    #[tokio::test]
    async fn oldest_is_chosen_by_timestamp_not_insertion_order() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store
            .add(
                RecordDraft::new(fields(&[("dec", 1.into()), ("time", 100.into())]))
                    .with_key("1")
                    .with_timestamp(100),
            )
            .await
            .unwrap();
        store
            .add(
                RecordDraft::new(fields(&[("dec", 2.into()), ("time", 50.into())]))
                    .with_key("2")
                    .with_timestamp(50),
            )
            .await
            .unwrap();

        let oldest = store.oldest_excluding(&HashSet::new()).await.unwrap();
        assert_eq!(oldest.key, RecordKey::new("2"));
        assert_eq!(oldest.fields["time"], 50);
    }

    #[tokio::test]
    async fn oldest_skips_excluded_keys_and_breaks_ties_by_key() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        for key in ["b", "a", "c"] {
            store
                .add(RecordDraft::new(Fields::new()).with_key(key).with_timestamp(10))
                .await
                .unwrap();
        }

        let first = store.oldest_excluding(&HashSet::new()).await.unwrap();
        assert_eq!(first.key.as_str(), "a");

        let excluded: HashSet<RecordKey> = [RecordKey::new("a")].into_iter().collect();
        let second = store.oldest_excluding(&excluded).await.unwrap();
        assert_eq!(second.key.as_str(), "b");

        let all: HashSet<RecordKey> = ["a", "b", "c"].into_iter().map(RecordKey::new).collect();
        assert!(store.oldest_excluding(&all).await.is_none());
    }

    #[tokio::test]
    async fn assigned_timestamps_strictly_increase() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut last = 0;
        for _ in 0..20 {
            let record = store.submit(Fields::new()).await.unwrap();
            assert!(record.timestamp > last);
            last = record.timestamp;
        }
        assert_eq!(store.len().await, 20);
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store
            .add(RecordDraft::new(Fields::new()).with_key("k"))
            .await
            .unwrap();
        let err = store
            .add(RecordDraft::new(Fields::new()).with_key("k"))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::DuplicateKey(k) if k.as_str() == "k"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn bounded_add_refuses_when_full() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.add_bounded(RecordDraft::default(), Some(2)).await.unwrap();
        store.add_bounded(RecordDraft::default(), Some(2)).await.unwrap();
        let err = store
            .add_bounded(RecordDraft::default(), Some(2))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Full { capacity: 2 }));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn remove_missing_key_leaves_snapshot_identical() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .add(RecordDraft::new(Fields::new()).with_key("present"))
            .await
            .unwrap();

        let before = fs::read(store.path()).unwrap();
        let removed = store.remove(&RecordKey::new("absent")).await.unwrap();
        let after = fs::read(store.path()).unwrap();

        assert!(!removed);
        assert_eq!(before, after);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn remove_deletes_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .add(RecordDraft::new(Fields::new()).with_key("gone"))
            .await
            .unwrap();

        assert!(store.remove(&RecordKey::new("gone")).await.unwrap());
        assert!(!store.contains(&RecordKey::new("gone")).await);

        let reopened = open_store(&dir);
        assert!(reopened.is_empty().await);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store
                .add(RecordDraft::new(fields(&[("uid", "86-225-141-90".into())])).with_key("r1"))
                .await
                .unwrap();
        }

        let store = open_store(&dir);
        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_str(), "r1");
        assert_eq!(records[0].fields["uid"], "86-225-141-90");

        // Timestamps keep increasing after a restart
        let next = store.submit(Fields::new()).await.unwrap();
        assert!(next.timestamp > records[0].timestamp);
    }

    #[tokio::test]
    async fn corrupt_snapshot_opens_empty_and_recovers_on_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.json");
        fs::write(&path, b"{not json").unwrap();

        let store = RecordStore::open(&path);
        assert!(store.is_empty().await);

        store.submit(Fields::new()).await.unwrap();
        let on_disk: Vec<Record> = read_json(&path).unwrap().unwrap();
        assert_eq!(on_disk.len(), 1);
    }

    #[tokio::test]
    async fn failed_add_leaves_memory_and_disk_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .add(RecordDraft::new(Fields::new()).with_key("kept"))
            .await
            .unwrap();
        let before = fs::read(store.path()).unwrap();

        break_writes(&store);
        let err = store
            .add(RecordDraft::new(Fields::new()).with_key("lost"))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Snapshot(_)));
        assert_eq!(store.len().await, 1);
        assert!(!store.contains(&RecordKey::new("lost")).await);
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn failed_remove_keeps_the_record() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .add(RecordDraft::new(Fields::new()).with_key("stuck"))
            .await
            .unwrap();

        break_writes(&store);
        assert!(store.remove(&RecordKey::new("stuck")).await.is_err());
        assert!(store.contains(&RecordKey::new("stuck")).await);
    }
}
