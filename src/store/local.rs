use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use crate::queue::{QueueError, Result};
use super::Partition;

const BLOB_DIR: &str = "blobs";
const RECORD_EXT: &str = "json";
const BLOB_EXT: &str = "bin";

/// Default per-record size limit, blobs are not subject to it
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Secondary index of one partition: index name -> value -> ids
#[derive(Debug, Default)]
struct PartitionIndex {
    by_value: HashMap<&'static str, HashMap<String, BTreeSet<String>>>,
    by_id: HashMap<String, Vec<(&'static str, String)>>,
}

impl PartitionIndex {
    fn insert(&mut self, partition: Partition, id: &str, record: &Value) {
        self.remove(id);

        let mut entries = Vec::new();
        for &index_name in partition.indexes() {
            if let Some(value) = index_value(record, index_name) {
                self.by_value
                    .entry(index_name)
                    .or_default()
                    .entry(value.clone())
                    .or_default()
                    .insert(id.to_string());
                entries.push((index_name, value));
            }
        }

        if !entries.is_empty() {
            self.by_id.insert(id.to_string(), entries);
        }
    }

    fn remove(&mut self, id: &str) {
        let Some(entries) = self.by_id.remove(id) else {
            return;
        };

        for (index_name, value) in entries {
            if let Some(values) = self.by_value.get_mut(index_name) {
                if let Some(ids) = values.get_mut(&value) {
                    ids.remove(id);
                    if ids.is_empty() {
                        values.remove(&value);
                    }
                }
            }
        }
    }

    fn lookup(&self, index_name: &str, value: &str) -> Vec<String> {
        self.by_value
            .get(index_name)
            .and_then(|values| values.get(value))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn index_value(record: &Value, index_name: &str) -> Option<String> {
    match record.get(index_name)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// File-backed object store with named partitions.
///
/// Layout under `root`:
/// - `<partition>/<id>.json` structured records
/// - `blobs/<id>.bin` binary payloads, kept apart from the records so a
///   large payload never goes through the JSON path
///
/// Writes go to a temp file first and are renamed into place. The index
/// lock is held for the whole write so the on-disk record and the index
/// never disagree.
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
    max_record_bytes: usize,
    indexes: RwLock<HashMap<Partition, PartitionIndex>>,
}

impl LocalStore {
    /// Opens the store, creating partitions if absent. Safe to call again on
    /// a directory that is already initialised.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_limit(root, DEFAULT_MAX_RECORD_BYTES).await
    }

    pub async fn open_with_limit(root: impl Into<PathBuf>, max_record_bytes: usize) -> Result<Self> {
        let root = root.into();

        for dir in Partition::ALL.iter().map(|p| p.dir_name()).chain([BLOB_DIR]) {
            tokio::fs::create_dir_all(root.join(dir))
                .await
                .map_err(|err| QueueError::storage_unavailable(&root, err))?;
        }

        // A read-only mount passes create_dir_all when the dirs already exist
        let probe = root.join(".probe");
        tokio::fs::write(&probe, b"ok")
            .await
            .map_err(|err| QueueError::storage_unavailable(&root, err))?;
        let _ = tokio::fs::remove_file(&probe).await;

        let mut indexes = HashMap::new();
        for partition in Partition::ALL {
            let mut index = PartitionIndex::default();
            if !partition.indexes().is_empty() {
                let records = scan_partition(&root, partition)
                    .await
                    .map_err(|err| QueueError::storage_unavailable(&root, err))?;
                for (id, record) in records {
                    index.insert(partition, &id, &record);
                }
            }
            indexes.insert(partition, index);
        }

        debug!(root = %root.display(), "local store opened");

        Ok(Self {
            root,
            max_record_bytes,
            indexes: RwLock::new(indexes),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Upsert a record
    pub async fn put(&self, partition: Partition, id: &str, record: &Value) -> Result<()> {
        check_id(id)?;
        let data = serde_json::to_vec(record)?;
        if data.len() > self.max_record_bytes {
            return Err(QueueError::RecordTooLarge {
                id: id.to_string(),
                size: data.len(),
                limit: self.max_record_bytes,
            });
        }

        let mut indexes = self.indexes.write().await;
        write_atomic(&self.record_path(partition, id), &data).await?;
        indexes.entry(partition).or_default().insert(partition, id, record);

        Ok(())
    }

    pub async fn get(&self, partition: Partition, id: &str) -> Result<Option<Value>> {
        check_id(id)?;
        let _guard = self.indexes.read().await;
        read_record(&self.record_path(partition, id)).await
    }

    /// All records whose `index_name` field equals `value`
    pub async fn query_by_index(&self, partition: Partition, index_name: &str, value: &str) -> Result<Vec<Value>> {
        if !partition.indexes().iter().any(|name| *name == index_name) {
            return Err(QueueError::storage(format!(
                "partition {} has no index named {}",
                partition.dir_name(),
                index_name
            )));
        }

        let indexes = self.indexes.read().await;
        let ids = indexes
            .get(&partition)
            .map(|index| index.lookup(index_name, value))
            .unwrap_or_default();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match read_record(&self.record_path(partition, &id)).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => warn!(partition = partition.dir_name(), %id, "indexed record missing on disk"),
                Err(err) => warn!(partition = partition.dir_name(), %id, %err, "skipping unreadable record"),
            }
        }

        Ok(records)
    }

    pub async fn delete(&self, partition: Partition, id: &str) -> Result<()> {
        check_id(id)?;
        let mut indexes = self.indexes.write().await;
        remove_if_exists(&self.record_path(partition, id)).await?;
        if let Some(index) = indexes.get_mut(&partition) {
            index.remove(id);
        }

        Ok(())
    }

    /// Ids of every record in a partition
    pub async fn list_ids(&self, partition: Partition) -> Result<Vec<String>> {
        let _guard = self.indexes.read().await;
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(partition.dir_name())).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(RECORD_EXT) {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();

        Ok(ids)
    }

    pub async fn put_blob(&self, id: &str, data: &[u8]) -> Result<()> {
        check_id(id)?;
        write_atomic(&self.blob_path(id), data).await
    }

    pub async fn get_blob(&self, id: &str) -> Result<Option<Bytes>> {
        check_id(id)?;
        match tokio::fs::read(self.blob_path(id)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn has_blob(&self, id: &str) -> Result<bool> {
        check_id(id)?;
        Ok(tokio::fs::try_exists(self.blob_path(id)).await?)
    }

    pub async fn delete_blob(&self, id: &str) -> Result<()> {
        check_id(id)?;
        remove_if_exists(&self.blob_path(id)).await
    }

    /// Save an in-progress domain snapshot, e.g. a half-filled inspection form
    pub async fn save_snapshot<T: Serialize>(&self, id: &str, snapshot: &T) -> Result<()> {
        let value = serde_json::to_value(snapshot)?;
        self.put(Partition::Snapshots, id, &value).await
    }

    pub async fn load_snapshot<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        match self.get(Partition::Snapshots, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_snapshot(&self, id: &str) -> Result<()> {
        self.delete(Partition::Snapshots, id).await
    }

    pub async fn list_snapshot_ids(&self) -> Result<Vec<String>> {
        self.list_ids(Partition::Snapshots).await
    }

    fn record_path(&self, partition: Partition, id: &str) -> PathBuf {
        self.root
            .join(partition.dir_name())
            .join(format!("{}.{}", id, RECORD_EXT))
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join(BLOB_DIR).join(format!("{}.{}", id, BLOB_EXT))
    }
}

// Ids become file names
fn check_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0']);

    if valid {
        Ok(())
    } else {
        Err(QueueError::storage(format!("invalid record id {:?}", id)))
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;

    Ok(())
}

async fn read_record(path: &Path) -> Result<Option<Value>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn scan_partition(root: &Path, partition: Partition) -> std::io::Result<Vec<(String, Value)>> {
    let mut records = Vec::new();
    let mut entries = tokio::fs::read_dir(root.join(partition.dir_name())).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|stem| stem.to_str()).map(String::from) else {
            continue;
        };

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unreadable record");
                continue;
            }
        };
        match serde_json::from_slice::<Value>(&data) {
            Ok(record) => records.push((id, record)),
            Err(err) => warn!(path = %path.display(), %err, "skipping unreadable record"),
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct InspectionDraft {
        inspection_id: String,
        checked_items: Vec<String>,
    }

    #[tokio::test]
    async fn test_put_get_overwrite_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        store.put(Partition::Uploads, "a", &json!({"status": "pending", "n": 1})).await.unwrap();
        store.put(Partition::Uploads, "a", &json!({"status": "pending", "n": 2})).await.unwrap();

        let record = store.get(Partition::Uploads, "a").await.unwrap().unwrap();
        assert_eq!(record["n"], 2);

        store.delete(Partition::Uploads, "a").await.unwrap();
        assert!(store.get(Partition::Uploads, "a").await.unwrap().is_none());
        // Deleting twice is fine
        store.delete(Partition::Uploads, "a").await.unwrap();
    }

    #[tokio::test]
    async fn test_status_index_follows_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        store.put(Partition::Uploads, "a", &json!({"status": "pending"})).await.unwrap();
        store.put(Partition::Uploads, "b", &json!({"status": "pending"})).await.unwrap();
        store.put(Partition::Uploads, "a", &json!({"status": "completed"})).await.unwrap();

        let pending = store.query_by_index(Partition::Uploads, "status", "pending").await.unwrap();
        assert_eq!(pending, vec![json!({"status": "pending"})]);

        let completed = store.query_by_index(Partition::Uploads, "status", "completed").await.unwrap();
        assert_eq!(completed.len(), 1);

        store.delete(Partition::Uploads, "b").await.unwrap();
        assert!(store.query_by_index(Partition::Uploads, "status", "pending").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_rebuilt_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LocalStore::open(dir.path()).await.unwrap();
            store.put(Partition::Uploads, "a", &json!({"status": "pending"})).await.unwrap();
        }

        let store = LocalStore::open(dir.path()).await.unwrap();
        let pending = store.query_by_index(Partition::Uploads, "status", "pending").await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_skips_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LocalStore::open(dir.path()).await.unwrap();
            store.put(Partition::Uploads, "a", &json!({"status": "pending"})).await.unwrap();
        }
        std::fs::write(dir.path().join("uploads").join("torn.json"), b"{\"status\": \"pen").unwrap();
        // A directory where a record file is expected cannot be read
        std::fs::create_dir(dir.path().join("uploads").join("odd.json")).unwrap();

        let store = LocalStore::open(dir.path()).await.unwrap();
        let pending = store.query_by_index(Partition::Uploads, "status", "pending").await.unwrap();
        assert_eq!(pending, vec![json!({"status": "pending"})]);
    }

    #[tokio::test]
    async fn test_unknown_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        let result = store.query_by_index(Partition::Snapshots, "status", "pending").await;
        assert!(matches!(result, Err(QueueError::Storage(_))));
    }

    #[tokio::test]
    async fn test_blobs_are_separate_from_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        store.put_blob("a", &[1, 2, 3]).await.unwrap();
        assert_eq!(store.get_blob("a").await.unwrap(), Some(Bytes::from_static(&[1, 2, 3])));
        assert!(store.get(Partition::Uploads, "a").await.unwrap().is_none());

        store.delete_blob("a").await.unwrap();
        assert!(store.get_blob("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open_with_limit(dir.path(), 16).await.unwrap();

        let result = store.put(Partition::Snapshots, "big", &json!({"data": "x".repeat(64)})).await;
        assert!(matches!(result, Err(QueueError::RecordTooLarge { limit: 16, .. })));
        assert!(store.get(Partition::Snapshots, "big").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        assert!(store.put(Partition::Snapshots, "../escape", &json!({})).await.is_err());
        assert!(store.get_blob("").await.is_err());
    }

    #[tokio::test]
    async fn test_open_fails_when_root_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let result = LocalStore::open(file.join("store")).await;
        assert!(matches!(result, Err(QueueError::StorageUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_snapshot_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        let draft = InspectionDraft {
            inspection_id: "qc-42".to_string(),
            checked_items: vec!["seams".to_string(), "labels".to_string()],
        };
        store.save_snapshot("qc-42", &draft).await.unwrap();

        let loaded: Option<InspectionDraft> = store.load_snapshot("qc-42").await.unwrap();
        assert_eq!(loaded, Some(draft));
        assert_eq!(store.list_snapshot_ids().await.unwrap(), vec!["qc-42".to_string()]);

        store.delete_snapshot("qc-42").await.unwrap();
        assert!(store.load_snapshot::<InspectionDraft>("qc-42").await.unwrap().is_none());
    }
}
