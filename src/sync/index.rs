//! File index: which remote version each synced path was last seen at
//!
//! Serialized as one JSON object `{relativePath: [versionId, modifiedNanos]}`
//! stored under a single fixed id.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Remote version and local mtime of one synced file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, i64)", into = "(String, i64)")]
pub struct FileIndexEntry {
    pub version_id: String,
    /// Local modification time, nanoseconds since the epoch
    pub modified_nanos: i64,
}

impl From<(String, i64)> for FileIndexEntry {
    fn from((version_id, modified_nanos): (String, i64)) -> Self {
        Self {
            version_id,
            modified_nanos,
        }
    }
}

impl From<FileIndexEntry> for (String, i64) {
    fn from(entry: FileIndexEntry) -> Self {
        (entry.version_id, entry.modified_nanos)
    }
}

/// Relative path -> entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileIndex {
    entries: BTreeMap<String, FileIndexEntry>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileIndexEntry> {
        self.entries.get(relative_path)
    }

    pub fn insert(&mut self, relative_path: impl Into<String>, entry: FileIndexEntry) {
        self.entries.insert(relative_path.into(), entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileIndexEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Durable home of the file index
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Strongly consistent read; an absent index loads as empty
    async fn load(&self) -> Result<FileIndex>;

    /// Replace the stored index wholesale
    async fn save(&self, index: &FileIndex) -> Result<()>;
}

/// Index kept in process memory
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    stored: Mutex<Option<String>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw JSON as last saved
    pub fn raw(&self) -> Option<String> {
        self.stored.lock().clone()
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn load(&self) -> Result<FileIndex> {
        match self.stored.lock().as_deref() {
            Some(json) => FileIndex::from_json(json),
            None => Ok(FileIndex::new()),
        }
    }

    async fn save(&self, index: &FileIndex) -> Result<()> {
        *self.stored.lock() = Some(index.to_json()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_index_json_shape() {
        let mut index = FileIndex::new();
        index.insert(
            "data/grafana.db",
            FileIndexEntry {
                version_id: "v2".into(),
                modified_nanos: 1_700_000_000_123_456_789,
            },
        );

        assert_eq!(
            index.to_json().unwrap(),
            r#"{"data/grafana.db":["v2",1700000000123456789]}"#
        );
    }

    #[test]
    fn test_index_parses_existing_blob() {
        let index = FileIndex::from_json(
            r#"{"plugins/a/module.js": ["abc", 5], "data/grafana.db": ["def", 7]}"#,
        )
        .unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.get("data/grafana.db").unwrap().version_id, "def");
        assert_eq!(index.get("plugins/a/module.js").unwrap().modified_nanos, 5);
    }

    #[tokio::test]
    async fn test_memory_store_starts_empty() {
        let store = MemoryIndexStore::new();
        assert!(store.load().await.unwrap().is_empty());
        assert!(store.raw().is_none());
    }
}
