//! Versioned object storage for synced files

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{GrafanaLambdaError, Result};

/// Versioned blob store addressed by key
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, pinned to `version` when given.
    /// Fails with `ObjectMissing` when the key or version does not exist.
    async fn get(&self, key: &str, version: Option<&str>) -> Result<Vec<u8>>;

    /// Store an object and return the version id the write produced
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<String>;
}

/// Object store kept in process memory, assigning sequential versions
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<(String, Vec<u8>)>>>,
    next_version: Mutex<u64>,
    puts: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys written so far, in order
    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().clone()
    }

    /// Id of the newest version stored under `key`
    pub fn latest_version(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .get(key)
            .and_then(|versions| versions.last())
            .map(|(version, _)| version.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str, version: Option<&str>) -> Result<Vec<u8>> {
        let objects = self.objects.lock();
        let found = objects.get(key).and_then(|versions| match version {
            Some(wanted) => versions.iter().find(|(v, _)| v == wanted),
            None => versions.last(),
        });

        found
            .map(|(_, body)| body.clone())
            .ok_or_else(|| GrafanaLambdaError::ObjectMissing {
                key: key.to_string(),
                version: version.map(String::from),
            })
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<String> {
        let version = {
            let mut next = self.next_version.lock();
            *next += 1;
            format!("v{}", *next)
        };
        self.objects
            .lock()
            .entry(key.to_string())
            .or_default()
            .push((version.clone(), body));
        self.puts.lock().push(key.to_string());
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_pins_versions() {
        let store = MemoryObjectStore::new();
        let v1 = store.put("p/data/a", b"one".to_vec()).await.unwrap();
        let v2 = store.put("p/data/a", b"two".to_vec()).await.unwrap();

        assert_ne!(v1, v2);
        assert_eq!(store.get("p/data/a", Some(&v1)).await.unwrap(), b"one");
        assert_eq!(store.get("p/data/a", None).await.unwrap(), b"two");
        assert_eq!(store.latest_version("p/data/a"), Some(v2));
    }

    #[tokio::test]
    async fn test_memory_store_missing_version() {
        let store = MemoryObjectStore::new();
        store.put("p/data/a", b"one".to_vec()).await.unwrap();

        let err = store.get("p/data/a", Some("nope")).await.unwrap_err();
        assert!(matches!(err, GrafanaLambdaError::ObjectMissing { .. }));
    }
}
