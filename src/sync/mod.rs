//! State sync between the local Grafana directories and remote storage
//!
//! Two roots under the state directory (`data/` and `plugins/`) are mirrored
//! file by file. Each file is tracked by the remote version it was last
//! synced at and its local mtime after that sync. Neither pass takes the
//! lease lock itself: callers must hold it.

mod cloud;
#[cfg(feature = "cloud")]
mod dynamodb;
mod index;
#[cfg(feature = "cloud")]
mod s3;

pub use cloud::{MemoryObjectStore, ObjectStore};
#[cfg(feature = "cloud")]
pub use dynamodb::DynamoIndexStore;
pub use index::{FileIndex, FileIndexEntry, IndexStore, MemoryIndexStore};
#[cfg(feature = "cloud")]
pub use s3::S3ObjectStore;

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use walkdir::WalkDir;

use crate::clock::SharedClock;
use crate::error::{GrafanaLambdaError, Result};

/// Local roots mirrored to remote storage, relative to the state directory
pub const SYNC_ROOTS: [&str; 2] = ["data", "plugins"];

/// Sync direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Download,
    Upload,
}

/// Outcome of one sync pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub direction: SyncDirection,
    pub files_transferred: usize,
    pub files_skipped: usize,
    pub bytes_transferred: u64,
}

impl SyncReport {
    fn new(direction: SyncDirection) -> Self {
        Self {
            direction,
            files_transferred: 0,
            files_skipped: 0,
            bytes_transferred: 0,
        }
    }
}

/// Where synced files live locally and remotely
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Parent of the `data/` and `plugins/` roots
    pub state_dir: PathBuf,
    /// Remote key prefix; objects live at `<prefix>/<relative path>`
    pub prefix: String,
    /// Skip index entries whose remote object has vanished instead of failing
    pub tolerate_missing: bool,
    pub throttle_backoff: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/tmp/grafana"),
            prefix: String::new(),
            tolerate_missing: false,
            throttle_backoff: Duration::from_millis(200),
        }
    }
}

/// Mirrors the Grafana state directory against remote storage
pub struct DataSynchronizer {
    objects: Arc<dyn ObjectStore>,
    index_store: Arc<dyn IndexStore>,
    clock: SharedClock,
    settings: SyncSettings,
    /// What this environment has materialized locally; empty on cold start
    cache: FileIndex,
}

impl DataSynchronizer {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        index_store: Arc<dyn IndexStore>,
        clock: SharedClock,
        settings: SyncSettings,
    ) -> Self {
        Self {
            objects,
            index_store,
            clock,
            settings,
            cache: FileIndex::new(),
        }
    }

    pub fn cache(&self) -> &FileIndex {
        &self.cache
    }

    /// Fetch every indexed file whose remote version differs from what this
    /// environment already has.
    pub async fn download_changed(&mut self) -> Result<SyncReport> {
        let index_store = self.index_store.clone();
        let remote = self
            .absorb_throttling(|| {
                let store = index_store.clone();
                async move { store.load().await }
            })
            .await?;

        let mut report = SyncReport::new(SyncDirection::Download);

        for (relative_path, entry) in remote.iter() {
            if self
                .cache
                .get(relative_path)
                .is_some_and(|cached| cached.version_id == entry.version_id)
            {
                tracing::debug!("Already have {}", relative_path);
                report.files_skipped += 1;
                continue;
            }

            let local_path = self.local_path(relative_path)?;
            let key = self.remote_key(relative_path);
            tracing::info!("Downloading {} ({})", relative_path, entry.version_id);

            let body = match self.objects.get(&key, Some(&entry.version_id)).await {
                Ok(body) => body,
                Err(GrafanaLambdaError::ObjectMissing { .. }) if self.settings.tolerate_missing => {
                    tracing::warn!("Remote object for {} is missing, skipping", relative_path);
                    report.files_skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&local_path, &body).await?;

            let metadata = tokio::fs::metadata(&local_path).await?;
            self.cache.insert(
                relative_path.clone(),
                FileIndexEntry {
                    version_id: entry.version_id.clone(),
                    modified_nanos: modified_nanos(&metadata)?,
                },
            );

            report.files_transferred += 1;
            report.bytes_transferred += body.len() as u64;
        }

        Ok(report)
    }

    /// Upload every file under the sync roots whose mtime moved since it was
    /// last synced, then overwrite the remote index with the full cache.
    pub async fn upload_changed(&mut self) -> Result<SyncReport> {
        let mut report = SyncReport::new(SyncDirection::Upload);

        for root in SYNC_ROOTS {
            let root_path = self.settings.state_dir.join(root);
            if !root_path.exists() {
                tracing::debug!("Sync root {} does not exist", root_path.display());
                continue;
            }

            for entry in WalkDir::new(&root_path).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }

                let relative_path = self.relative_path(entry.path())?;
                let modified = modified_nanos(&entry.metadata()?)?;

                if self
                    .cache
                    .get(&relative_path)
                    .is_some_and(|cached| cached.modified_nanos == modified)
                {
                    tracing::debug!("Unchanged {}", relative_path);
                    report.files_skipped += 1;
                    continue;
                }

                tracing::info!("Uploading {}", relative_path);
                let body = tokio::fs::read(entry.path()).await?;
                let size = body.len() as u64;
                let version_id = self
                    .objects
                    .put(&self.remote_key(&relative_path), body)
                    .await?;

                self.cache.insert(
                    relative_path,
                    FileIndexEntry {
                        version_id,
                        modified_nanos: modified,
                    },
                );
                report.files_transferred += 1;
                report.bytes_transferred += size;
            }
        }

        let index_store = self.index_store.clone();
        let index = self.cache.clone();
        self.absorb_throttling(|| {
            let store = index_store.clone();
            let index = index.clone();
            async move { store.save(&index).await }
        })
        .await?;

        Ok(report)
    }

    fn remote_key(&self, relative_path: &str) -> String {
        let prefix = self.settings.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            relative_path.to_string()
        } else {
            format!("{}/{}", prefix, relative_path)
        }
    }

    /// Resolve an index path under the state directory, rejecting escapes
    fn local_path(&self, relative_path: &str) -> Result<PathBuf> {
        let relative = Path::new(relative_path);
        let confined = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !confined {
            return Err(GrafanaLambdaError::Store(format!(
                "index path {} escapes the state directory",
                relative_path
            )));
        }
        Ok(self.settings.state_dir.join(relative))
    }

    fn relative_path(&self, path: &Path) -> Result<String> {
        let relative = path.strip_prefix(&self.settings.state_dir).map_err(|_| {
            GrafanaLambdaError::Config(format!(
                "{} is outside {}",
                path.display(),
                self.settings.state_dir.display()
            ))
        })?;

        Ok(relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }

    async fn absorb_throttling<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            match op().await {
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Waiting for throttle: {}", e);
                    self.clock.sleep(self.settings.throttle_backoff).await;
                }
                other => return other,
            }
        }
    }
}

fn modified_nanos(metadata: &std::fs::Metadata) -> Result<i64> {
    let since_epoch = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(since_epoch.as_nanos() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        objects: Arc<MemoryObjectStore>,
        index: Arc<MemoryIndexStore>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                objects: Arc::new(MemoryObjectStore::new()),
                index: Arc::new(MemoryIndexStore::new()),
                clock: Arc::new(ManualClock::at_epoch(1_000)),
            }
        }

        /// A fresh environment sharing the remote side of this fixture
        fn environment(&self, state_dir: &Path) -> DataSynchronizer {
            DataSynchronizer::new(
                self.objects.clone(),
                self.index.clone(),
                self.clock.clone(),
                SyncSettings {
                    state_dir: state_dir.to_path_buf(),
                    prefix: "grafana".into(),
                    ..SyncSettings::default()
                },
            )
        }

        fn write(&self, relative: &str, body: &str) {
            let path = self.dir.path().join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
    }

    #[tokio::test]
    async fn test_upload_then_unchanged_upload_transfers_nothing() {
        let fx = Fixture::new();
        fx.write("data/grafana.db", "sqlite");
        fx.write("plugins/panel/module.js", "js");
        let mut sync = fx.environment(fx.dir.path());

        let first = sync.upload_changed().await.unwrap();
        assert_eq!(first.direction, SyncDirection::Upload);
        assert_eq!(first.files_transferred, 2);
        assert_eq!(first.bytes_transferred, 8);

        let second = sync.upload_changed().await.unwrap();
        assert_eq!(second.files_transferred, 0);
        assert_eq!(second.files_skipped, 2);
        assert_eq!(second.bytes_transferred, 0);
        assert_eq!(fx.objects.puts().len(), 2);
    }

    #[tokio::test]
    async fn test_index_maps_paths_to_uploaded_versions() {
        let fx = Fixture::new();
        fx.write("data/grafana.db", "sqlite");
        fx.write("plugins/panel/module.js", "js");
        let mut sync = fx.environment(fx.dir.path());

        sync.upload_changed().await.unwrap();

        let stored = fx.index.load().await.unwrap();
        assert_eq!(stored.len(), 2);
        for (path, entry) in stored.iter() {
            let key = format!("grafana/{}", path);
            assert_eq!(Some(entry.version_id.clone()), fx.objects.latest_version(&key));
        }
        assert_eq!(&stored, sync.cache());
    }

    #[tokio::test]
    async fn test_changed_file_is_reuploaded() {
        let fx = Fixture::new();
        fx.write("data/grafana.db", "v1");
        let mut sync = fx.environment(fx.dir.path());
        sync.upload_changed().await.unwrap();
        let before = sync.cache().get("data/grafana.db").unwrap().clone();

        let path = fx.dir.path().join("data/grafana.db");
        std::fs::write(&path, "v2 contents").unwrap();
        let later = std::time::SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let report = sync.upload_changed().await.unwrap();
        let after = sync.cache().get("data/grafana.db").unwrap();

        assert_eq!(report.files_transferred, 1);
        assert_ne!(after.version_id, before.version_id);
        assert_ne!(after.modified_nanos, before.modified_nanos);
    }

    #[tokio::test]
    async fn test_download_into_fresh_environment() {
        let fx = Fixture::new();
        fx.write("data/grafana.db", "sqlite");
        fx.write("plugins/panel/module.js", "js");
        fx.environment(fx.dir.path())
            .upload_changed()
            .await
            .unwrap();

        let cold = TempDir::new().unwrap();
        let mut sync = fx.environment(cold.path());
        let report = sync.download_changed().await.unwrap();

        assert_eq!(report.direction, SyncDirection::Download);
        assert_eq!(report.files_transferred, 2);
        assert_eq!(
            std::fs::read_to_string(cold.path().join("data/grafana.db"))
                .unwrap(),
            "sqlite"
        );
        assert_eq!(
            std::fs::read_to_string(cold.path().join("plugins/panel/module.js"))
                .unwrap(),
            "js"
        );

        // Same versions on the next invocation in this environment.
        let again = sync.download_changed().await.unwrap();
        assert_eq!(again.files_transferred, 0);
        assert_eq!(again.files_skipped, 2);

        // Freshly downloaded files are not echoed back.
        let upload = sync.upload_changed().await.unwrap();
        assert_eq!(upload.files_transferred, 0);
    }

    #[tokio::test]
    async fn test_download_picks_up_newer_remote_version() {
        let fx = Fixture::new();
        fx.write("data/grafana.db", "first");
        let mut writer = fx.environment(fx.dir.path());
        writer.upload_changed().await.unwrap();

        let other = TempDir::new().unwrap();
        let mut reader = fx.environment(other.path());
        reader.download_changed().await.unwrap();

        let path = fx.dir.path().join("data/grafana.db");
        std::fs::write(&path, "second").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(std::time::SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        writer.upload_changed().await.unwrap();

        let report = reader.download_changed().await.unwrap();
        assert_eq!(report.files_transferred, 1);
        assert_eq!(
            std::fs::read_to_string(other.path().join("data/grafana.db"))
                .unwrap(),
            "second"
        );
    }

    #[tokio::test]
    async fn test_missing_object_is_fatal_unless_tolerated() {
        let fx = Fixture::new();
        let mut index = FileIndex::new();
        index.insert(
            "data/gone.db",
            FileIndexEntry {
                version_id: "v404".into(),
                modified_nanos: 1,
            },
        );
        fx.index.save(&index).await.unwrap();

        let dir = TempDir::new().unwrap();
        let err = fx
            .environment(dir.path())
            .download_changed()
            .await
            .unwrap_err();
        assert!(matches!(err, GrafanaLambdaError::ObjectMissing { .. }));

        let mut tolerant = DataSynchronizer::new(
            fx.objects.clone(),
            fx.index.clone(),
            fx.clock.clone(),
            SyncSettings {
                state_dir: dir.path().to_path_buf(),
                prefix: "grafana".into(),
                tolerate_missing: true,
                ..SyncSettings::default()
            },
        );
        let report = tolerant.download_changed().await.unwrap();
        assert_eq!(report.files_skipped, 1);
        assert!(tolerant.cache().is_empty());
    }

    #[tokio::test]
    async fn test_escaping_index_path_is_rejected() {
        let fx = Fixture::new();
        let mut index = FileIndex::new();
        index.insert(
            "../etc/passwd",
            FileIndexEntry {
                version_id: "v1".into(),
                modified_nanos: 1,
            },
        );
        fx.index.save(&index).await.unwrap();

        let err = fx
            .environment(fx.dir.path())
            .download_changed()
            .await
            .unwrap_err();
        assert!(matches!(err, GrafanaLambdaError::Store(_)));
    }

    #[tokio::test]
    async fn test_missing_roots_upload_empty_index() {
        let fx = Fixture::new();
        let mut sync = fx.environment(fx.dir.path());

        let report = sync.upload_changed().await.unwrap();

        assert_eq!(report.files_transferred, 0);
        assert_eq!(fx.index.raw().as_deref(), Some("{}"));
    }

    /// Index store that throttles a fixed number of times first
    struct ThrottlingIndex {
        inner: MemoryIndexStore,
        remaining: Mutex<u32>,
    }

    #[async_trait]
    impl IndexStore for ThrottlingIndex {
        async fn load(&self) -> Result<FileIndex> {
            {
                let mut remaining = self.remaining.lock();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(GrafanaLambdaError::StoreThrottled("busy".into()));
                }
            }
            self.inner.load().await
        }

        async fn save(&self, index: &FileIndex) -> Result<()> {
            self.inner.save(index).await
        }
    }

    #[tokio::test]
    async fn test_index_throttling_is_absorbed() {
        let clock = Arc::new(ManualClock::at_epoch(1_000));
        let dir = TempDir::new().unwrap();
        let mut sync = DataSynchronizer::new(
            Arc::new(MemoryObjectStore::new()),
            Arc::new(ThrottlingIndex {
                inner: MemoryIndexStore::new(),
                remaining: Mutex::new(2),
            }),
            clock.clone(),
            SyncSettings {
                state_dir: dir.path().to_path_buf(),
                ..SyncSettings::default()
            },
        );

        sync.download_changed().await.unwrap();

        assert_eq!(clock.sleeps(), vec![Duration::from_millis(200); 2]);
    }
}
