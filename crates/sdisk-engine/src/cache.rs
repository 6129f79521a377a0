//! Shared layer cache
//!
//! Layer blobs live once under `layer-cache/` no matter how many disks use
//! them. References are counted in the state store; a per-layer async lock
//! serializes download, attach and garbage collection of the same layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use sdisk_common::{DiskError, DiskResult, Layout, LayerRecord, ManifestLayer, ResultExt};
use sdisk_image::ImageTool;
use sdisk_remote::RemoteStore;
use sdisk_state::StateStore;

use crate::shared::remove_if_exists;

/// Content-addressed-by-id store of immutable layer images
pub struct LayerCache {
    layout: Layout,
    state: Arc<StateStore>,
    remote: Option<RemoteStore>,
    tool: Arc<dyn ImageTool>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LayerCache {
    pub fn new(
        layout: Layout,
        state: Arc<StateStore>,
        remote: Option<RemoteStore>,
        tool: Arc<dyn ImageTool>,
    ) -> Self {
        Self {
            layout,
            state,
            remote,
            tool,
            locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn layer_path(&self, layer_id: &str) -> PathBuf {
        self.layout.cache_blob(layer_id)
    }

    /// Whether the blob of `layer_id` is present locally
    pub async fn contains(&self, layer_id: &str) -> bool {
        tokio::fs::try_exists(self.layer_path(layer_id))
            .await
            .unwrap_or(false)
    }

    fn lock_for(&self, layer_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(layer_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_lock(&self, layer_id: &str) {
        self.locks
            .remove_if(layer_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Make `layer` available locally and map it into `disk` at `position`.
    ///
    /// A blob already in the cache only gains a reference. A missing blob is
    /// downloaded, verified against the manifest checksum and registered.
    pub async fn get_or_download(
        &self,
        disk: &str,
        position: u32,
        layer: &ManifestLayer,
    ) -> DiskResult<PathBuf> {
        let lock = self.lock_for(&layer.id);
        let _guard = lock.lock().await;
        let path = self.layer_path(&layer.id);
        let record = self.state.get_layer(&layer.id)?;
        let present = tokio::fs::try_exists(&path).await?;

        match (record, present) {
            (Some(_), true) => {
                let refs = self.state.attach_layer(disk, &layer.id, position)?;
                debug!("layer {} cached (refs={refs})", layer.id);
            }
            (Some(_), false) => {
                warn!("layer {} recorded but missing from cache, fetching", layer.id);
                let (checksum, size) = self.fetch(disk, layer, &path).await?;
                self.state.refresh_layer(&layer.id, &checksum, size)?;
                self.state.attach_layer(disk, &layer.id, position)?;
            }
            (None, true) => {
                let (checksum, size) = self.verify(layer, &path).await?;
                self.state
                    .register_layer(&LayerRecord::new(&layer.id, checksum, size), disk, position)?;
                debug!("adopted unrecorded blob of layer {}", layer.id);
            }
            (None, false) => {
                let (checksum, size) = self.fetch(disk, layer, &path).await?;
                self.state
                    .register_layer(&LayerRecord::new(&layer.id, checksum, size), disk, position)?;
            }
        }
        Ok(path)
    }

    /// Adopt a blob already written to [`Self::layer_path`] as a new layer
    /// owned by `disk` at `position`
    pub async fn register(&self, disk: &str, position: u32, layer_id: &str) -> DiskResult<LayerRecord> {
        let lock = self.lock_for(layer_id);
        let _guard = lock.lock().await;
        let path = self.layer_path(layer_id);
        let checksum = self.tool.checksum(&path).await?;
        let size = self.tool.actual_size(&path).await?;
        let record = LayerRecord::new(layer_id, checksum, size);
        self.state.register_layer(&record, disk, position)?;
        debug!("registered layer {layer_id} for {disk} ({size} bytes)");
        Ok(record)
    }

    async fn fetch(&self, disk: &str, layer: &ManifestLayer, path: &Path) -> DiskResult<(String, u64)> {
        let remote = self.remote.as_ref().ok_or(DiskError::RemoteNotConfigured)?;
        let len = remote
            .download_layer(disk, &layer.id, path)
            .await
            .with_context(|| format!("download layer {}", layer.id))?;
        info!("downloaded layer {} of {disk} ({len} bytes)", layer.id);
        self.verify(layer, path).await
    }

    /// Check the blob at `path` against the manifest. A mismatching blob is
    /// removed so the next attempt downloads it again.
    async fn verify(&self, layer: &ManifestLayer, path: &Path) -> DiskResult<(String, u64)> {
        let actual = self.tool.checksum(path).await?;
        if !layer.checksum.is_empty() && actual != layer.checksum {
            if let Err(e) = remove_if_exists(path).await {
                warn!("failed to remove corrupt layer {}: {e}", layer.id);
            }
            return Err(DiskError::ChecksumMismatch {
                layer_id: layer.id.clone(),
                expected: layer.checksum.clone(),
                actual,
            });
        }
        let size = self.tool.actual_size(path).await?;
        Ok((actual, size))
    }

    /// Delete every layer no disk references. Failures on individual layers
    /// are logged and skipped. Returns the number of layers removed.
    pub async fn cleanup_unused_layers(&self) -> DiskResult<usize> {
        let unused = self.state.list_unused_layers()?;
        let mut removed = 0;
        for layer in unused {
            let lock = self.lock_for(&layer.id);
            let guard = lock.lock().await;
            if self.remove_unused(&layer.id).await {
                removed += 1;
            }
            drop(guard);
            drop(lock);
            self.release_lock(&layer.id);
        }
        if removed > 0 {
            info!("removed {removed} unused layer(s)");
        }
        Ok(removed)
    }

    /// Caller holds the layer lock
    async fn remove_unused(&self, layer_id: &str) -> bool {
        match self.state.get_layer(layer_id) {
            Ok(Some(record)) if record.ref_count == 0 => {}
            Ok(_) => return false,
            Err(e) => {
                warn!("skipping cleanup of {layer_id}: {e}");
                return false;
            }
        }
        if let Err(e) = remove_if_exists(&self.layer_path(layer_id)).await {
            warn!("failed to remove blob of {layer_id}: {e}");
            return false;
        }
        match self.state.delete_layer_if_unused(layer_id) {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("failed to delete record of {layer_id}: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sdisk_common::ImageConfig;
    use sdisk_image::FakeImageTool;
    use std::time::Duration;

    use crate::testutil::CountingStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: Layout,
        state: Arc<StateStore>,
        tool: Arc<FakeImageTool>,
        remote: RemoteStore,
        cache: LayerCache,
    }

    fn fixture() -> Fixture {
        fixture_with(RemoteStore::in_memory())
    }

    fn fixture_with(remote: RemoteStore) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.create_dirs().unwrap();
        let state = Arc::new(StateStore::open(layout.state_db()).unwrap());
        let tool = Arc::new(FakeImageTool::new());
        let cache = LayerCache::new(
            layout.clone(),
            state.clone(),
            Some(remote.clone()),
            tool.clone(),
        );
        Fixture {
            _dir: dir,
            layout,
            state,
            tool,
            remote,
            cache,
        }
    }

    /// Upload a one-cluster layer and return its manifest entry
    async fn publish(f: &Fixture, disk: &str, id: &str) -> ManifestLayer {
        let src = f.layout.root().join(format!("{id}.src"));
        f.tool.create(&src, 1, &ImageConfig::default()).await.unwrap();
        f.tool.write_cluster(&src, 0, id).unwrap();
        f.remote.upload_layer(disk, id, &src).await.unwrap();
        ManifestLayer {
            id: id.to_string(),
            parent_id: None,
            created: Utc::now(),
            size: f.tool.actual_size(&src).await.unwrap(),
            checksum: f.tool.checksum(&src).await.unwrap(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_download_then_share() {
        let f = fixture();
        let layer = publish(&f, "a", "layer-1").await;

        let path = f.cache.get_or_download("a", 0, &layer).await.unwrap();
        assert!(path.exists());
        assert!(f.cache.contains("layer-1").await);
        let record = f.state.get_layer("layer-1").unwrap().unwrap();
        assert_eq!(record.ref_count, 1);
        assert_eq!(record.checksum, layer.checksum);

        // a second disk shares the blob without another download
        f.remote.delete_layer("a", "layer-1").await.unwrap();
        f.cache.get_or_download("b", 0, &layer).await.unwrap();
        assert_eq!(f.state.get_layer("layer-1").unwrap().unwrap().ref_count, 2);
        assert!(f.state.audit_refcounts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_download_once() {
        let store = Arc::new(CountingStore::new(Duration::from_millis(100)));
        let f = fixture_with(RemoteStore::new(store.clone()));
        let layer = publish(&f, "a", "layer-1").await;
        let src = f.layout.root().join("layer-1.src");
        f.remote.upload_layer("b", "layer-1", &src).await.unwrap();

        let (a, b) = tokio::join!(
            f.cache.get_or_download("a", 0, &layer),
            f.cache.get_or_download("b", 0, &layer),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(store.gets(), 1);
        assert_eq!(f.state.get_layer("layer-1").unwrap().unwrap().ref_count, 2);
        assert_eq!(f.state.get_disk_layer_ids("a").unwrap(), vec!["layer-1"]);
        assert_eq!(f.state.get_disk_layer_ids("b").unwrap(), vec!["layer-1"]);
        assert!(f.state.audit_refcounts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_distinct_layers_do_not_block() {
        let f = fixture();
        let one = publish(&f, "a", "layer-1").await;
        let two = publish(&f, "a", "layer-2").await;

        let lock = f.cache.lock_for("layer-1");
        let guard = lock.lock().await;
        let held = tokio::time::timeout(
            Duration::from_millis(50),
            f.cache.get_or_download("a", 0, &one),
        )
        .await;
        assert!(held.is_err());
        let path = tokio::time::timeout(
            Duration::from_secs(5),
            f.cache.get_or_download("a", 1, &two),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(path.exists());
        drop(guard);

        f.cache.get_or_download("a", 0, &one).await.unwrap();
        assert_eq!(
            f.state.get_disk_layer_ids("a").unwrap(),
            vec!["layer-1", "layer-2"]
        );
        assert!(f.state.audit_refcounts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_discards_blob() {
        let f = fixture();
        let mut layer = publish(&f, "a", "layer-1").await;
        layer.checksum = "0".repeat(64);

        let err = f.cache.get_or_download("a", 0, &layer).await.unwrap_err();
        assert!(matches!(err.root(), DiskError::ChecksumMismatch { .. }));
        assert!(!f.cache.contains("layer-1").await);
        assert!(f.state.get_layer("layer-1").unwrap().is_none());
        assert!(f.state.get_disk_layer_ids("a").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrecorded_blob_is_adopted() {
        let f = fixture();
        let layer = publish(&f, "a", "layer-1").await;
        let src = f.layout.root().join("layer-1.src");
        std::fs::copy(&src, f.cache.layer_path("layer-1")).unwrap();
        f.remote.delete_layer("a", "layer-1").await.unwrap();

        f.cache.get_or_download("a", 0, &layer).await.unwrap();
        assert_eq!(f.state.get_layer("layer-1").unwrap().unwrap().ref_count, 1);
    }

    #[tokio::test]
    async fn test_register_local_blob() {
        let f = fixture();
        let path = f.cache.layer_path("layer-local");
        f.tool.create(&path, 1, &ImageConfig::default()).await.unwrap();

        let record = f.cache.register("a", 0, "layer-local").await.unwrap();
        assert_eq!(record.ref_count, 1);
        assert_eq!(record.checksum, f.tool.checksum(&path).await.unwrap());
        assert_eq!(f.state.get_disk_layer_ids("a").unwrap(), vec!["layer-local"]);
        assert!(f.cache.register("b", 0, "layer-local").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_remote_layer_is_not_found() {
        let f = fixture();
        let layer = ManifestLayer {
            id: "layer-x".into(),
            parent_id: None,
            created: Utc::now(),
            size: 0,
            checksum: String::new(),
            description: String::new(),
        };
        let err = f.cache.get_or_download("a", 0, &layer).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_unreferenced() {
        let f = fixture();
        let one = publish(&f, "a", "layer-1").await;
        let two = publish(&f, "a", "layer-2").await;
        f.cache.get_or_download("a", 0, &one).await.unwrap();
        f.cache.get_or_download("a", 1, &two).await.unwrap();
        f.cache.get_or_download("b", 0, &one).await.unwrap();

        assert_eq!(f.cache.cleanup_unused_layers().await.unwrap(), 0);

        f.state.detach_all_layers("a").unwrap();
        assert_eq!(f.cache.cleanup_unused_layers().await.unwrap(), 1);
        assert!(f.cache.contains("layer-1").await);
        assert!(!f.cache.contains("layer-2").await);
        assert!(f.state.get_layer("layer-2").unwrap().is_none());

        f.state.detach_all_layers("b").unwrap();
        assert_eq!(f.cache.cleanup_unused_layers().await.unwrap(), 1);
        assert!(f.state.list_layers().unwrap().is_empty());
    }
}
