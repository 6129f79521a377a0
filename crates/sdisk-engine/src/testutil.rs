//! Test harness: a manager over a temp directory, the fake image tool and
//! an in-memory remote

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};

use sdisk_common::{Config, PoolConfig, RemoteConfig, RemoteManifest};
use sdisk_image::FakeImageTool;
use sdisk_remote::RemoteStore;

use crate::manager::Manager;

pub(crate) struct Harness {
    pub dir: tempfile::TempDir,
    pub tool: Arc<FakeImageTool>,
    pub remote: Option<RemoteStore>,
    pub config: Config,
    pub manager: Manager,
}

pub(crate) struct HarnessBuilder {
    remote: Option<RemoteStore>,
    reuse_threshold_mb: u64,
    pool: Option<usize>,
}

impl HarnessBuilder {
    pub fn no_remote(mut self) -> Self {
        self.remote = None;
        self
    }

    pub fn remote(mut self, remote: RemoteStore) -> Self {
        self.remote = Some(remote);
        self
    }

    pub const fn reuse_threshold_mb(mut self, mb: u64) -> Self {
        self.reuse_threshold_mb = mb;
        self
    }

    pub const fn pool(mut self, capacity: usize) -> Self {
        self.pool = Some(capacity);
        self
    }

    pub async fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_data_dir(dir.path().join("data"));
        config.remote = self.remote.as_ref().map(|_| RemoteConfig {
            bucket: "test".into(),
            layer_reuse_threshold_mb: self.reuse_threshold_mb,
            ..RemoteConfig::default()
        });
        config.pool = PoolConfig {
            enabled: self.pool.is_some(),
            max_mounted: self.pool.unwrap_or(1),
        };
        let tool = Arc::new(FakeImageTool::new());
        let manager = Manager::new(config.clone(), tool.clone(), self.remote.clone())
            .await
            .unwrap();
        Harness {
            dir,
            tool,
            remote: self.remote,
            config,
            manager,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            remote: Some(RemoteStore::in_memory()),
            reuse_threshold_mb: 100,
            pool: None,
        }
    }

    pub async fn new() -> Self {
        Self::builder().build().await
    }

    /// Drop the manager and open a new one over the same directory
    pub async fn reopen(self) -> Self {
        let Self {
            dir,
            tool,
            remote,
            config,
            manager,
        } = self;
        drop(manager);
        let manager = Manager::new(config.clone(), tool.clone(), remote.clone())
            .await
            .unwrap();
        Self {
            dir,
            tool,
            remote,
            config,
            manager,
        }
    }

    pub fn remote(&self) -> RemoteStore {
        self.remote.clone().unwrap()
    }

    pub fn working(&self, name: &str) -> PathBuf {
        self.manager.layout().working_image(name)
    }

    /// Write `count` tagged clusters into the working image of `name`
    pub fn write(&self, name: &str, start: u64, count: u64, tag: &str) {
        self.tool
            .write_clusters(&self.working(name), start, count, tag)
            .unwrap();
    }

    pub async fn manifest(&self, name: &str) -> RemoteManifest {
        self.remote().download_metadata(name).await.unwrap()
    }
}

/// In-memory object store that counts object reads and can slow them down,
/// so concurrent downloads overlap
#[derive(Debug)]
pub(crate) struct CountingStore {
    inner: InMemory,
    delay: Duration,
    gets: AtomicUsize,
}

impl CountingStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemory::new(),
            delay,
            gets: AtomicUsize::new(0),
        }
    }

    /// Number of object reads, not counting metadata lookups
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

impl std::fmt::Display for CountingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Counting({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn put_opts(
        &self,
        location: &ObjectPath,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &ObjectPath,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &ObjectPath,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        if !options.head {
            self.gets.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
        }
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &ObjectPath) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&ObjectPath>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&ObjectPath>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &ObjectPath, to: &ObjectPath) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(
        &self,
        from: &ObjectPath,
        to: &ObjectPath,
    ) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}
