//! Remote store over any [`ObjectStore`] backend

use std::io::{self, BufWriter};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use tokio::io::AsyncReadExt;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info, warn};

use sdisk_common::layout::partial_path;
use sdisk_common::{DiskError, DiskResult, RemoteConfig, RemoteManifest};

use crate::archive;

const DISKS_PREFIX: &str = "disks";

/// Part size of multipart uploads; S3 requires at least 5 MiB per part
const UPLOAD_PART: usize = 8 * 1024 * 1024;

/// Parts in flight per upload
const UPLOAD_CONCURRENCY: usize = 4;

/// Blocking reader over the body of a remote object
type ObjectReader = SyncIoBridge<StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>>;

fn metadata_key(name: &str) -> String {
    format!("{DISKS_PREFIX}/{name}/metadata.json")
}

fn layer_key(name: &str, layer_id: &str) -> String {
    format!("{DISKS_PREFIX}/{name}/layers/{layer_id}.tar.gz")
}

fn disk_key(name: &str) -> String {
    format!("{DISKS_PREFIX}/{name}/disk.qcow2")
}

fn remote_err(e: object_store::Error) -> DiskError {
    match e {
        object_store::Error::NotFound { path, .. } => DiskError::RemoteNotFound(path),
        other => DiskError::Remote(Box::new(other)),
    }
}

fn join_err(e: tokio::task::JoinError) -> DiskError {
    DiskError::Io(std::io::Error::other(e))
}

/// Stateless adapter mapping disks and layers onto object keys
#[derive(Clone)]
pub struct RemoteStore {
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("store", &self.store.to_string())
            .finish()
    }
}

impl RemoteStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// In-process store, used by tests and local development
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Build an S3 client from configuration. Credentials not given in the
    /// configuration are taken from the environment.
    pub fn from_config(config: &RemoteConfig) -> DiskResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_virtual_hosted_style_request(!config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            builder = builder
                .with_access_key_id(key)
                .with_secret_access_key(secret);
        }
        let s3 = builder
            .build()
            .map_err(|e| DiskError::config(format!("remote store: {e}")))?;
        info!("remote store: s3://{}", config.bucket);
        Ok(Self::new(Arc::new(s3)))
    }

    // ── Layers ────────────────────────────────────────────────────────────────

    /// Archive and upload a layer image. Returns the archive size.
    ///
    /// The archive is staged in a temporary file next to `src` and uploaded
    /// in parts from there.
    pub async fn upload_layer(&self, name: &str, layer_id: &str, src: &Path) -> DiskResult<u64> {
        let src = src.to_path_buf();
        let entry = format!("{layer_id}.qcow2");
        let staged = tokio::task::spawn_blocking(move || -> DiskResult<tempfile::TempPath> {
            let dir = src.parent().unwrap_or_else(|| Path::new("."));
            let (file, path) = tempfile::Builder::new()
                .prefix(".upload-")
                .suffix(".tar.gz")
                .tempfile_in(dir)?
                .into_parts();
            archive::pack(&src, &entry, BufWriter::new(file))?;
            Ok(path)
        })
        .await
        .map_err(join_err)??;
        let len = self.put_file(&layer_key(name, layer_id), &staged).await?;
        debug!("uploaded layer {layer_id} of {name} ({len} bytes)");
        Ok(len)
    }

    /// Download and extract a layer image to `dest`. Returns the image size.
    pub async fn download_layer(&self, name: &str, layer_id: &str, dest: &Path) -> DiskResult<u64> {
        let reader = self.get_reader(&layer_key(name, layer_id)).await?;
        let dest = dest.to_path_buf();
        let len = tokio::task::spawn_blocking(move || archive::unpack(reader, &dest))
            .await
            .map_err(join_err)??;
        debug!("downloaded layer {layer_id} of {name} ({len} bytes)");
        Ok(len)
    }

    pub async fn delete_layer(&self, name: &str, layer_id: &str) -> DiskResult<()> {
        self.delete(&layer_key(name, layer_id)).await
    }

    pub async fn layer_exists(&self, name: &str, layer_id: &str) -> DiskResult<bool> {
        self.exists(&layer_key(name, layer_id)).await
    }

    // ── Manifests ─────────────────────────────────────────────────────────────

    pub async fn upload_metadata(&self, name: &str, manifest: &RemoteManifest) -> DiskResult<()> {
        self.put(&metadata_key(name), Bytes::from(manifest.to_json()?))
            .await
    }

    pub async fn download_metadata(&self, name: &str) -> DiskResult<RemoteManifest> {
        let body = self.get(&metadata_key(name)).await?;
        RemoteManifest::from_json(&body)
    }

    /// Like [`Self::download_metadata`], but a missing manifest is `None`
    pub async fn try_download_metadata(&self, name: &str) -> DiskResult<Option<RemoteManifest>> {
        match self.download_metadata(name).await {
            Ok(m) => Ok(Some(m)),
            Err(DiskError::RemoteNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn metadata_exists(&self, name: &str) -> DiskResult<bool> {
        self.exists(&metadata_key(name)).await
    }

    // ── Legacy unlayered images ───────────────────────────────────────────────

    pub async fn upload_disk(&self, name: &str, src: &Path) -> DiskResult<()> {
        let len = self.put_file(&disk_key(name), src).await?;
        debug!("uploaded image of {name} ({len} bytes)");
        Ok(())
    }

    pub async fn download_disk(&self, name: &str, dest: &Path) -> DiskResult<u64> {
        let mut reader = self.get_reader(&disk_key(name)).await?;
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> DiskResult<u64> {
            let part = partial_path(&dest);
            let len = match archive::write_sparse(&mut reader, &part) {
                Ok(len) => len,
                Err(e) => {
                    let _ = std::fs::remove_file(&part);
                    return Err(e.into());
                }
            };
            std::fs::rename(&part, &dest)?;
            Ok(len)
        })
        .await
        .map_err(join_err)?
    }

    // ── Keys ──────────────────────────────────────────────────────────────────

    pub async fn exists(&self, key: &str) -> DiskResult<bool> {
        match self.store.head(&ObjectPath::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(remote_err(e)),
        }
    }

    pub async fn delete(&self, key: &str) -> DiskResult<()> {
        self.store
            .delete(&ObjectPath::from(key))
            .await
            .map_err(remote_err)
    }

    /// Keys under `prefix`, sorted
    pub async fn list(&self, prefix: &str) -> DiskResult<Vec<String>> {
        let prefix = ObjectPath::from(prefix);
        let mut keys: Vec<String> = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .map_err(remote_err)?;
        keys.sort();
        Ok(keys)
    }

    /// Remove every object of a disk. Returns the number removed.
    pub async fn delete_disk(&self, name: &str) -> DiskResult<usize> {
        let keys = self.list(&format!("{DISKS_PREFIX}/{name}")).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        info!("deleted {} remote object(s) of {name}", keys.len());
        Ok(keys.len())
    }

    /// Names of disks with any object under `disks/`, sorted
    pub async fn list_disks(&self) -> DiskResult<Vec<String>> {
        let listing = self
            .store
            .list_with_delimiter(Some(&ObjectPath::from(DISKS_PREFIX)))
            .await
            .map_err(remote_err)?;
        let mut names: Vec<String> = listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.filename().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn put(&self, key: &str, body: Bytes) -> DiskResult<()> {
        self.store
            .put(&ObjectPath::from(key), PutPayload::from(body))
            .await
            .map_err(remote_err)?;
        Ok(())
    }

    /// Upload the file at `path` in parts. An interrupted upload is aborted
    /// so no partial object becomes visible. Returns the bytes sent.
    async fn put_file(&self, key: &str, path: &Path) -> DiskResult<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        let upload = self
            .store
            .put_multipart(&ObjectPath::from(key))
            .await
            .map_err(remote_err)?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, UPLOAD_PART);
        let mut buf = vec![0u8; UPLOAD_PART];
        let sent = async {
            let mut total = 0u64;
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<u64, DiskError>(total);
                }
                writer
                    .wait_for_capacity(UPLOAD_CONCURRENCY)
                    .await
                    .map_err(remote_err)?;
                writer.write(&buf[..n]);
                total += n as u64;
            }
        }
        .await;
        match sent {
            Ok(total) => {
                writer.finish().await.map_err(remote_err)?;
                Ok(total)
            }
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    warn!("failed to abort upload of {key}: {abort}");
                }
                Err(e)
            }
        }
    }

    /// Stream the body of `key` into a reader for blocking consumers. Must be
    /// called from within the runtime.
    async fn get_reader(&self, key: &str) -> DiskResult<ObjectReader> {
        let body = self
            .store
            .get(&ObjectPath::from(key))
            .await
            .map_err(remote_err)?
            .into_stream()
            .map_err(io::Error::other)
            .boxed();
        Ok(SyncIoBridge::new(StreamReader::new(body)))
    }

    async fn get(&self, key: &str) -> DiskResult<Bytes> {
        self.store
            .get(&ObjectPath::from(key))
            .await
            .map_err(remote_err)?
            .bytes()
            .await
            .map_err(remote_err)
    }
}
