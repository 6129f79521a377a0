//! The image tool boundary

use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use sdisk_common::graph::MAX_CHAIN_DEPTH;
use sdisk_common::{DiskError, DiskResult, ImageConfig};

use crate::chain::walk_backing_chain;

/// Image description as printed by `qemu-img info --output=json`
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageInfo {
    pub filename: String,
    pub format: String,
    pub virtual_size: u64,
    #[serde(default)]
    pub actual_size: u64,
    #[serde(default)]
    pub cluster_size: Option<u64>,
    #[serde(default)]
    pub dirty_flag: bool,
    #[serde(default)]
    pub backing_filename: Option<String>,
    #[serde(default)]
    pub full_backing_filename: Option<String>,
    #[serde(default)]
    pub format_specific: Option<FormatSpecific>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FormatSpecific {
    #[serde(default)]
    pub data: FormatData,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FormatData {
    #[serde(default)]
    pub compression_type: Option<String>,
    #[serde(default)]
    pub lazy_refcounts: Option<bool>,
}

impl ImageInfo {
    /// Parse `qemu-img info --output=json` output
    pub fn from_json(json: &str) -> DiskResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Compression type reported for qcow2 images
    #[must_use]
    pub fn compression_type(&self) -> Option<&str> {
        self.format_specific
            .as_ref()
            .and_then(|f| f.data.compression_type.as_deref())
    }

    /// Backing file of `image`, with relative references resolved against
    /// the image's directory
    #[must_use]
    pub fn backing_path(&self, image: &Path) -> Option<PathBuf> {
        if let Some(full) = self.full_backing_filename.as_deref().filter(|s| !s.is_empty()) {
            return Some(PathBuf::from(full));
        }
        let raw = self.backing_filename.as_deref().filter(|s| !s.is_empty())?;
        let raw = Path::new(raw);
        if raw.is_absolute() {
            Some(raw.to_path_buf())
        } else {
            Some(image.parent().unwrap_or_else(|| Path::new(".")).join(raw))
        }
    }
}

/// Operations on QCOW2 images, NBD devices and mounts.
///
/// Device and mount bookkeeping is keyed by disk name; implementations keep
/// it in memory only.
#[async_trait]
pub trait ImageTool: Send + Sync {
    /// Create a standalone image of `size_gb`
    async fn create(&self, path: &Path, size_gb: u64, opts: &ImageConfig) -> DiskResult<()>;

    /// Create an empty overlay on `backing`; `size_gb == 0` inherits the backing size
    async fn create_with_backing(&self, backing: &Path, path: &Path, size_gb: u64)
    -> DiskResult<()>;

    async fn info(&self, path: &Path) -> DiskResult<ImageInfo>;

    /// Grow the virtual size
    async fn resize(&self, path: &Path, size_gb: u64) -> DiskResult<()>;

    /// Flatten `src` and its backing chain into a standalone image at `dst`
    async fn convert(&self, src: &Path, dst: &Path) -> DiskResult<()>;

    /// Re-point `path` at `backing`, preserving guest-visible content
    async fn rebase(&self, path: &Path, backing: &Path) -> DiskResult<()>;

    /// Rewrite the backing reference only; `None` clears it
    async fn rebase_unsafe(&self, path: &Path, backing: Option<&Path>) -> DiskResult<()>;

    /// Merge `path` into its backing file
    async fn commit(&self, path: &Path) -> DiskResult<()>;

    /// Attach `path` to a free NBD device and return the device path
    async fn connect(&self, name: &str, path: &Path) -> DiskResult<String>;

    /// Detach the device attached for `name`; no-op when none is
    async fn disconnect(&self, name: &str) -> DiskResult<()>;

    /// Mount `device` at `mount_path`, formatting it first if it has no filesystem
    async fn mount(&self, name: &str, device: &str, mount_path: &Path) -> DiskResult<()>;

    /// Unmount the filesystem mounted for `name`; no-op when none is
    async fn unmount(&self, name: &str) -> DiskResult<()>;

    /// Flush a mounted filesystem and its device
    async fn sync(&self, name: &str) -> DiskResult<()>;

    async fn mount_path(&self, name: &str) -> Option<PathBuf>;

    async fn is_mounted(&self, name: &str) -> bool {
        self.mount_path(name).await.is_some()
    }

    /// Unmount and disconnect everything this tool attached
    async fn close(&self) -> DiskResult<()>;

    /// SHA-256 of the image file, hex encoded
    async fn checksum(&self, path: &Path) -> DiskResult<String> {
        checksum_file(path).await
    }

    async fn actual_size(&self, path: &Path) -> DiskResult<u64> {
        Ok(self.info(path).await?.actual_size)
    }

    async fn virtual_size(&self, path: &Path) -> DiskResult<u64> {
        Ok(self.info(path).await?.virtual_size)
    }

    async fn backing_file(&self, path: &Path) -> DiskResult<Option<PathBuf>> {
        Ok(self.info(path).await?.backing_path(path))
    }

    /// Walk the backing chain and return it from `path` down to the base
    async fn validate_backing_chain(&self, path: &Path) -> DiskResult<Vec<PathBuf>> {
        walk_backing_chain(self, path, MAX_CHAIN_DEPTH).await
    }
}

/// SHA-256 of a file, hex encoded. Hashing runs on the blocking pool.
pub async fn checksum_file(path: &Path) -> DiskResult<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> DiskResult<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| DiskError::Io(std::io::Error::other(e)))?
}
