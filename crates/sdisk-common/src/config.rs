//! Configuration types for sdisk
//!
//! All sections have defaults so a minimal TOML file only needs `data_dir`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DiskError, DiskResult};

/// Root configuration for a disk manager
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for images, layer cache, mounts and state
    pub data_dir: PathBuf,
    /// Remote object store; push/pull are unavailable when absent
    pub remote: Option<RemoteConfig>,
    /// Defaults for newly created images
    pub image: ImageConfig,
    /// Mount pool settings
    pub pool: PoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/sdisk"),
            remote: None,
            image: ImageConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl Config {
    /// Configuration rooted at `data_dir` with defaults everywhere else
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load and validate a TOML configuration file
    pub fn from_toml_file(path: impl AsRef<Path>) -> DiskResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| e.context(format!("load config {}", path.display())))
    }

    /// Parse and validate a TOML configuration document
    pub fn from_toml_str(text: &str) -> DiskResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| DiskError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> DiskResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(DiskError::config("data_dir must not be empty"));
        }
        if let Some(remote) = &self.remote {
            remote.validate()?;
        }
        self.image.validate()?;
        if self.pool.enabled && self.pool.max_mounted == 0 {
            return Err(DiskError::config(
                "pool.max_mounted must be at least 1 when pooling is enabled",
            ));
        }
        Ok(())
    }
}

/// S3-compatible remote store settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Bucket holding the `disks/` prefix
    pub bucket: String,
    /// Region name (e.g., "us-east-1")
    pub region: String,
    /// Custom endpoint for S3-compatible stores
    pub endpoint: Option<String>,
    /// Static access key; environment credentials are used when absent
    pub access_key_id: Option<String>,
    /// Static secret key
    pub secret_access_key: Option<String>,
    /// Use path-style addressing instead of virtual-hosted buckets
    pub path_style: bool,
    /// Layers smaller than this keep absorbing writes across pushes
    pub layer_reuse_threshold_mb: u64,
    /// Working layers smaller than this are treated as empty on push
    pub empty_layer_max_kb: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            path_style: false,
            layer_reuse_threshold_mb: 100,
            empty_layer_max_kb: 600,
        }
    }
}

impl RemoteConfig {
    /// Reuse threshold in bytes
    #[must_use]
    pub const fn layer_reuse_threshold(&self) -> u64 {
        self.layer_reuse_threshold_mb * 1024 * 1024
    }

    /// Empty-layer threshold in bytes
    #[must_use]
    pub const fn empty_layer_max(&self) -> u64 {
        self.empty_layer_max_kb * 1024
    }

    fn validate(&self) -> DiskResult<()> {
        if self.bucket.is_empty() {
            return Err(DiskError::config("remote.bucket must not be empty"));
        }
        if self.region.is_empty() {
            return Err(DiskError::config("remote.region must not be empty"));
        }
        if self.layer_reuse_threshold_mb == 0 {
            return Err(DiskError::config(
                "remote.layer_reuse_threshold_mb must be positive",
            ));
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(DiskError::config(
                "remote.access_key_id and remote.secret_access_key must be set together",
            ));
        }
        Ok(())
    }
}

/// QCOW2 compression algorithm for compressed clusters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Leave the image format default
    None,
    Zlib,
    #[default]
    Zstd,
}

impl Compression {
    /// Value for the `compression_type` image option
    #[must_use]
    pub const fn as_option(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Zlib => Some("zlib"),
            Self::Zstd => Some("zstd"),
        }
    }
}

/// QCOW2 preallocation mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preallocation {
    #[default]
    Off,
    Metadata,
    Falloc,
    Full,
}

impl Preallocation {
    /// Value for the `preallocation` image option
    #[must_use]
    pub const fn as_option(self) -> Option<&'static str> {
        match self {
            Self::Off => None,
            Self::Metadata => Some("metadata"),
            Self::Falloc => Some("falloc"),
            Self::Full => Some("full"),
        }
    }
}

/// Image creation defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub compression: Compression,
    /// Cluster size in bytes
    pub cluster_size: u64,
    pub lazy_refcounts: bool,
    pub preallocation: Preallocation,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            cluster_size: 64 * 1024,
            lazy_refcounts: true,
            preallocation: Preallocation::default(),
        }
    }
}

impl ImageConfig {
    /// Comma-separated `-o` option string for `qemu-img create`
    #[must_use]
    pub fn create_options(&self) -> String {
        let mut opts = vec![format!("cluster_size={}", self.cluster_size)];
        if let Some(c) = self.compression.as_option() {
            opts.push(format!("compression_type={c}"));
        }
        if self.lazy_refcounts {
            opts.push("lazy_refcounts=on".to_string());
        }
        if let Some(p) = self.preallocation.as_option() {
            opts.push(format!("preallocation={p}"));
        }
        opts.join(",")
    }

    fn validate(&self) -> DiskResult<()> {
        if !self.cluster_size.is_power_of_two()
            || !(512..=2 * 1024 * 1024).contains(&self.cluster_size)
        {
            return Err(DiskError::config(format!(
                "image.cluster_size must be a power of two between 512 and 2M, got {}",
                self.cluster_size
            )));
        }
        Ok(())
    }
}

/// Mount pool settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Route mounts through the LRU pool
    pub enabled: bool,
    /// Maximum number of concurrently mounted disks
    pub max_mounted: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_mounted: 100,
        }
    }
}
