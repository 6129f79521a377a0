//! State shared by the manager, its disks and the mount pool

use std::io;
use std::path::Path;
use std::sync::Arc;

use sdisk_common::{Config, DiskError, DiskResult, Layout, RemoteConfig};
use sdisk_image::ImageTool;
use sdisk_remote::RemoteStore;
use sdisk_state::StateStore;

use crate::cache::LayerCache;

pub(crate) struct Shared {
    pub layout: Layout,
    pub config: Config,
    pub tool: Arc<dyn ImageTool>,
    pub state: Arc<StateStore>,
    pub remote: Option<RemoteStore>,
    pub cache: LayerCache,
}

impl Shared {
    pub fn remote(&self) -> DiskResult<&RemoteStore> {
        self.remote.as_ref().ok_or(DiskError::RemoteNotConfigured)
    }

    fn remote_config(&self) -> RemoteConfig {
        self.config.remote.clone().unwrap_or_default()
    }

    /// Layers below this size keep absorbing writes across pushes
    pub fn reuse_threshold(&self) -> u64 {
        self.remote_config().layer_reuse_threshold()
    }

    /// Working images below this size hold no data worth a layer
    pub fn empty_layer_max(&self) -> u64 {
        self.remote_config().empty_layer_max()
    }
}

/// Chain position for the layer at `index`
pub(crate) fn position(index: usize) -> DiskResult<u32> {
    u32::try_from(index)
        .map_err(|_| DiskError::ResourceExhausted(format!("layer position {index} out of range")))
}

pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub(crate) async fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
