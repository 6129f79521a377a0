//! On-disk directory layout under the configured data directory

use std::path::{Path, PathBuf};

/// Paths for every file the engine owns
#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding working images
    #[must_use]
    pub fn disks_dir(&self) -> PathBuf {
        self.root.join("disks")
    }

    /// Directory holding shared layer blobs
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("layer-cache")
    }

    /// Parent of every per-disk chain directory
    #[must_use]
    pub fn layers_dir(&self) -> PathBuf {
        self.root.join("layers")
    }

    /// Parent of every mount point
    #[must_use]
    pub fn mounts_dir(&self) -> PathBuf {
        self.root.join("mounts")
    }

    #[must_use]
    pub fn state_db(&self) -> PathBuf {
        self.root.join("state.redb")
    }

    /// `disks/<name>.qcow2`
    #[must_use]
    pub fn working_image(&self, name: &str) -> PathBuf {
        self.disks_dir().join(format!("{name}.qcow2"))
    }

    /// `layer-cache/<id>.qcow2`
    #[must_use]
    pub fn cache_blob(&self, layer_id: &str) -> PathBuf {
        self.cache_dir().join(format!("{layer_id}.qcow2"))
    }

    /// `layers/<name>/`
    #[must_use]
    pub fn chain_dir(&self, name: &str) -> PathBuf {
        self.layers_dir().join(name)
    }

    /// `mounts/<name>/`
    #[must_use]
    pub fn mount_dir(&self, name: &str) -> PathBuf {
        self.mounts_dir().join(name)
    }

    /// Create the top-level directories
    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.disks_dir(),
            self.cache_dir(),
            self.layers_dir(),
            self.mounts_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Sibling path used while a file is being produced, renamed into place when complete
#[must_use]
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}
