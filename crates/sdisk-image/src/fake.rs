//! File-backed image tool for tests
//!
//! Images are small JSON documents holding a backing reference and a map of
//! written clusters, so chain manipulation, flattening and checksums behave
//! like the real thing without qemu, root or an nbd module. Devices and
//! mounts are simulated in memory; mount points are real directories.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sdisk_common::graph::MAX_CHAIN_DEPTH;
use sdisk_common::{DiskError, DiskResult, GIB, ImageConfig};

use crate::tool::{FormatData, FormatSpecific, ImageInfo, ImageTool};

/// Size of an image with no data clusters
pub const FAKE_HEADER_SIZE: u64 = 196_608;
/// Bytes accounted per written cluster
pub const FAKE_CLUSTER_SIZE: u64 = 65_536;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct FakeImage {
    virtual_size: u64,
    backing: Option<PathBuf>,
    clusters: BTreeMap<u64, String>,
}

#[derive(Debug, Default)]
struct FakeState {
    devices: HashMap<String, String>,
    mounts: HashMap<String, PathBuf>,
    next_device: usize,
    max_devices: Option<usize>,
    busy_unmounts: u32,
    failures: HashSet<&'static str>,
    mount_calls: u32,
}

/// In-process stand-in for [`crate::QemuImageTool`]
#[derive(Debug, Default)]
pub struct FakeImageTool {
    state: Mutex<FakeState>,
}

fn read_image(path: &Path) -> DiskResult<FakeImage> {
    let bytes = std::fs::read(path).map_err(|e| DiskError::ExternalTool {
        command: format!("qemu-img info {}", path.display()),
        status: "exit status: 1".into(),
        output: e.to_string(),
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_image(path: &Path, image: &FakeImage) -> DiskResult<()> {
    std::fs::write(path, serde_json::to_vec(image)?)?;
    Ok(())
}

fn resolve_backing(image: &Path, backing: &Path) -> PathBuf {
    if backing.is_absolute() {
        backing.to_path_buf()
    } else {
        image.parent().unwrap_or_else(|| Path::new(".")).join(backing)
    }
}

impl FakeImageTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of simultaneously connected devices
    pub fn set_max_devices(&self, max: usize) {
        self.state.lock().max_devices = Some(max);
    }

    /// Make the next `n` unmount calls fail with a busy target
    pub fn set_busy_unmounts(&self, n: u32) {
        self.state.lock().busy_unmounts = n;
    }

    /// Make the next call of `op` fail with an external tool error
    pub fn fail_next(&self, op: &'static str) {
        self.state.lock().failures.insert(op);
    }

    /// Number of mount calls that succeeded
    pub fn mount_calls(&self) -> u32 {
        self.state.lock().mount_calls
    }

    /// Names with a simulated mount
    pub fn mounted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().mounts.keys().cloned().collect();
        names.sort();
        names
    }

    /// Write cluster `index` of the image at `path` directly
    pub fn write_cluster(&self, path: &Path, index: u64, data: &str) -> DiskResult<()> {
        let mut image = read_image(path)?;
        image.clusters.insert(index, data.to_string());
        write_image(path, &image)
    }

    /// Write `count` clusters starting at `start`, each tagged with `tag`
    pub fn write_clusters(&self, path: &Path, start: u64, count: u64, tag: &str) -> DiskResult<()> {
        let mut image = read_image(path)?;
        for i in start..start + count {
            image.clusters.insert(i, format!("{tag}-{i}"));
        }
        write_image(path, &image)
    }

    /// Guest-visible content: every cluster resolved through the chain
    pub fn read_all(&self, path: &Path) -> DiskResult<BTreeMap<u64, String>> {
        let mut chain = vec![read_image(path)?];
        let mut current = path.to_path_buf();
        while let Some(backing) = chain.last().and_then(|img| img.backing.clone()) {
            if chain.len() > MAX_CHAIN_DEPTH {
                return Err(DiskError::integrity("fake chain too deep"));
            }
            current = resolve_backing(&current, &backing);
            chain.push(read_image(&current)?);
        }
        let mut view = BTreeMap::new();
        for image in chain.into_iter().rev() {
            view.extend(image.clusters);
        }
        Ok(view)
    }

    fn take_failure(&self, op: &'static str) -> DiskResult<()> {
        if self.state.lock().failures.remove(op) {
            return Err(DiskError::ExternalTool {
                command: format!("fake {op}"),
                status: "exit status: 1".into(),
                output: format!("injected {op} failure"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ImageTool for FakeImageTool {
    async fn create(&self, path: &Path, size_gb: u64, _opts: &ImageConfig) -> DiskResult<()> {
        self.take_failure("create")?;
        write_image(
            path,
            &FakeImage {
                virtual_size: size_gb * GIB,
                ..FakeImage::default()
            },
        )
    }

    async fn create_with_backing(
        &self,
        backing: &Path,
        path: &Path,
        size_gb: u64,
    ) -> DiskResult<()> {
        self.take_failure("create_with_backing")?;
        let base = read_image(backing)?;
        let virtual_size = if size_gb > 0 {
            size_gb * GIB
        } else {
            base.virtual_size
        };
        write_image(
            path,
            &FakeImage {
                virtual_size,
                backing: Some(backing.to_path_buf()),
                clusters: BTreeMap::new(),
            },
        )
    }

    async fn info(&self, path: &Path) -> DiskResult<ImageInfo> {
        let image = read_image(path)?;
        let backing = image.backing.as_ref().map(|b| b.display().to_string());
        Ok(ImageInfo {
            filename: path.display().to_string(),
            format: "qcow2".into(),
            virtual_size: image.virtual_size,
            actual_size: FAKE_HEADER_SIZE + FAKE_CLUSTER_SIZE * image.clusters.len() as u64,
            cluster_size: Some(FAKE_CLUSTER_SIZE),
            dirty_flag: false,
            backing_filename: backing,
            full_backing_filename: image
                .backing
                .as_ref()
                .map(|b| resolve_backing(path, b).display().to_string()),
            format_specific: Some(FormatSpecific {
                data: FormatData {
                    compression_type: Some("zstd".into()),
                    lazy_refcounts: Some(true),
                },
            }),
        })
    }

    async fn resize(&self, path: &Path, size_gb: u64) -> DiskResult<()> {
        self.take_failure("resize")?;
        let mut image = read_image(path)?;
        if size_gb * GIB < image.virtual_size {
            return Err(DiskError::ExternalTool {
                command: format!("qemu-img resize {}", path.display()),
                status: "exit status: 1".into(),
                output: "Use the --shrink option to perform a shrink operation.".into(),
            });
        }
        image.virtual_size = size_gb * GIB;
        write_image(path, &image)
    }

    async fn convert(&self, src: &Path, dst: &Path) -> DiskResult<()> {
        self.take_failure("convert")?;
        self.validate_backing_chain(src).await?;
        let top = read_image(src)?;
        let flat = FakeImage {
            virtual_size: top.virtual_size,
            backing: None,
            clusters: self.read_all(src)?,
        };
        write_image(dst, &flat)
    }

    async fn rebase(&self, path: &Path, backing: &Path) -> DiskResult<()> {
        self.take_failure("rebase")?;
        let current = self.read_all(path)?;
        let below = self.read_all(backing)?;
        let mut image = read_image(path)?;
        image.clusters = current
            .into_iter()
            .filter(|(idx, data)| below.get(idx) != Some(data))
            .collect();
        image.backing = Some(backing.to_path_buf());
        write_image(path, &image)
    }

    async fn rebase_unsafe(&self, path: &Path, backing: Option<&Path>) -> DiskResult<()> {
        self.take_failure("rebase_unsafe")?;
        let mut image = read_image(path)?;
        image.backing = backing.map(Path::to_path_buf);
        write_image(path, &image)
    }

    async fn commit(&self, path: &Path) -> DiskResult<()> {
        self.take_failure("commit")?;
        let mut image = read_image(path)?;
        let backing = image
            .backing
            .as_ref()
            .map(|b| resolve_backing(path, b))
            .ok_or_else(|| DiskError::invalid_state(format!("{} has no backing file", path.display())))?;
        let mut base = read_image(&backing)?;
        base.clusters.append(&mut image.clusters);
        write_image(&backing, &base)?;
        write_image(path, &image)
    }

    async fn connect(&self, name: &str, path: &Path) -> DiskResult<String> {
        self.take_failure("connect")?;
        read_image(path)?;
        let mut state = self.state.lock();
        if let Some(dev) = state.devices.get(name) {
            return Ok(dev.clone());
        }
        if state.max_devices.is_some_and(|max| state.devices.len() >= max) {
            return Err(DiskError::ResourceExhausted("no free nbd device".into()));
        }
        let dev = format!("/dev/nbd{}", state.next_device);
        state.next_device += 1;
        state.devices.insert(name.to_string(), dev.clone());
        Ok(dev)
    }

    async fn disconnect(&self, name: &str) -> DiskResult<()> {
        self.take_failure("disconnect")?;
        self.state.lock().devices.remove(name);
        Ok(())
    }

    async fn mount(&self, name: &str, device: &str, mount_path: &Path) -> DiskResult<()> {
        self.take_failure("mount")?;
        {
            let state = self.state.lock();
            if state.mounts.contains_key(name) {
                return Err(DiskError::AlreadyMounted(name.to_string()));
            }
            if state.devices.get(name).map(String::as_str) != Some(device) {
                return Err(DiskError::invalid_state(format!(
                    "{device} is not connected for {name}"
                )));
            }
        }
        std::fs::create_dir_all(mount_path)?;
        let mut state = self.state.lock();
        state.mounts.insert(name.to_string(), mount_path.to_path_buf());
        state.mount_calls += 1;
        Ok(())
    }

    async fn unmount(&self, name: &str) -> DiskResult<()> {
        let mut state = self.state.lock();
        let Some(path) = state.mounts.get(name).cloned() else {
            return Ok(());
        };
        if state.busy_unmounts > 0 {
            state.busy_unmounts -= 1;
            return Err(DiskError::Busy(format!(
                "umount: {}: target is busy.",
                path.display()
            )));
        }
        state.mounts.remove(name);
        Ok(())
    }

    async fn sync(&self, name: &str) -> DiskResult<()> {
        if self.state.lock().mounts.contains_key(name) {
            Ok(())
        } else {
            Err(DiskError::invalid_state(format!("{name} is not mounted")))
        }
    }

    async fn mount_path(&self, name: &str) -> Option<PathBuf> {
        self.state.lock().mounts.get(name).cloned()
    }

    async fn close(&self) -> DiskResult<()> {
        let mut state = self.state.lock();
        state.mounts.clear();
        state.devices.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overlay_reads_through_backing() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeImageTool::new();
        let base = dir.path().join("base.qcow2");
        let top = dir.path().join("top.qcow2");
        tool.create(&base, 2, &ImageConfig::default()).await.unwrap();
        tool.write_cluster(&base, 0, "base").unwrap();
        tool.create_with_backing(&base, &top, 0).await.unwrap();
        tool.write_cluster(&top, 1, "top").unwrap();

        let view = tool.read_all(&top).unwrap();
        assert_eq!(view.get(&0).map(String::as_str), Some("base"));
        assert_eq!(view.get(&1).map(String::as_str), Some("top"));
        assert_eq!(tool.virtual_size(&top).await.unwrap(), 2 * GIB);
        assert_eq!(
            tool.actual_size(&top).await.unwrap(),
            FAKE_HEADER_SIZE + FAKE_CLUSTER_SIZE
        );
    }

    #[tokio::test]
    async fn test_convert_flattens() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeImageTool::new();
        let base = dir.path().join("base.qcow2");
        let top = dir.path().join("top.qcow2");
        let flat = dir.path().join("flat.qcow2");
        tool.create(&base, 1, &ImageConfig::default()).await.unwrap();
        tool.write_clusters(&base, 0, 3, "b").unwrap();
        tool.create_with_backing(&base, &top, 0).await.unwrap();
        tool.write_cluster(&top, 1, "t").unwrap();
        tool.convert(&top, &flat).await.unwrap();

        assert_eq!(tool.backing_file(&flat).await.unwrap(), None);
        assert_eq!(tool.read_all(&flat).unwrap(), tool.read_all(&top).unwrap());
    }

    #[tokio::test]
    async fn test_safe_rebase_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeImageTool::new();
        let a = dir.path().join("a.qcow2");
        let b = dir.path().join("b.qcow2");
        let top = dir.path().join("top.qcow2");
        tool.create(&a, 1, &ImageConfig::default()).await.unwrap();
        tool.write_cluster(&a, 0, "a").unwrap();
        tool.create(&b, 1, &ImageConfig::default()).await.unwrap();
        tool.create_with_backing(&a, &top, 0).await.unwrap();

        let before = tool.read_all(&top).unwrap();
        tool.rebase(&top, &b).await.unwrap();
        assert_eq!(tool.read_all(&top).unwrap(), before);
        assert_eq!(tool.backing_file(&top).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_commit_merges_into_backing() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeImageTool::new();
        let base = dir.path().join("base.qcow2");
        let top = dir.path().join("top.qcow2");
        tool.create(&base, 1, &ImageConfig::default()).await.unwrap();
        tool.create_with_backing(&base, &top, 0).await.unwrap();
        tool.write_cluster(&top, 4, "x").unwrap();
        tool.commit(&top).await.unwrap();
        assert_eq!(tool.read_all(&base).unwrap().get(&4).map(String::as_str), Some("x"));
    }

    #[tokio::test]
    async fn test_double_mount_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeImageTool::new();
        let image = dir.path().join("vol.qcow2");
        tool.create(&image, 1, &ImageConfig::default()).await.unwrap();
        let dev = tool.connect("vol", &image).await.unwrap();
        assert_eq!(tool.connect("vol", &image).await.unwrap(), dev);

        let mnt = dir.path().join("mnt");
        tool.mount("vol", &dev, &mnt).await.unwrap();
        assert!(mnt.is_dir());
        assert!(matches!(
            tool.mount("vol", &dev, &mnt).await,
            Err(DiskError::AlreadyMounted(_))
        ));
        assert!(tool.is_mounted("vol").await);

        tool.set_busy_unmounts(1);
        assert!(matches!(tool.unmount("vol").await, Err(DiskError::Busy(_))));
        tool.unmount("vol").await.unwrap();
        assert!(!tool.is_mounted("vol").await);
    }

    #[tokio::test]
    async fn test_device_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeImageTool::new();
        tool.set_max_devices(1);
        let a = dir.path().join("a.qcow2");
        let b = dir.path().join("b.qcow2");
        tool.create(&a, 1, &ImageConfig::default()).await.unwrap();
        tool.create(&b, 1, &ImageConfig::default()).await.unwrap();
        tool.connect("a", &a).await.unwrap();
        let err = tool.connect("b", &b).await.unwrap_err();
        assert!(matches!(err, DiskError::ResourceExhausted(_)));
    }
}
