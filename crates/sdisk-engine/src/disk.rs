//! A single managed disk
//!
//! Mount state lives in memory behind the disk's own lock and is mirrored
//! into the state store after every change. Callers that mount through the
//! pool go pool → disk → image tool, never the other way round.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use sdisk_common::{DiskError, DiskInfo, DiskResult, ResultExt};

use crate::pool::MountPool;
use crate::shared::Shared;

/// In-memory state guarded by [`Disk`]'s lock
#[derive(Debug)]
pub(crate) struct DiskState {
    pub size_gb: u64,
    pub working_path: PathBuf,
    pub device: Option<String>,
    pub mount_path: Option<PathBuf>,
}

impl DiskState {
    pub const fn is_mounted(&self) -> bool {
        self.mount_path.is_some()
    }
}

/// Handle to one disk. Obtained from [`crate::Manager`].
pub struct Disk {
    name: String,
    pub(crate) shared: Arc<Shared>,
    pool: Option<Weak<MountPool>>,
    inner: Mutex<DiskState>,
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Disk {
    pub(crate) fn new(
        name: impl Into<String>,
        size_gb: u64,
        shared: Arc<Shared>,
        pool: Option<Weak<MountPool>>,
    ) -> Arc<Self> {
        let name = name.into();
        let working_path = shared.layout.working_image(&name);
        Arc::new(Self {
            name,
            shared,
            pool,
            inner: Mutex::new(DiskState {
                size_gb,
                working_path,
                device: None,
                mount_path: None,
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, DiskState> {
        self.inner.lock().await
    }

    pub async fn size_gb(&self) -> u64 {
        self.inner.lock().await.size_gb
    }

    pub async fn is_mounted(&self) -> bool {
        self.inner.lock().await.is_mounted()
    }

    pub async fn mount_path(&self) -> Option<PathBuf> {
        self.inner.lock().await.mount_path.clone()
    }

    pub async fn working_path(&self) -> PathBuf {
        self.inner.lock().await.working_path.clone()
    }

    fn pool(&self) -> Option<Arc<MountPool>> {
        self.pool.as_ref().and_then(Weak::upgrade)
    }

    // ── Mounting ──────────────────────────────────────────────────────────────

    /// Mount the disk, through the pool when one is configured. Returns the
    /// mount point.
    pub async fn mount(self: &Arc<Self>) -> DiskResult<PathBuf> {
        match self.pool() {
            Some(pool) => pool.get(self).await,
            None => self.mount_direct().await,
        }
    }

    /// Attach and mount without consulting the pool
    pub async fn mount_direct(&self) -> DiskResult<PathBuf> {
        let mut st = self.inner.lock().await;
        if let Some(path) = &st.mount_path {
            return Ok(path.clone());
        }
        let tool = &self.shared.tool;
        let mount_dir = self.shared.layout.mount_dir(&self.name);
        // a mount left behind by a forced removal is taken over as is
        if let Some(existing) = tool.mount_path(&self.name).await {
            debug!("adopting existing mount of {} at {}", self.name, existing.display());
            st.mount_path = Some(existing.clone());
            self.shared.state.update_mount_state(
                &self.name,
                true,
                Some(&existing.display().to_string()),
            )?;
            return Ok(existing);
        }
        let device = tool
            .connect(&self.name, &st.working_path)
            .await
            .with_context(|| format!("attach {}", self.name))?;
        if let Err(e) = tool.mount(&self.name, &device, &mount_dir).await {
            if let Err(de) = tool.disconnect(&self.name).await {
                warn!("failed to detach {device} after mount failure: {de}");
            }
            return Err(e.context(format!("mount {}", self.name)));
        }
        st.device = Some(device.clone());
        st.mount_path = Some(mount_dir.clone());
        self.shared.state.update_mount_state(
            &self.name,
            true,
            Some(&mount_dir.display().to_string()),
        )?;
        info!("mounted {} ({device}) at {}", self.name, mount_dir.display());
        Ok(mount_dir)
    }

    /// Unmount the disk and leave the pool, if it is a member
    pub async fn unmount(&self) -> DiskResult<()> {
        if let Some(pool) = self.pool() {
            pool.evict(&self.name).await?;
        }
        self.unmount_direct().await
    }

    /// Unmount and detach without consulting the pool
    pub async fn unmount_direct(&self) -> DiskResult<()> {
        let mut st = self.inner.lock().await;
        if st.mount_path.is_none() && st.device.is_none() {
            return Ok(());
        }
        let tool = &self.shared.tool;
        tool.unmount(&self.name)
            .await
            .with_context(|| format!("unmount {}", self.name))?;
        st.mount_path = None;
        tool.disconnect(&self.name)
            .await
            .with_context(|| format!("detach {}", self.name))?;
        st.device = None;
        self.shared.state.update_mount_state(&self.name, false, None)?;
        info!("unmounted {}", self.name);
        Ok(())
    }

    /// Tear down the system mount and device best-effort, then forget the
    /// mount state whatever the outcome
    pub(crate) async fn force_detach(&self) -> DiskResult<()> {
        let mut st = self.inner.lock().await;
        let tool = &self.shared.tool;
        if let Err(e) = tool.unmount(&self.name).await {
            warn!("force detach {}: unmount failed: {e}", self.name);
        }
        if let Err(e) = tool.disconnect(&self.name).await {
            warn!("force detach {}: detach failed: {e}", self.name);
        }
        st.device = None;
        st.mount_path = None;
        self.shared.state.update_mount_state(&self.name, false, None)?;
        Ok(())
    }

    /// Flush the mounted filesystem and device
    pub async fn sync(&self) -> DiskResult<()> {
        let st = self.inner.lock().await;
        if !st.is_mounted() {
            return Err(DiskError::invalid_state(format!("{} is not mounted", self.name)));
        }
        self.shared
            .tool
            .sync(&self.name)
            .await
            .with_context(|| format!("sync {}", self.name))
    }

    // ── Geometry ──────────────────────────────────────────────────────────────

    /// Grow the virtual size. Shrinking is refused, as is resizing while
    /// mounted.
    pub async fn resize(&self, new_size_gb: u64) -> DiskResult<()> {
        let mut st = self.inner.lock().await;
        if st.is_mounted() {
            return Err(DiskError::DiskMounted(self.name.clone()));
        }
        if new_size_gb < st.size_gb {
            return Err(DiskError::CannotShrink(st.size_gb, new_size_gb));
        }
        if new_size_gb == st.size_gb {
            return Ok(());
        }
        self.shared
            .tool
            .resize(&st.working_path, new_size_gb)
            .await
            .with_context(|| format!("resize {}", self.name))?;
        self.shared
            .state
            .update_disk(&self.name, |r| r.size_gb = new_size_gb)?;
        info!("resized {} from {}G to {new_size_gb}G", self.name, st.size_gb);
        st.size_gb = new_size_gb;
        Ok(())
    }

    /// Current information. Allocation falls back to 0 when the image
    /// cannot be inspected.
    pub async fn info(&self) -> DiskResult<DiskInfo> {
        let st = self.inner.lock().await;
        let record = self
            .shared
            .state
            .get_disk(&self.name)?
            .ok_or_else(|| DiskError::DiskNotFound(self.name.clone()))?;
        let actual = match self.shared.tool.actual_size(&st.working_path).await {
            Ok(size) => size,
            Err(e) => {
                warn!("failed to query {}: {e}", st.working_path.display());
                0
            }
        };
        let mut info = DiskInfo::from_record(&record, actual);
        info.size_gb = st.size_gb;
        info.is_mounted = st.is_mounted();
        info.mount_path = st.mount_path.as_ref().map(|p| p.display().to_string());
        Ok(info)
    }

    /// Release system resources held by this disk
    pub async fn close(&self) -> DiskResult<()> {
        self.unmount().await
    }
}

#[cfg(test)]
mod tests {
    use sdisk_common::DiskError;

    use crate::testutil::Harness;

    #[tokio::test]
    async fn test_mount_unmount_roundtrip() {
        let h = Harness::new().await;
        let disk = h.manager.create("vol", 10).await.unwrap();

        let path = disk.mount().await.unwrap();
        assert!(path.is_dir());
        assert!(disk.is_mounted().await);
        assert_eq!(h.tool.mounted(), vec!["vol"]);
        // mounting again is a no-op
        assert_eq!(disk.mount().await.unwrap(), path);
        assert_eq!(h.tool.mount_calls(), 1);

        let info = disk.info().await.unwrap();
        assert!(info.is_mounted);
        assert_eq!(info.mount_path, Some(path.display().to_string()));
        let record = h.manager.state().get_disk("vol").unwrap().unwrap();
        assert!(record.is_mounted);

        disk.sync().await.unwrap();
        disk.unmount().await.unwrap();
        assert!(!disk.is_mounted().await);
        assert!(h.tool.mounted().is_empty());
        assert!(!h.manager.state().get_disk("vol").unwrap().unwrap().is_mounted);
        assert!(disk.sync().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_mount_detaches_device() {
        let h = Harness::new().await;
        h.tool.set_max_devices(1);
        let disk = h.manager.create("vol", 10).await.unwrap();
        h.tool.fail_next("mount");

        assert!(disk.mount().await.is_err());
        assert!(!disk.is_mounted().await);
        // the device was released, so a retry can attach again
        disk.mount().await.unwrap();
    }

    #[tokio::test]
    async fn test_busy_unmount_is_reported() {
        let h = Harness::new().await;
        let disk = h.manager.create("vol", 10).await.unwrap();
        disk.mount().await.unwrap();
        h.tool.set_busy_unmounts(1);

        let err = disk.unmount().await.unwrap_err();
        assert!(matches!(err.root(), DiskError::Busy(_)));
        assert!(disk.is_mounted().await);

        disk.unmount().await.unwrap();
        assert!(!disk.is_mounted().await);
    }

    #[tokio::test]
    async fn test_resize_grows_only() {
        let h = Harness::new().await;
        let disk = h.manager.create("vol", 10).await.unwrap();

        let err = disk.resize(5).await.unwrap_err();
        assert!(matches!(err, DiskError::CannotShrink(10, 5)));

        disk.resize(20).await.unwrap();
        assert_eq!(disk.size_gb().await, 20);
        assert_eq!(disk.info().await.unwrap().size_gb, 20);
        let record = h.manager.state().get_disk("vol").unwrap().unwrap();
        assert_eq!(record.size_gb, 20);

        disk.mount().await.unwrap();
        let err = disk.resize(30).await.unwrap_err();
        assert!(matches!(err, DiskError::DiskMounted(_)));
    }

    #[tokio::test]
    async fn test_info_reports_allocation() {
        let h = Harness::new().await;
        let disk = h.manager.create("vol", 10).await.unwrap();
        let empty = disk.info().await.unwrap().actual_size;
        h.write("vol", 0, 4, "data");
        let info = disk.info().await.unwrap();
        assert_eq!(info.name, "vol");
        assert!(info.actual_size > empty);
        assert!(!info.in_remote);
    }
}
