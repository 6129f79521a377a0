//! `qemu-img` / `qemu-nbd` backed image tool

use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sdisk_common::{Backoff, DiskError, DiskResult, ImageConfig};

use crate::nbd::{self, SysPaths};
use crate::tool::{ImageInfo, ImageTool};

/// Binaries that must be on PATH
const REQUIRED_BINARIES: &[&str] = &["qemu-img", "qemu-nbd"];

/// Devices and mounts attached by this process, keyed by disk name
#[derive(Debug, Default)]
struct Attachments {
    devices: HashMap<String, String>,
    mounts: HashMap<String, PathBuf>,
}

/// Image tool driving the qemu binaries and the mount utilities
pub struct QemuImageTool {
    state: Mutex<Attachments>,
    sys: SysPaths,
    cancel: CancellationToken,
}

impl QemuImageTool {
    /// Create the tool after checking that the binaries and the nbd
    /// kernel module are available
    pub fn new() -> DiskResult<Self> {
        for bin in REQUIRED_BINARIES {
            if find_in_path(bin).is_none() {
                return Err(DiskError::config(format!("{bin} not found in PATH")));
            }
        }
        let sys = SysPaths::default();
        if !sys.module_loaded() {
            return Err(DiskError::config(
                "nbd kernel module is not loaded (modprobe nbd)",
            ));
        }
        Ok(Self {
            state: Mutex::new(Attachments::default()),
            sys,
            cancel: CancellationToken::new(),
        })
    }

    /// Detach stale attachments of `path` left by an earlier process
    async fn clear_stale(&self, path: &Path) -> DiskResult<()> {
        let sys = self.sys.clone();
        let image = path.to_path_buf();
        let devices = tokio::task::spawn_blocking(move || sys.find_attached_devices(&image))
            .await
            .map_err(join_err)?;

        if devices.is_empty() {
            let sys = self.sys.clone();
            let image = path.to_path_buf();
            let holders = tokio::task::spawn_blocking(move || sys.find_holders(&image))
                .await
                .map_err(join_err)?;
            if !holders.is_empty() {
                warn!("killing {} lingering qemu-nbd process(es) for {}", holders.len(), path.display());
                nbd::terminate(&holders);
            }
            return Ok(());
        }

        for dev in devices {
            warn!("disconnecting stale nbd device {dev} for {}", path.display());
            if let Err(e) = run("qemu-nbd", ["--disconnect", dev.as_str()]).await {
                warn!("failed to disconnect stale device {dev}: {e}");
            }
        }
        Ok(())
    }

    async fn flush_device(device: &str) {
        if let Err(e) = run("blockdev", ["--flushbufs", device]).await {
            debug!("flushing {device} failed: {e}");
        }
    }
}

#[async_trait]
impl ImageTool for QemuImageTool {
    async fn create(&self, path: &Path, size_gb: u64, opts: &ImageConfig) -> DiskResult<()> {
        let options = opts.create_options();
        run(
            "qemu-img",
            [
                OsStr::new("create"),
                OsStr::new("-f"),
                OsStr::new("qcow2"),
                OsStr::new("-o"),
                OsStr::new(&options),
                path.as_os_str(),
                OsStr::new(&format!("{size_gb}G")),
            ],
        )
        .await?;
        info!("created image {} ({size_gb}G, {options})", path.display());
        Ok(())
    }

    async fn create_with_backing(
        &self,
        backing: &Path,
        path: &Path,
        size_gb: u64,
    ) -> DiskResult<()> {
        let mut args: Vec<OsString> = ["create", "-f", "qcow2", "-F", "qcow2", "-b"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(backing.into());
        args.push(path.into());
        if size_gb > 0 {
            args.push(format!("{size_gb}G").into());
        }
        run("qemu-img", &args).await?;
        debug!("created overlay {} on {}", path.display(), backing.display());
        Ok(())
    }

    async fn info(&self, path: &Path) -> DiskResult<ImageInfo> {
        let out = run(
            "qemu-img",
            [
                OsStr::new("info"),
                OsStr::new("--output=json"),
                path.as_os_str(),
            ],
        )
        .await?;
        ImageInfo::from_json(&out)
    }

    async fn resize(&self, path: &Path, size_gb: u64) -> DiskResult<()> {
        run(
            "qemu-img",
            [
                OsStr::new("resize"),
                path.as_os_str(),
                OsStr::new(&format!("{size_gb}G")),
            ],
        )
        .await?;
        Ok(())
    }

    async fn convert(&self, src: &Path, dst: &Path) -> DiskResult<()> {
        self.validate_backing_chain(src).await?;
        run(
            "qemu-img",
            [
                OsStr::new("convert"),
                OsStr::new("-f"),
                OsStr::new("qcow2"),
                OsStr::new("-O"),
                OsStr::new("qcow2"),
                src.as_os_str(),
                dst.as_os_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn rebase(&self, path: &Path, backing: &Path) -> DiskResult<()> {
        run(
            "qemu-img",
            [
                OsStr::new("rebase"),
                OsStr::new("-f"),
                OsStr::new("qcow2"),
                OsStr::new("-F"),
                OsStr::new("qcow2"),
                OsStr::new("-b"),
                backing.as_os_str(),
                path.as_os_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn rebase_unsafe(&self, path: &Path, backing: Option<&Path>) -> DiskResult<()> {
        let mut args: Vec<OsString> = ["rebase", "-u", "-f", "qcow2"]
            .into_iter()
            .map(OsString::from)
            .collect();
        if backing.is_some() {
            args.extend(["-F", "qcow2"].map(OsString::from));
        }
        args.push("-b".into());
        args.push(backing.map_or_else(OsString::new, |b| b.as_os_str().to_os_string()));
        args.push(path.into());
        run("qemu-img", &args).await?;
        Ok(())
    }

    async fn commit(&self, path: &Path) -> DiskResult<()> {
        run(
            "qemu-img",
            [OsStr::new("commit"), OsStr::new("-f"), OsStr::new("qcow2"), path.as_os_str()],
        )
        .await?;
        Ok(())
    }

    async fn connect(&self, name: &str, path: &Path) -> DiskResult<String> {
        let mut state = self.state.lock().await;
        if let Some(dev) = state.devices.get(name) {
            return Ok(dev.clone());
        }

        self.clear_stale(path).await?;

        if let Err(e) = run("qemu-img", [OsStr::new("check"), OsStr::new("-r"), OsStr::new("all"), path.as_os_str()]).await {
            warn!("image check for {} reported problems: {e}", path.display());
        }

        let in_use: HashSet<String> = state.devices.values().cloned().collect();
        let device = Backoff::DEVICE_SCAN
            .retry(&self.cancel, "find free nbd device", || {
                let sys = self.sys.clone();
                let in_use = in_use.clone();
                async move {
                    tokio::task::spawn_blocking(move || sys.find_free_device(&in_use))
                        .await
                        .map_err(join_err)?
                        .ok_or_else(|| DiskError::ResourceExhausted("no free nbd device".into()))
                }
            })
            .await?;

        let connect = format!("--connect={device}");
        run(
            "qemu-nbd",
            [
                OsStr::new("--cache=writethrough"),
                OsStr::new("--discard=unmap"),
                OsStr::new("--detect-zeroes=unmap"),
                OsStr::new("--format=qcow2"),
                OsStr::new(&connect),
                path.as_os_str(),
            ],
        )
        .await?;

        info!("connected {} to {device}", path.display());
        state.devices.insert(name.to_string(), device.clone());
        Ok(device)
    }

    async fn disconnect(&self, name: &str) -> DiskResult<()> {
        let mut state = self.state.lock().await;
        let Some(device) = state.devices.get(name).cloned() else {
            return Ok(());
        };
        Self::flush_device(&device).await;
        run("qemu-nbd", ["--disconnect", device.as_str()]).await?;
        state.devices.remove(name);
        info!("disconnected {device} ({name})");
        Ok(())
    }

    async fn mount(&self, name: &str, device: &str, mount_path: &Path) -> DiskResult<()> {
        let mut state = self.state.lock().await;
        if state.mounts.contains_key(name) {
            return Err(DiskError::AlreadyMounted(name.to_string()));
        }
        tokio::fs::create_dir_all(mount_path).await?;

        if run("blkid", [device]).await.is_err() {
            info!("no filesystem on {device}, formatting ext4");
            run("mkfs.ext4", ["-F", device]).await?;
        }
        run("mount", [OsStr::new(device), mount_path.as_os_str()]).await?;

        state.mounts.insert(name.to_string(), mount_path.to_path_buf());
        info!("mounted {device} at {}", mount_path.display());
        Ok(())
    }

    async fn unmount(&self, name: &str) -> DiskResult<()> {
        let mut state = self.state.lock().await;
        let Some(mount_path) = state.mounts.get(name).cloned() else {
            return Ok(());
        };

        if let Err(e) = run("sync", [OsStr::new("-f"), mount_path.as_os_str()]).await {
            debug!("syncfs on {} failed: {e}", mount_path.display());
        }

        Backoff::UNMOUNT
            .retry(&self.cancel, "unmount", || async {
                run("umount", [mount_path.as_os_str()])
                    .await
                    .map(drop)
                    .map_err(classify_busy)
            })
            .await?;

        state.mounts.remove(name);
        info!("unmounted {}", mount_path.display());
        Ok(())
    }

    async fn sync(&self, name: &str) -> DiskResult<()> {
        let state = self.state.lock().await;
        let mount_path = state
            .mounts
            .get(name)
            .cloned()
            .ok_or_else(|| DiskError::invalid_state(format!("{name} is not mounted")))?;
        let device = state.devices.get(name).cloned();
        drop(state);

        if let Err(e) = run("fstrim", [mount_path.as_os_str()]).await {
            debug!("fstrim on {} failed: {e}", mount_path.display());
        }
        run("sync", [OsStr::new("-f"), mount_path.as_os_str()]).await?;
        if let Some(device) = device {
            Self::flush_device(&device).await;
        }
        Ok(())
    }

    async fn mount_path(&self, name: &str) -> Option<PathBuf> {
        self.state.lock().await.mounts.get(name).cloned()
    }

    async fn close(&self) -> DiskResult<()> {
        self.cancel.cancel();

        let (mounted, connected): (Vec<String>, Vec<String>) = {
            let state = self.state.lock().await;
            (
                state.mounts.keys().cloned().collect(),
                state.devices.keys().cloned().collect(),
            )
        };

        let mut first_err = None;
        for name in mounted {
            if let Err(e) = self.unmount(&name).await {
                warn!("close: unmount {name} failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        for name in connected {
            if let Err(e) = self.disconnect(&name).await {
                warn!("close: disconnect {name} failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Run a command to completion and return its stdout, or an
/// [`DiskError::ExternalTool`] with the combined output on failure
async fn run<I, S>(program: &str, args: I) -> DiskResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let command = std::iter::once(program.to_string())
        .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ");
    debug!("exec: {command}");

    let output = Command::new(program).args(&args).output().await?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim());
    }
    Err(DiskError::ExternalTool {
        command,
        status: output.status.to_string(),
        output: text,
    })
}

/// Map "target is busy" failures to [`DiskError::Busy`] so they are retried
fn classify_busy(err: DiskError) -> DiskError {
    match err {
        DiskError::ExternalTool { ref output, .. }
            if output.contains("target is busy") || output.contains("device is busy") =>
        {
            DiskError::Busy(output.clone())
        }
        other => other,
    }
}

fn join_err(e: tokio::task::JoinError) -> DiskError {
    DiskError::Io(std::io::Error::other(e))
}

fn find_in_path(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.is_file())
}
