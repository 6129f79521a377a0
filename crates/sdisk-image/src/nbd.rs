//! NBD device discovery through sysfs and procfs
//!
//! All functions here are blocking and are called from `spawn_blocking`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Upper bound on device nodes scanned
const MAX_NBD_DEVICES: usize = 1024;
/// Kernel default for `nbds_max`
const DEFAULT_NBD_DEVICES: usize = 16;

/// Roots of the kernel pseudo filesystems
#[derive(Clone, Debug)]
pub struct SysPaths {
    pub sys: PathBuf,
    pub proc: PathBuf,
    pub dev: PathBuf,
}

impl Default for SysPaths {
    fn default() -> Self {
        Self {
            sys: PathBuf::from("/sys"),
            proc: PathBuf::from("/proc"),
            dev: PathBuf::from("/dev"),
        }
    }
}

impl SysPaths {
    /// Whether the nbd kernel module is loaded
    #[must_use]
    pub fn module_loaded(&self) -> bool {
        self.sys.join("module/nbd").exists()
    }

    /// Number of device nodes the module created
    #[must_use]
    pub fn nbds_max(&self) -> usize {
        std::fs::read_to_string(self.sys.join("module/nbd/parameters/nbds_max"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_NBD_DEVICES)
            .min(MAX_NBD_DEVICES)
    }

    #[must_use]
    pub fn device_path(&self, index: usize) -> String {
        self.dev.join(format!("nbd{index}")).display().to_string()
    }

    /// Size in sectors reported for `nbd<index>`; zero means unattached
    fn device_size(&self, index: usize) -> Option<u64> {
        std::fs::read_to_string(self.sys.join(format!("block/nbd{index}/size")))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// First unattached device not already handed out
    #[must_use]
    pub fn find_free_device(&self, in_use: &HashSet<String>) -> Option<String> {
        (0..self.nbds_max())
            .filter(|&i| self.device_size(i) == Some(0))
            .map(|i| self.device_path(i))
            .find(|dev| !in_use.contains(dev))
    }

    /// Attached devices whose serving process was started on `image`
    #[must_use]
    pub fn find_attached_devices(&self, image: &Path) -> Vec<String> {
        let image = image.to_string_lossy();
        let mut found = Vec::new();
        for i in 0..self.nbds_max() {
            if self.device_size(i).unwrap_or(0) == 0 {
                continue;
            }
            let Some(pid) = std::fs::read_to_string(self.sys.join(format!("block/nbd{i}/pid")))
                .ok()
                .map(|s| s.trim().to_string())
            else {
                continue;
            };
            let Ok(cmdline) = std::fs::read(self.proc.join(&pid).join("cmdline")) else {
                continue;
            };
            let serves_image = cmdline
                .split(|&b| b == 0)
                .map(String::from_utf8_lossy)
                .any(|arg| arg == image || arg.ends_with(&format!("={image}")));
            if serves_image {
                found.push(self.device_path(i));
            }
        }
        found
    }

    /// Pids of `qemu-nbd` processes holding `image` open
    #[must_use]
    pub fn find_holders(&self, image: &Path) -> Vec<i32> {
        let Ok(entries) = std::fs::read_dir(&self.proc) else {
            return Vec::new();
        };
        let mut pids = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            let comm = std::fs::read_to_string(entry.path().join("comm")).unwrap_or_default();
            if comm.trim() != "qemu-nbd" {
                continue;
            }
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let holds = fds
                .flatten()
                .filter_map(|fd| std::fs::read_link(fd.path()).ok())
                .any(|target| target == image);
            if holds {
                pids.push(pid);
            }
        }
        pids
    }
}

/// Terminate lingering helper processes
pub fn terminate(pids: &[i32]) {
    for &pid in pids {
        debug!("terminating stale qemu-nbd process {pid}");
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!("failed to terminate qemu-nbd process {pid}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sys(root: &Path, sizes: &[u64]) -> SysPaths {
        let paths = SysPaths {
            sys: root.join("sys"),
            proc: root.join("proc"),
            dev: PathBuf::from("/dev"),
        };
        let params = paths.sys.join("module/nbd/parameters");
        std::fs::create_dir_all(&params).unwrap();
        std::fs::write(params.join("nbds_max"), format!("{}\n", sizes.len())).unwrap();
        for (i, size) in sizes.iter().enumerate() {
            let dir = paths.sys.join(format!("block/nbd{i}"));
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("size"), format!("{size}\n")).unwrap();
        }
        std::fs::create_dir_all(&paths.proc).unwrap();
        paths
    }

    #[test]
    fn test_find_free_device_skips_attached_and_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let paths = fake_sys(dir.path(), &[2048, 0, 0]);
        assert!(paths.module_loaded());
        assert_eq!(paths.nbds_max(), 3);

        let none = HashSet::new();
        assert_eq!(paths.find_free_device(&none).as_deref(), Some("/dev/nbd1"));

        let taken = HashSet::from(["/dev/nbd1".to_string()]);
        assert_eq!(paths.find_free_device(&taken).as_deref(), Some("/dev/nbd2"));

        let all = HashSet::from(["/dev/nbd1".to_string(), "/dev/nbd2".to_string()]);
        assert_eq!(paths.find_free_device(&all), None);
    }

    #[test]
    fn test_find_attached_devices_by_cmdline() {
        let dir = tempfile::tempdir().unwrap();
        let paths = fake_sys(dir.path(), &[0, 2048]);
        std::fs::write(paths.sys.join("block/nbd1/pid"), "4242\n").unwrap();
        let proc_dir = paths.proc.join("4242");
        std::fs::create_dir_all(&proc_dir).unwrap();
        std::fs::write(
            proc_dir.join("cmdline"),
            b"qemu-nbd\0--cache=writethrough\0--connect=/dev/nbd1\0/data/disks/vol.qcow2\0",
        )
        .unwrap();

        assert_eq!(
            paths.find_attached_devices(Path::new("/data/disks/vol.qcow2")),
            vec!["/dev/nbd1".to_string()]
        );
        assert!(paths
            .find_attached_devices(Path::new("/data/disks/other.qcow2"))
            .is_empty());
    }

    #[test]
    fn test_find_holders_by_open_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = fake_sys(dir.path(), &[]);
        let image = dir.path().join("vol.qcow2");
        std::fs::write(&image, b"").unwrap();

        for (pid, comm) in [("100", "qemu-nbd\n"), ("200", "bash\n")] {
            let fd_dir = paths.proc.join(pid).join("fd");
            std::fs::create_dir_all(&fd_dir).unwrap();
            std::fs::write(paths.proc.join(pid).join("comm"), comm).unwrap();
            std::os::unix::fs::symlink(&image, fd_dir.join("3")).unwrap();
        }

        assert_eq!(paths.find_holders(&image), vec![100]);
    }

    #[test]
    fn test_nbds_max_defaults_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SysPaths {
            sys: dir.path().to_path_buf(),
            ..SysPaths::default()
        };
        assert_eq!(paths.nbds_max(), DEFAULT_NBD_DEVICES);

        let params = dir.path().join("module/nbd/parameters");
        std::fs::create_dir_all(&params).unwrap();
        std::fs::write(params.join("nbds_max"), "65536").unwrap();
        assert_eq!(paths.nbds_max(), MAX_NBD_DEVICES);
    }
}
