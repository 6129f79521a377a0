//! sdisk Image - QCOW2 images and NBD devices
//!
//! [`ImageTool`] is the boundary to `qemu-img`, `qemu-nbd` and the mount
//! utilities. [`QemuImageTool`] drives the real binaries; the `fake`
//! feature adds a file-backed stand-in used by tests.

pub mod chain;
pub mod nbd;
pub mod qemu;
pub mod tool;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub use chain::walk_backing_chain;
pub use qemu::QemuImageTool;
pub use tool::{ImageInfo, ImageTool, checksum_file};

#[cfg(any(test, feature = "fake"))]
pub use fake::FakeImageTool;
