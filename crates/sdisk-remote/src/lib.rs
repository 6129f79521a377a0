//! sdisk Remote - object store adapter
//!
//! Key layout under the bucket:
//!
//! ```text
//! disks/<name>/metadata.json          manifest
//! disks/<name>/layers/<id>.tar.gz     layer archive
//! disks/<name>/disk.qcow2             legacy unlayered image
//! ```

pub mod archive;
pub mod store;

pub use store::RemoteStore;
