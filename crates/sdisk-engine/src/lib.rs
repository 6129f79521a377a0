//! sdisk Engine - layered virtual disks
//!
//! [`Manager`] owns every [`Disk`], the shared [`LayerCache`] and the
//! optional [`MountPool`]. Disks are QCOW2 working images stacked on
//! refcounted cache layers and synchronized to an object store as a chain
//! of layer archives plus a manifest.

pub mod cache;
pub mod disk;
pub mod manager;
mod materialize;
pub mod pool;
mod push;
pub mod rollback;
mod shared;

#[cfg(test)]
mod testutil;

pub use cache::LayerCache;
pub use disk::Disk;
pub use manager::Manager;
pub use pool::{MountPool, PoolEntryStats, PoolStats};
pub use push::{PushKind, PushOutcome};
pub use rollback::Rollback;
