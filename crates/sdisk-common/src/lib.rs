//! sdisk Common - Shared types and utilities
//!
//! Configuration, the error taxonomy, persisted record types, the remote
//! manifest schema and the on-disk directory layout used by every sdisk
//! crate.

pub mod config;
pub mod error;
pub mod graph;
pub mod layout;
pub mod retry;
pub mod types;

pub use config::{
    Compression, Config, ImageConfig, PoolConfig, Preallocation, RemoteConfig,
};
pub use error::{DiskError, DiskResult, ResultExt};
pub use graph::LayerGraph;
pub use layout::Layout;
pub use retry::Backoff;
pub use types::*;

/// Bytes per gigabyte as used for disk sizes (`qemu-img` `G` suffix).
pub const GIB: u64 = 1 << 30;
