//! sdisk State - durable records
//!
//! Disks, cached layers with reference counts, and the ordered mapping
//! between them, persisted in a single redb database.

pub mod error;
pub mod store;

pub use error::{StateError, StateResult};
pub use store::{RefcountDrift, StateStore};
