//! State store error types

use sdisk_common::DiskError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("redb error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("record encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("disk not found: {0}")]
    DiskNotFound(String),
    #[error("layer not found: {0}")]
    LayerNotFound(String),
    #[error("layer already exists: {0}")]
    LayerExists(String),
}

impl From<redb::TransactionError> for StateError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<StateError> for DiskError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::DiskNotFound(name) => Self::DiskNotFound(name),
            StateError::LayerNotFound(id) => Self::LayerNotFound(id),
            StateError::LayerExists(id) => Self::LayerExists(id),
            StateError::Io(e) => Self::Io(e),
            other => Self::Store(Box::new(other)),
        }
    }
}

pub type StateResult<T> = Result<T, StateError>;
