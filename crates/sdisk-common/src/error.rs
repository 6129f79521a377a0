//! Error types for sdisk
//!
//! Every public operation across the sdisk crates returns [`DiskResult`].
//! Lower-level crates convert their library errors into [`DiskError`].

use thiserror::Error;

/// Common result type for disk operations
pub type DiskResult<T> = std::result::Result<T, DiskError>;

/// Boxed source error from a storage or remote backend
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Common error type for disk operations
#[derive(Debug, Error)]
pub enum DiskError {
    // Lookup errors
    #[error("disk not found: {0}")]
    DiskNotFound(String),

    #[error("layer not found: {0}")]
    LayerNotFound(String),

    #[error("remote object not found: {0}")]
    RemoteNotFound(String),

    #[error("disk already exists: {0}")]
    DiskExists(String),

    #[error("layer already exists: {0}")]
    LayerExists(String),

    // State errors
    #[error("disk is mounted: {0}")]
    DiskMounted(String),

    #[error("already mounted: {0}")]
    AlreadyMounted(String),

    #[error("cannot shrink disk from {0} GB to {1} GB")]
    CannotShrink(u64, u64),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Resource errors
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("target is busy: {0}")]
    Busy(String),

    // External tool errors
    #[error("{command} failed ({status}): {output}")]
    ExternalTool {
        command: String,
        status: String,
        output: String,
    },

    // Integrity errors
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("checksum mismatch for {layer_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        layer_id: String,
        expected: String,
        actual: String,
    },

    // Backend errors
    #[error("remote store is not configured")]
    RemoteNotConfigured,

    #[error("remote store error: {0}")]
    Remote(#[source] BoxError),

    #[error("state store error: {0}")]
    Store(#[source] BoxError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<DiskError>,
    },
}

impl DiskError {
    /// Create an integrity violation error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap this error with operation context
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers removed
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if the operation may succeed when retried
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self.root(), Self::Busy(_) | Self::ResourceExhausted(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Self::DiskNotFound(_) | Self::LayerNotFound(_) | Self::RemoteNotFound(_)
        )
    }

    /// Check if this is an integrity violation
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(
            self.root(),
            Self::Integrity(_) | Self::ChecksumMismatch { .. }
        )
    }
}

/// Attach operation context to a failing result
pub trait ResultExt<T> {
    /// Wrap the error with a fixed context string
    fn context(self, context: impl Into<String>) -> DiskResult<T>;

    /// Wrap the error with a lazily built context string
    fn with_context<F, S>(self, f: F) -> DiskResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<DiskError>,
{
    fn context(self, context: impl Into<String>) -> DiskResult<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> DiskResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
