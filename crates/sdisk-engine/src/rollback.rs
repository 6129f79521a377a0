//! Compensating actions for multi-step operations
//!
//! Each step that creates a file, takes a reference or writes a record
//! pushes its undo. On failure the stack unwinds in reverse; an undo that
//! fails is logged and the unwinding continues.

use std::future::Future;
use std::path::PathBuf;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use sdisk_common::DiskResult;

use crate::shared::{remove_dir_if_exists, remove_if_exists};

/// Undo stack for one operation
pub struct Rollback {
    operation: String,
    steps: Vec<(String, BoxFuture<'static, DiskResult<()>>)>,
}

impl Rollback {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            steps: Vec::new(),
        }
    }

    /// Register an undo step. The future only runs if the stack unwinds.
    pub fn push<F>(&mut self, what: impl Into<String>, undo: F)
    where
        F: Future<Output = DiskResult<()>> + Send + 'static,
    {
        self.steps.push((what.into(), undo.boxed()));
    }

    /// Undo by deleting `path`; a missing file is not an error
    pub fn remove_file(&mut self, path: PathBuf) {
        self.push(format!("remove {}", path.display()), async move {
            remove_if_exists(&path).await?;
            Ok(())
        });
    }

    /// Undo by deleting the directory tree at `path`
    pub fn remove_dir_all(&mut self, path: PathBuf) {
        self.push(format!("remove {}", path.display()), async move {
            remove_dir_if_exists(&path).await?;
            Ok(())
        });
    }

    /// Forget every pending step. Used once an operation passes the point
    /// after which undoing would lose committed data.
    pub fn disarm(&mut self) {
        self.steps.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step, newest first
    pub async fn unwind(self) {
        if self.steps.is_empty() {
            return;
        }
        debug!("rolling back {} ({} steps)", self.operation, self.steps.len());
        for (what, undo) in self.steps.into_iter().rev() {
            if let Err(e) = undo.await {
                warn!("rollback of {}: {what} failed: {e}", self.operation);
            }
        }
    }

    /// Pass `result` through, unwinding first if it is an error
    pub async fn finish<T>(self, result: DiskResult<T>) -> DiskResult<T> {
        if result.is_err() {
            self.unwind().await;
        }
        result
    }
}
