//! Error types for attachment reconciliation.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by an [`AttachmentStore`](crate::store::AttachmentStore).
///
/// Every variant is a remote failure; [`StoreError::NotFound`] additionally
/// means the target is already absent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Target object does not exist (anymore).
    #[error("not found: {0}")]
    NotFound(String),

    /// Disk is exclusively attached elsewhere.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Engine refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Connection or authentication failure.
    #[error("transport: {0}")]
    Transport(String),

    /// A single attempt exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the operation.
    #[error("cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Whether a retry strategy may repeat the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport(_) | StoreError::Timeout(_))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Malformed declared state, detected before any remote call.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("disk {0} is declared more than once")]
    DuplicateDisk(String),

    #[error("invalid disk_interface '{value}', expected one of: {allowed}")]
    InvalidDiskInterface { value: String, allowed: String },

    #[error("invalid image format '{0}', expected one of: raw, cow")]
    InvalidImageFormat(String),

    #[error("{field} is not a UUID: '{value}'")]
    InvalidUuid { field: &'static str, value: String },

    #[error("destructive cleanup requires remove_unmanaged")]
    DestructiveWithoutRemoveUnmanaged,

    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Fatal outcome of a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to list disk attachments of VM {vm_id}: {source}")]
    Fetch {
        vm_id: String,
        #[source]
        source: StoreError,
    },

    #[error("reconciliation of VM {vm_id} cancelled")]
    Cancelled { vm_id: String },
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
