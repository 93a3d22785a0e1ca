//! mvirt-attach: disk attachment reconciliation for mvirt VMs.
//!
//! Converges the set of disks attached to a VM with a declared set:
//! creates missing attachments, recreates attachments whose interface
//! changed, optionally detaches or destroys unmanaged disks, and projects
//! the result back into persistable state.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use mvirt_attach::{AttachmentsReconciler, AttachmentsSpec, DesiredSet, DiskInterface};
//! use mvirt_attach::{MemoryEngine, Reconciler, RetryStrategy};
//!
//! let engine = Arc::new(MemoryEngine::new());
//! let reconciler = AttachmentsReconciler::new(engine);
//! let desired = DesiredSet::from_entries([(disk_id, DiskInterface::VirtioScsi)])?;
//! let status = reconciler
//!     .reconcile(&AttachmentsSpec::new(vm_id, desired), &RetryStrategy::default())
//!     .await?;
//! ```

pub mod error;
pub mod manifest;
pub mod model;
pub mod projector;
pub mod reconciler;
pub mod retry;
pub mod store;

pub use error::{ConfigError, ReconcileError, StoreError};
pub use manifest::Manifest;
pub use model::{
    Attachment, DesiredSet, Disk, DiskInterface, DiskStatus, Failure, ImageFormat, Operation,
    ResolvedAttachment,
};
pub use reconciler::attachment::{AttachmentReconciler, AttachmentSpec, AttachmentStatus};
pub use reconciler::attachments::{AttachmentsReconciler, AttachmentsSpec, AttachmentsStatus};
pub use reconciler::cleaner::UnmanagedPolicy;
pub use reconciler::Reconciler;
pub use retry::RetryStrategy;
pub use store::memory::DiskParams;
pub use store::{AttachmentStore, MemoryEngine};
