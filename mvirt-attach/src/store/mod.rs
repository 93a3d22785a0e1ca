//! Access to the virtualization engine's disk attachments.
//!
//! The reconcilers only talk to the engine through [`AttachmentStore`]:
//! - [`MemoryEngine`]: in-process simulated engine, optionally persisted to a
//!   JSON file

pub mod memory;

pub use memory::{Call, EngineState, MemoryEngine};

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::model::{Attachment, Disk, DiskInterface};
use crate::retry::RetryStrategy;

/// Attachment operations of a remote engine.
///
/// Each call runs under the caller's [`RetryStrategy`].
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// List attachments of a VM in engine order. A VM without attachments
    /// yields an empty list.
    async fn list(&self, vm_id: &str, retry: &RetryStrategy) -> StoreResult<Vec<Attachment>>;

    /// Get a single attachment of a VM.
    async fn get(
        &self,
        vm_id: &str,
        attachment_id: &str,
        retry: &RetryStrategy,
    ) -> StoreResult<Attachment>;

    /// Attach a disk to a VM.
    async fn create(
        &self,
        vm_id: &str,
        disk_id: &str,
        disk_interface: DiskInterface,
        retry: &RetryStrategy,
    ) -> StoreResult<Attachment>;

    /// Detach an attachment. The disk itself is kept.
    async fn remove(&self, vm_id: &str, attachment_id: &str, retry: &RetryStrategy)
        -> StoreResult<()>;

    /// Look up the disk behind an attachment.
    async fn resolve_disk(&self, attachment: &Attachment, retry: &RetryStrategy)
        -> StoreResult<Disk>;

    /// Delete a disk, detaching it from every VM.
    async fn delete_disk(&self, disk: &Disk, retry: &RetryStrategy) -> StoreResult<()>;
}
