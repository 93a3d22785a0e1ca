//! Reconcilers for disk attachments.
//!
//! Each reconciler compares desired state (declared by the caller) with
//! actual state (listed from the engine) and takes actions to converge.

pub mod attachment;
pub mod attachments;
pub mod cleaner;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, StoreResult};
use crate::retry::RetryStrategy;
use crate::store::AttachmentStore;

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// The declared state from the caller.
    type Spec: Sync;
    /// The observed state handed back for persistence.
    type Status: Sync;

    /// Reconcile the resource - compare desired vs actual state and take action.
    async fn reconcile(&self, spec: &Self::Spec, retry: &RetryStrategy) -> Result<Self::Status>;

    /// Re-derive the observed state from the engine without changing it.
    async fn read(&self, status: &Self::Status, retry: &RetryStrategy) -> Result<Self::Status>;

    /// Handle resource deletion (finalization).
    async fn finalize(&self, status: &Self::Status, retry: &RetryStrategy)
        -> Result<Self::Status>;
}

/// Detach an attachment. An attachment that is already gone counts as
/// detached.
pub(crate) async fn detach<S>(
    store: &S,
    vm_id: &str,
    attachment_id: &str,
    retry: &RetryStrategy,
) -> StoreResult<()>
where
    S: AttachmentStore + ?Sized,
{
    match store.remove(vm_id, attachment_id, retry).await {
        Err(e) if e.is_not_found() => {
            debug!(
                "Disk attachment {} of VM {} already removed",
                attachment_id, vm_id
            );
            Ok(())
        }
        other => other,
    }
}
