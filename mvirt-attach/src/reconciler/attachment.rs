//! Single attachment reconciler - manages exactly one disk binding of a VM.
//!
//! All fields are immutable once bound: an interface change is a remove
//! followed by a create. Do not manage a VM with both this reconciler and
//! [`AttachmentsReconciler`](super::attachments::AttachmentsReconciler);
//! they would undo each other's work on every pass.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use super::{detach, Reconciler};
use crate::error::{ReconcileError, Result, StoreError};
use crate::model::{Attachment, DiskInterface, Failure, Operation};
use crate::retry::RetryStrategy;
use crate::store::AttachmentStore;

/// One declared binding. `id` carries the attachment ID from the previous
/// pass, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentSpec {
    pub vm_id: String,
    pub disk_id: String,
    pub disk_interface: DiskInterface,
    pub id: Option<String>,
}

/// Observed binding. `id` is `None` when the attachment does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentStatus {
    pub vm_id: String,
    pub disk_id: String,
    pub disk_interface: DiskInterface,
    pub id: Option<String>,
    pub failure: Option<Failure>,
}

impl AttachmentStatus {
    fn from_spec(spec: &AttachmentSpec, id: Option<String>, failure: Option<Failure>) -> Self {
        Self {
            vm_id: spec.vm_id.clone(),
            disk_id: spec.disk_id.clone(),
            disk_interface: spec.disk_interface,
            id,
            failure,
        }
    }

    fn from_attachment(attachment: Attachment) -> Self {
        Self {
            vm_id: attachment.vm_id,
            disk_id: attachment.disk_id,
            disk_interface: attachment.disk_interface,
            id: Some(attachment.id),
            failure: None,
        }
    }
}

/// Reconciler for a single disk attachment.
pub struct AttachmentReconciler<S: ?Sized> {
    store: Arc<S>,
}

impl<S> AttachmentReconciler<S>
where
    S: AttachmentStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Look up the previously bound attachment, `None` if it is gone.
    async fn lookup(
        &self,
        vm_id: &str,
        id: &str,
        retry: &RetryStrategy,
    ) -> std::result::Result<Option<Attachment>, StoreError> {
        match self.store.get(vm_id, id, retry).await {
            Ok(attachment) => Ok(Some(attachment)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn cancelled(vm_id: &str, e: &StoreError) -> Option<ReconcileError> {
    (*e == StoreError::Cancelled).then(|| ReconcileError::Cancelled {
        vm_id: vm_id.to_string(),
    })
}

#[async_trait]
impl<S> Reconciler for AttachmentReconciler<S>
where
    S: AttachmentStore + ?Sized,
{
    type Spec = AttachmentSpec;
    type Status = AttachmentStatus;

    async fn reconcile(&self, spec: &Self::Spec, retry: &RetryStrategy) -> Result<Self::Status> {
        info!(
            "Reconciling disk attachment of disk {} to VM {}",
            spec.disk_id, spec.vm_id
        );

        if let Some(id) = &spec.id {
            match self.lookup(&spec.vm_id, id, retry).await {
                Ok(Some(current))
                    if current.disk_id == spec.disk_id
                        && current.disk_interface == spec.disk_interface =>
                {
                    return Ok(AttachmentStatus::from_attachment(current));
                }
                Ok(Some(current)) => {
                    info!(
                        "Disk attachment {} differs from declared state, recreating",
                        current.id
                    );
                    if let Err(e) = detach(&*self.store, &spec.vm_id, &current.id, retry).await {
                        if let Some(fatal) = cancelled(&spec.vm_id, &e) {
                            return Err(fatal);
                        }
                        error!("Failed to remove disk attachment {}: {}", current.id, e);
                        let failure = Failure::new(Operation::Remove, e)
                            .disk(&spec.disk_id)
                            .attachment(&current.id);
                        return Ok(AttachmentStatus::from_spec(
                            spec,
                            Some(current.id),
                            Some(failure),
                        ));
                    }
                }
                Ok(None) => {
                    info!("Disk attachment {} is gone, recreating", id);
                }
                Err(e) => {
                    if let Some(fatal) = cancelled(&spec.vm_id, &e) {
                        return Err(fatal);
                    }
                    error!("Failed to get disk attachment {}: {}", id, e);
                    let failure = Failure::new(Operation::Get, e)
                        .disk(&spec.disk_id)
                        .attachment(id);
                    return Ok(AttachmentStatus::from_spec(spec, Some(id.clone()), Some(failure)));
                }
            }
        }

        match self
            .store
            .create(&spec.vm_id, &spec.disk_id, spec.disk_interface, retry)
            .await
        {
            Ok(attachment) => Ok(AttachmentStatus::from_attachment(attachment)),
            Err(e) => {
                if let Some(fatal) = cancelled(&spec.vm_id, &e) {
                    return Err(fatal);
                }
                error!(
                    "Failed to attach disk {} to VM {}: {}",
                    spec.disk_id, spec.vm_id, e
                );
                let failure = Failure::new(Operation::Create, e).disk(&spec.disk_id);
                Ok(AttachmentStatus::from_spec(spec, None, Some(failure)))
            }
        }
    }

    async fn read(&self, status: &Self::Status, retry: &RetryStrategy) -> Result<Self::Status> {
        let Some(id) = &status.id else {
            return Ok(AttachmentStatus {
                failure: None,
                ..status.clone()
            });
        };

        match self.lookup(&status.vm_id, id, retry).await {
            Ok(Some(current)) => Ok(AttachmentStatus::from_attachment(current)),
            Ok(None) => Ok(AttachmentStatus {
                id: None,
                failure: None,
                ..status.clone()
            }),
            Err(e) => match cancelled(&status.vm_id, &e) {
                Some(fatal) => Err(fatal),
                None => Ok(AttachmentStatus {
                    failure: Some(
                        Failure::new(Operation::Get, e)
                            .disk(&status.disk_id)
                            .attachment(id),
                    ),
                    ..status.clone()
                }),
            },
        }
    }

    async fn finalize(&self, status: &Self::Status, retry: &RetryStrategy) -> Result<Self::Status> {
        let Some(id) = &status.id else {
            return Ok(status.clone());
        };
        info!("Finalizing (detaching) disk attachment {}", id);

        match detach(&*self.store, &status.vm_id, id, retry).await {
            Ok(()) => Ok(AttachmentStatus {
                id: None,
                failure: None,
                ..status.clone()
            }),
            Err(e) => match cancelled(&status.vm_id, &e) {
                Some(fatal) => Err(fatal),
                None => Ok(AttachmentStatus {
                    failure: Some(
                        Failure::new(Operation::Remove, e)
                            .disk(&status.disk_id)
                            .attachment(id),
                    ),
                    ..status.clone()
                }),
            },
        }
    }
}
