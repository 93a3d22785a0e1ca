//! Disk attachments reconciler - converges the full attachment set of a VM.
//!
//! A pass runs in a fixed order:
//! 1. list the VM's attachments (fatal on failure)
//! 2. clean unmanaged attachments, if the policy asks for it
//! 3. for every desired disk: keep, create, or remove + create on an
//!    interface change
//! 4. project the resolved IDs into the persisted state
//!
//! Failures in steps 2 and 3 are collected per entry and never stop the
//! pass. Desired and actual attachments are matched by disk ID only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::cleaner::{self, UnmanagedPolicy};
use super::{detach, Reconciler};
use crate::error::{ReconcileError, Result, StoreError};
use crate::model::{
    Attachment, DesiredSet, DiskInterface, Failure, Operation, ResolvedAttachment,
};
use crate::projector;
use crate::retry::RetryStrategy;
use crate::store::AttachmentStore;

/// Declared attachment set of one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentsSpec {
    pub vm_id: String,
    pub desired: DesiredSet,
    pub unmanaged: UnmanagedPolicy,
}

impl AttachmentsSpec {
    pub fn new(vm_id: impl Into<String>, desired: DesiredSet) -> Self {
        Self {
            vm_id: vm_id.into(),
            desired,
            unmanaged: UnmanagedPolicy::Ignore,
        }
    }

    pub fn unmanaged(mut self, policy: UnmanagedPolicy) -> Self {
        self.unmanaged = policy;
        self
    }
}

/// Outcome of a pass: the state to persist plus every non-fatal failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentsStatus {
    pub vm_id: String,
    pub attachments: Vec<ResolvedAttachment>,
    pub failures: Vec<Failure>,
}

impl AttachmentsStatus {
    pub fn new(vm_id: impl Into<String>, attachments: Vec<ResolvedAttachment>) -> Self {
        Self {
            vm_id: vm_id.into(),
            attachments,
            failures: Vec::new(),
        }
    }

    /// No entry failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn attachment(&self, disk_id: &str) -> Option<&ResolvedAttachment> {
        self.attachments.iter().find(|a| a.disk_id == disk_id)
    }
}

/// Actual attachments sorted against the desired set.
#[derive(Debug, Default)]
struct Partition {
    /// One actual attachment per desired disk: the first in engine order
    /// with the desired interface, else the first in engine order.
    matched: HashMap<String, Attachment>,
    /// Further attachments of an already matched desired disk.
    surplus: Vec<Attachment>,
    /// Attachments of undeclared disks.
    unmanaged: Vec<Attachment>,
}

impl Partition {
    fn of(desired: &DesiredSet, actual: Vec<Attachment>) -> Self {
        let mut partition = Partition::default();
        for attachment in actual {
            let Some(disk_interface) = desired.get(&attachment.disk_id) else {
                partition.unmanaged.push(attachment);
                continue;
            };
            let take = match partition.matched.get(&attachment.disk_id) {
                None => true,
                Some(current) => {
                    current.disk_interface != disk_interface
                        && attachment.disk_interface == disk_interface
                }
            };
            if !take {
                partition.surplus.push(attachment);
            } else if let Some(replaced) = partition
                .matched
                .insert(attachment.disk_id.clone(), attachment)
            {
                partition.surplus.push(replaced);
            }
        }
        partition
    }
}

/// Reconciler for the attachment set of a VM.
pub struct AttachmentsReconciler<S: ?Sized> {
    store: Arc<S>,
}

impl<S> AttachmentsReconciler<S>
where
    S: AttachmentStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Adopt the live attachments of a VM as its declared state.
    pub async fn import(&self, vm_id: &str, retry: &RetryStrategy) -> Result<AttachmentsStatus> {
        info!("Importing disk attachments of VM {}", vm_id);
        let actual = self.fetch(vm_id, retry).await?;
        let attachments = projector::refresh(Vec::<&str>::new(), &actual);
        Ok(AttachmentsStatus::new(vm_id, attachments))
    }

    async fn fetch(&self, vm_id: &str, retry: &RetryStrategy) -> Result<Vec<Attachment>> {
        match self.store.list(vm_id, retry).await {
            Ok(actual) => {
                debug!("VM {} has {} disk attachments", vm_id, actual.len());
                Ok(actual)
            }
            Err(StoreError::Cancelled) => Err(ReconcileError::Cancelled {
                vm_id: vm_id.to_string(),
            }),
            Err(source) => Err(ReconcileError::Fetch {
                vm_id: vm_id.to_string(),
                source,
            }),
        }
    }

    async fn clean_unmanaged(
        &self,
        spec: &AttachmentsSpec,
        partition: &Partition,
        failures: &mut Vec<Failure>,
        retry: &RetryStrategy,
    ) -> Result<()> {
        if !spec.unmanaged.remove_unmanaged() {
            if !partition.unmanaged.is_empty() {
                debug!(
                    "Leaving {} unmanaged disk attachments of VM {} untouched",
                    partition.unmanaged.len(),
                    spec.vm_id
                );
            }
            return Ok(());
        }

        let destructive = spec.unmanaged.destructive();
        for attachment in &partition.unmanaged {
            if let Err(failure) = cleaner::clean(&*self.store, attachment, destructive, retry).await {
                collect(&spec.vm_id, failures, failure)?;
            }
        }

        // A surplus attachment's disk is desired, so it is only ever detached.
        for attachment in &partition.surplus {
            if let Err(failure) = cleaner::clean(&*self.store, attachment, false, retry).await {
                collect(&spec.vm_id, failures, failure)?;
            }
        }
        Ok(())
    }

    /// Bring one desired disk in line, returning its attachment ID.
    async fn converge(
        &self,
        vm_id: &str,
        disk_id: &str,
        disk_interface: DiskInterface,
        existing: Option<&Attachment>,
        retry: &RetryStrategy,
    ) -> std::result::Result<String, Failure> {
        match existing {
            Some(current) if current.disk_interface == disk_interface => {
                debug!(
                    "Disk {} already attached to VM {} via {} ({})",
                    disk_id, vm_id, disk_interface, current.id
                );
                Ok(current.id.clone())
            }
            Some(current) => {
                info!(
                    "Disk {} attached to VM {} via {}, recreating via {}",
                    disk_id, vm_id, current.disk_interface, disk_interface
                );
                detach(&*self.store, vm_id, &current.id, retry)
                    .await
                    .map_err(|e| {
                        Failure::new(Operation::Remove, e)
                            .disk(disk_id)
                            .attachment(&current.id)
                    })?;
                self.attach(vm_id, disk_id, disk_interface, retry).await
            }
            None => {
                info!(
                    "Attaching disk {} to VM {} via {}",
                    disk_id, vm_id, disk_interface
                );
                self.attach(vm_id, disk_id, disk_interface, retry).await
            }
        }
    }

    async fn attach(
        &self,
        vm_id: &str,
        disk_id: &str,
        disk_interface: DiskInterface,
        retry: &RetryStrategy,
    ) -> std::result::Result<String, Failure> {
        self.store
            .create(vm_id, disk_id, disk_interface, retry)
            .await
            .map(|attachment| attachment.id)
            .map_err(|e| Failure::new(Operation::Create, e).disk(disk_id))
    }
}

/// Record a per-entry failure. Cancellation ends the pass instead.
fn collect(vm_id: &str, failures: &mut Vec<Failure>, failure: Failure) -> Result<()> {
    if failure.cause == StoreError::Cancelled {
        warn!("Reconciliation of VM {} cancelled during {}", vm_id, failure.operation);
        return Err(ReconcileError::Cancelled {
            vm_id: vm_id.to_string(),
        });
    }
    error!("VM {}: failed to {}", vm_id, failure);
    failures.push(failure);
    Ok(())
}

#[async_trait]
impl<S> Reconciler for AttachmentsReconciler<S>
where
    S: AttachmentStore + ?Sized,
{
    type Spec = AttachmentsSpec;
    type Status = AttachmentsStatus;

    async fn reconcile(&self, spec: &Self::Spec, retry: &RetryStrategy) -> Result<Self::Status> {
        let vm_id = spec.vm_id.as_str();
        info!(
            "Reconciling {} disk attachments of VM {} (unmanaged: {:?})",
            spec.desired.len(),
            vm_id,
            spec.unmanaged
        );

        let actual = self.fetch(vm_id, retry).await?;
        let partition = Partition::of(&spec.desired, actual);
        let mut failures = Vec::new();

        self.clean_unmanaged(spec, &partition, &mut failures, retry)
            .await?;

        let mut resolved = HashMap::new();
        for (disk_id, disk_interface) in spec.desired.iter() {
            let existing = partition.matched.get(disk_id);
            match self
                .converge(vm_id, disk_id, disk_interface, existing, retry)
                .await
            {
                Ok(id) => {
                    resolved.insert(disk_id.to_string(), id);
                }
                Err(failure) => collect(vm_id, &mut failures, failure)?,
            }
        }

        let attachments = projector::project(&spec.desired, &resolved);
        if failures.is_empty() {
            info!(
                "VM {} has all {} disk attachments in place",
                vm_id,
                attachments.len()
            );
        } else {
            warn!(
                "VM {}: {} of {} disk attachments resolved, {} operations failed",
                vm_id,
                attachments.len(),
                spec.desired.len(),
                failures.len()
            );
        }

        Ok(AttachmentsStatus {
            vm_id: vm_id.to_string(),
            attachments,
            failures,
        })
    }

    async fn read(&self, status: &Self::Status, retry: &RetryStrategy) -> Result<Self::Status> {
        let actual = self.fetch(&status.vm_id, retry).await?;
        let declared = status.attachments.iter().map(|a| a.disk_id.as_str());
        let attachments = projector::refresh(declared, &actual);
        Ok(AttachmentsStatus::new(status.vm_id.clone(), attachments))
    }

    async fn finalize(&self, status: &Self::Status, retry: &RetryStrategy) -> Result<Self::Status> {
        info!(
            "Finalizing (detaching) {} disk attachments of VM {}",
            status.attachments.len(),
            status.vm_id
        );

        let mut remaining = Vec::new();
        let mut failures = Vec::new();
        for attachment in &status.attachments {
            if let Err(e) = detach(&*self.store, &status.vm_id, &attachment.id, retry).await {
                let failure = Failure::new(Operation::Remove, e)
                    .disk(&attachment.disk_id)
                    .attachment(&attachment.id);
                collect(&status.vm_id, &mut failures, failure)?;
                remaining.push(attachment.clone());
            }
        }

        Ok(AttachmentsStatus {
            vm_id: status.vm_id.clone(),
            attachments: remaining,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::DiskParams;
    use crate::store::MemoryEngine;

    async fn setup(disks: &[&str]) -> (Arc<MemoryEngine>, AttachmentsReconciler<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new());
        engine.add_vm(Some("vm1".to_string())).await;
        for disk in disks {
            engine.add_disk(DiskParams::new(512).id(*disk)).await;
        }
        let reconciler = AttachmentsReconciler::new(Arc::clone(&engine));
        (engine, reconciler)
    }

    fn spec(entries: &[(&str, DiskInterface)]) -> AttachmentsSpec {
        AttachmentsSpec::new(
            "vm1",
            DesiredSet::from_entries(entries.iter().map(|(d, i)| (*d, *i))).unwrap(),
        )
    }

    #[test]
    fn test_partition_splits_matched_surplus_unmanaged() {
        let desired = DesiredSet::from_entries([("d1", DiskInterface::Virtio)]).unwrap();
        let mk = |id: &str, disk: &str| Attachment {
            id: id.to_string(),
            vm_id: "vm1".to_string(),
            disk_id: disk.to_string(),
            disk_interface: DiskInterface::Virtio,
        };

        let partition = Partition::of(&desired, vec![mk("a1", "d1"), mk("a2", "d2"), mk("a3", "d1")]);

        assert_eq!(partition.matched["d1"].id, "a1");
        assert_eq!(partition.surplus.len(), 1);
        assert_eq!(partition.surplus[0].id, "a3");
        assert_eq!(partition.unmanaged.len(), 1);
        assert_eq!(partition.unmanaged[0].id, "a2");
    }

    #[test]
    fn test_partition_prefers_matching_interface() {
        let desired = DesiredSet::from_entries([("d1", DiskInterface::Ide)]).unwrap();
        let mk = |id: &str, disk_interface: DiskInterface| Attachment {
            id: id.to_string(),
            vm_id: "vm1".to_string(),
            disk_id: "d1".to_string(),
            disk_interface,
        };

        let partition = Partition::of(
            &desired,
            vec![
                mk("a1", DiskInterface::Virtio),
                mk("a2", DiskInterface::Ide),
                mk("a3", DiskInterface::Ide),
            ],
        );

        assert_eq!(partition.matched["d1"].id, "a2");
        let surplus: Vec<_> = partition.surplus.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(surplus, vec!["a1", "a3"]);
    }

    /// Engine with a shared disk `disk` bound to vm1 twice.
    async fn doubly_attached(
        disk: &str,
        first: DiskInterface,
        second: DiskInterface,
    ) -> (Arc<MemoryEngine>, Attachment, Attachment) {
        let engine = MemoryEngine::new();
        engine.add_vm(Some("vm1".to_string())).await;
        engine.add_disk(DiskParams::new(512).id("d1")).await;
        engine
            .add_disk(DiskParams::new(512).id(disk).shared(true))
            .await;
        let a = engine.attach("vm1", disk, first).await.unwrap();
        let mut state = engine.state().await;
        let b = Attachment {
            id: "dup".to_string(),
            disk_interface: second,
            ..a.clone()
        };
        state.attachments.push(b.clone());
        (Arc::new(MemoryEngine::from_state(state)), a, b)
    }

    #[tokio::test]
    async fn test_duplicate_with_desired_interface_is_kept() {
        let (engine, first, second) =
            doubly_attached("d2", DiskInterface::Virtio, DiskInterface::Ide).await;
        let reconciler = AttachmentsReconciler::new(Arc::clone(&engine));
        let spec = spec(&[("d2", DiskInterface::Ide)]).unmanaged(UnmanagedPolicy::Detach);

        let status = reconciler
            .reconcile(&spec, &RetryStrategy::once())
            .await
            .unwrap();

        assert!(status.is_complete());
        assert_eq!(status.attachment("d2").unwrap().id, second.id);
        let calls = engine.calls().await;
        assert!(calls.iter().all(|c| c.operation != Operation::Create));
        let removes: Vec<_> = calls
            .iter()
            .filter(|c| c.operation == Operation::Remove)
            .map(|c| c.target.clone())
            .collect();
        assert_eq!(removes, vec![first.id]);
        let live = engine.attachments("vm1").await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, second.id);
    }

    #[tokio::test]
    async fn test_destroy_shared_disk_attached_twice() {
        let (engine, _, _) =
            doubly_attached("d2", DiskInterface::Virtio, DiskInterface::Virtio).await;
        let reconciler = AttachmentsReconciler::new(Arc::clone(&engine));
        let spec = spec(&[("d1", DiskInterface::Virtio)]).unmanaged(UnmanagedPolicy::Destroy);

        let status = reconciler
            .reconcile(&spec, &RetryStrategy::once())
            .await
            .unwrap();

        assert!(status.is_complete());
        assert!(engine.disk("d2").await.is_none());
        let ops: Vec<_> = engine.calls().await.into_iter().map(|c| c.operation).collect();
        assert_eq!(
            ops,
            vec![
                Operation::List,
                Operation::ResolveDisk,
                Operation::DeleteDisk,
                Operation::ResolveDisk,
                Operation::Create,
            ]
        );
        let live = engine.attachments("vm1").await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].disk_id, "d1");
    }

    #[tokio::test]
    async fn test_creates_missing_attachments() {
        let (engine, reconciler) = setup(&["d1", "d2"]).await;
        let spec = spec(&[("d1", DiskInterface::Virtio), ("d2", DiskInterface::Ide)]);

        let status = reconciler
            .reconcile(&spec, &RetryStrategy::once())
            .await
            .unwrap();

        assert!(status.is_complete());
        assert_eq!(status.attachments.len(), 2);
        let live = engine.attachments("vm1").await;
        assert_eq!(live.len(), 2);
        for resolved in &status.attachments {
            assert!(live.iter().any(|a| a.id == resolved.id
                && a.disk_id == resolved.disk_id
                && a.disk_interface == resolved.disk_interface));
        }
    }

    #[tokio::test]
    async fn test_fetch_failure_is_fatal_and_mutation_free() {
        let (engine, reconciler) = setup(&["d1"]).await;
        engine
            .fail_next(Operation::List, None, StoreError::Transport("auth".into()))
            .await;

        let err = reconciler
            .reconcile(&spec(&[("d1", DiskInterface::Virtio)]), &RetryStrategy::once())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Fetch { .. }));
        assert_eq!(engine.calls().await.len(), 1);
        assert!(engine.attachments("vm1").await.is_empty());
    }

    #[tokio::test]
    async fn test_recreate_skipped_when_remove_fails() {
        let (engine, reconciler) = setup(&["d1", "d2"]).await;
        let old = engine.attach("vm1", "d1", DiskInterface::Virtio).await.unwrap();
        engine
            .fail_always(
                Operation::Remove,
                Some(&old.id),
                StoreError::Rejected("VM is running".into()),
            )
            .await;
        let spec = spec(&[("d1", DiskInterface::VirtioScsi), ("d2", DiskInterface::Virtio)]);

        let status = reconciler
            .reconcile(&spec, &RetryStrategy::once())
            .await
            .unwrap();

        assert_eq!(status.failures.len(), 1);
        assert_eq!(status.failures[0].operation, Operation::Remove);
        assert_eq!(status.failures[0].disk_id.as_deref(), Some("d1"));
        assert!(status.attachment("d1").is_none());
        assert!(status.attachment("d2").is_some());

        let creates: Vec<_> = engine
            .calls()
            .await
            .into_iter()
            .filter(|c| c.operation == Operation::Create)
            .map(|c| c.target)
            .collect();
        assert_eq!(creates, vec!["d2".to_string()]);
        let live = engine.attachments("vm1").await;
        assert!(live.iter().any(|a| a.id == old.id));
    }

    #[tokio::test]
    async fn test_surplus_duplicate_detached_only_with_cleanup() {
        let engine = Arc::new(MemoryEngine::new());
        engine.add_vm(Some("vm1".to_string())).await;
        engine
            .add_disk(DiskParams::new(512).id("d1").shared(true))
            .await;
        let first = engine.attach("vm1", "d1", DiskInterface::Virtio).await.unwrap();
        // Second binding of the same disk, as left behind by another tool.
        let mut state = engine.state().await;
        let mut second = first.clone();
        second.id = "dup".to_string();
        state.attachments.push(second);
        let engine = Arc::new(MemoryEngine::from_state(state));
        let reconciler = AttachmentsReconciler::new(Arc::clone(&engine));
        let spec = spec(&[("d1", DiskInterface::Virtio)]).unmanaged(UnmanagedPolicy::Destroy);

        let status = reconciler
            .reconcile(&spec, &RetryStrategy::once())
            .await
            .unwrap();

        assert!(status.is_complete());
        assert_eq!(status.attachments[0].id, first.id);
        let live = engine.attachments("vm1").await;
        assert_eq!(live.len(), 1);
        assert!(engine.disk("d1").await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_is_fatal() {
        let (engine, reconciler) = setup(&["d1"]).await;
        engine
            .fail_next(Operation::Create, Some("d1"), StoreError::Cancelled)
            .await;

        let err = reconciler
            .reconcile(&spec(&[("d1", DiskInterface::Virtio)]), &RetryStrategy::once())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Cancelled { vm_id } if vm_id == "vm1"));
    }

    #[tokio::test]
    async fn test_read_reports_drift() {
        let (engine, reconciler) = setup(&["d1", "d2"]).await;
        let status = reconciler
            .reconcile(&spec(&[("d1", DiskInterface::Virtio)]), &RetryStrategy::once())
            .await
            .unwrap();

        // Out-of-band changes: d1 re-attached as IDE, d2 attached.
        let old = status.attachments[0].id.clone();
        engine
            .remove("vm1", &old, &RetryStrategy::once())
            .await
            .unwrap();
        let d1 = engine.attach("vm1", "d1", DiskInterface::Ide).await.unwrap();
        engine.attach("vm1", "d2", DiskInterface::Sata).await.unwrap();

        let observed = reconciler
            .read(&status, &RetryStrategy::once())
            .await
            .unwrap();

        assert_eq!(observed.attachments.len(), 2);
        assert_eq!(observed.attachments[0].id, d1.id);
        assert_eq!(observed.attachments[0].disk_interface, DiskInterface::Ide);
        assert_eq!(observed.attachments[1].disk_id, "d2");
    }

    #[tokio::test]
    async fn test_finalize_detaches_declared_only() {
        let (engine, reconciler) = setup(&["d1", "d2"]).await;
        engine.attach("vm1", "d2", DiskInterface::Virtio).await.unwrap();
        let status = reconciler
            .reconcile(&spec(&[("d1", DiskInterface::Virtio)]), &RetryStrategy::once())
            .await
            .unwrap();

        let remaining = reconciler
            .finalize(&status, &RetryStrategy::once())
            .await
            .unwrap();

        assert!(remaining.attachments.is_empty());
        assert!(remaining.is_complete());
        let live = engine.attachments("vm1").await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].disk_id, "d2");
    }

    #[tokio::test]
    async fn test_finalize_keeps_failed_entries() {
        let (engine, reconciler) = setup(&["d1", "d2"]).await;
        let status = reconciler
            .reconcile(
                &spec(&[("d1", DiskInterface::Virtio), ("d2", DiskInterface::Virtio)]),
                &RetryStrategy::once(),
            )
            .await
            .unwrap();
        let d1 = status.attachment("d1").unwrap().id.clone();
        engine
            .fail_always(Operation::Remove, Some(&d1), StoreError::Transport("down".into()))
            .await;

        let remaining = reconciler
            .finalize(&status, &RetryStrategy::once())
            .await
            .unwrap();

        assert_eq!(remaining.attachments.len(), 1);
        assert_eq!(remaining.attachments[0].id, d1);
        assert_eq!(remaining.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_import_adopts_live_attachments() {
        let (engine, reconciler) = setup(&["d1", "d2"]).await;
        engine.attach("vm1", "d1", DiskInterface::Virtio).await.unwrap();
        engine.attach("vm1", "d2", DiskInterface::Ide).await.unwrap();

        let status = reconciler
            .import("vm1", &RetryStrategy::once())
            .await
            .unwrap();

        assert_eq!(status.attachments.len(), 2);
        assert_eq!(status.attachments[1].disk_interface, DiskInterface::Ide);
    }
}
