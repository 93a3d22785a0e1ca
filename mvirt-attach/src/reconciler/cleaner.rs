//! Cleanup of unmanaged attachments - attachments whose disk is not declared.

use tracing::{debug, info, warn};

use super::detach;
use crate::error::ConfigError;
use crate::model::{Attachment, Failure, Operation};
use crate::retry::RetryStrategy;
use crate::store::AttachmentStore;

/// What to do with attachments whose disk is not in the desired set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmanagedPolicy {
    /// Leave them attached and out of the diff.
    #[default]
    Ignore,
    /// Detach them; the disks survive.
    Detach,
    /// Delete their disks. Irreversible.
    Destroy,
}

impl UnmanagedPolicy {
    /// Map the `remove_unmanaged` / `destructive` flag pair.
    pub fn from_flags(remove_unmanaged: bool, destructive: bool) -> Result<Self, ConfigError> {
        match (remove_unmanaged, destructive) {
            (false, false) => Ok(UnmanagedPolicy::Ignore),
            (false, true) => Err(ConfigError::DestructiveWithoutRemoveUnmanaged),
            (true, false) => Ok(UnmanagedPolicy::Detach),
            (true, true) => Ok(UnmanagedPolicy::Destroy),
        }
    }

    pub fn remove_unmanaged(&self) -> bool {
        *self != UnmanagedPolicy::Ignore
    }

    pub fn destructive(&self) -> bool {
        *self == UnmanagedPolicy::Destroy
    }
}

/// Eliminate one unmanaged attachment.
///
/// Non-destructive cleanup detaches. Destructive cleanup resolves the disk
/// and deletes it; a disk that is already gone counts as deleted. If the
/// disk cannot be resolved it stays attached and the failure is returned.
pub async fn clean<S>(
    store: &S,
    attachment: &Attachment,
    destructive: bool,
    retry: &RetryStrategy,
) -> Result<(), Failure>
where
    S: AttachmentStore + ?Sized,
{
    if !destructive {
        info!(
            "Detaching unmanaged disk {} from VM {} ({})",
            attachment.disk_id, attachment.vm_id, attachment.id
        );
        return detach(store, &attachment.vm_id, &attachment.id, retry)
            .await
            .map_err(|e| {
                Failure::new(Operation::Remove, e)
                    .disk(&attachment.disk_id)
                    .attachment(&attachment.id)
            });
    }

    let disk = match store.resolve_disk(attachment, retry).await {
        Ok(disk) => disk,
        // Disk already deleted, e.g. through another attachment of a shared disk.
        Err(e) if e.is_not_found() => {
            debug!(
                "Disk {} of unmanaged attachment {} already removed",
                attachment.disk_id, attachment.id
            );
            return Ok(());
        }
        Err(e) => {
            warn!(
                "Cannot resolve disk of unmanaged attachment {}: {}",
                attachment.id, e
            );
            return Err(Failure::new(Operation::ResolveDisk, e)
                .disk(&attachment.disk_id)
                .attachment(&attachment.id));
        }
    };

    info!(
        "Deleting unmanaged disk {} attached to VM {} ({})",
        disk.id, attachment.vm_id, attachment.id
    );
    match store.delete_disk(&disk, retry).await {
        Err(e) if !e.is_not_found() => Err(Failure::new(Operation::DeleteDisk, e)
            .disk(&disk.id)
            .attachment(&attachment.id)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::model::DiskInterface;
    use crate::store::memory::DiskParams;
    use crate::store::MemoryEngine;

    async fn setup() -> (MemoryEngine, Attachment) {
        let engine = MemoryEngine::new();
        engine.add_vm(Some("vm1".to_string())).await;
        engine.add_disk(DiskParams::new(512).id("d2")).await;
        let attachment = engine
            .attach("vm1", "d2", DiskInterface::Virtio)
            .await
            .unwrap();
        (engine, attachment)
    }

    #[test]
    fn test_policy_from_flags() {
        assert_eq!(
            UnmanagedPolicy::from_flags(false, false).unwrap(),
            UnmanagedPolicy::Ignore
        );
        assert_eq!(
            UnmanagedPolicy::from_flags(true, false).unwrap(),
            UnmanagedPolicy::Detach
        );
        assert_eq!(
            UnmanagedPolicy::from_flags(true, true).unwrap(),
            UnmanagedPolicy::Destroy
        );
        assert!(matches!(
            UnmanagedPolicy::from_flags(false, true),
            Err(ConfigError::DestructiveWithoutRemoveUnmanaged)
        ));
    }

    #[tokio::test]
    async fn test_detach_keeps_disk() {
        let (engine, attachment) = setup().await;

        clean(&engine, &attachment, false, &RetryStrategy::once())
            .await
            .unwrap();

        assert!(engine.attachments("vm1").await.is_empty());
        assert!(engine.disk("d2").await.is_some());
    }

    #[tokio::test]
    async fn test_destroy_deletes_disk() {
        let (engine, attachment) = setup().await;

        clean(&engine, &attachment, true, &RetryStrategy::once())
            .await
            .unwrap();

        assert!(engine.attachments("vm1").await.is_empty());
        assert!(engine.disk("d2").await.is_none());

        let ops: Vec<_> = engine.calls().await.into_iter().map(|c| c.operation).collect();
        assert_eq!(ops, vec![Operation::ResolveDisk, Operation::DeleteDisk]);
    }

    #[tokio::test]
    async fn test_resolve_failure_leaves_disk_attached() {
        let (engine, attachment) = setup().await;
        engine
            .fail_next(
                Operation::ResolveDisk,
                Some(&attachment.id),
                StoreError::Transport("timeout".into()),
            )
            .await;

        let failure = clean(&engine, &attachment, true, &RetryStrategy::once())
            .await
            .unwrap_err();

        assert_eq!(failure.operation, Operation::ResolveDisk);
        assert_eq!(failure.disk_id.as_deref(), Some("d2"));
        assert_eq!(engine.attachments("vm1").await.len(), 1);
        assert!(engine.disk("d2").await.is_some());
    }

    #[tokio::test]
    async fn test_destroy_disk_already_gone_is_success() {
        let (engine, attachment) = setup().await;
        let disk = engine.disk("d2").await.unwrap();
        engine
            .delete_disk(&disk, &RetryStrategy::once())
            .await
            .unwrap();
        engine.clear_calls().await;

        clean(&engine, &attachment, true, &RetryStrategy::once())
            .await
            .unwrap();

        let ops: Vec<_> = engine.calls().await.into_iter().map(|c| c.operation).collect();
        assert_eq!(ops, vec![Operation::ResolveDisk]);
    }

    #[tokio::test]
    async fn test_detach_already_gone_is_success() {
        let (engine, attachment) = setup().await;
        engine
            .remove("vm1", &attachment.id, &RetryStrategy::once())
            .await
            .unwrap();

        clean(&engine, &attachment, false, &RetryStrategy::once())
            .await
            .unwrap();
    }
}
