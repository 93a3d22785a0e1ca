//! Simulated engine: VMs, disks and attachments held in memory.
//!
//! Enforces the engine's attachment rules (a non-shared disk is attached to
//! at most one VM, a disk is attached at most once per VM, locked disks
//! cannot be attached). Every remote attempt is recorded and faults can be
//! injected per operation and target.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::AttachmentStore;
use crate::error::{StoreError, StoreResult};
use crate::model::{Attachment, Disk, DiskInterface, DiskStatus, ImageFormat, Operation};
use crate::retry::RetryStrategy;

/// Persistable engine contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    pub vms: BTreeSet<String>,
    pub disks: BTreeMap<String, Disk>,
    /// All attachments in creation order.
    pub attachments: Vec<Attachment>,
}

/// A recorded remote attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    /// VM ID for list, disk ID for create and delete_disk, attachment ID
    /// otherwise.
    pub target: String,
}

#[derive(Debug)]
struct Fault {
    operation: Operation,
    target: Option<String>,
    error: StoreError,
    /// `None` fires forever.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    state: EngineState,
    faults: Vec<Fault>,
    calls: Vec<Call>,
}

/// Parameters for a new disk.
#[derive(Debug, Clone)]
pub struct DiskParams {
    id: Option<String>,
    alias: Option<String>,
    format: ImageFormat,
    size: u64,
    shared: bool,
}

impl DiskParams {
    pub fn new(size: u64) -> Self {
        Self {
            id: None,
            alias: None,
            format: ImageFormat::Raw,
            size,
            shared: false,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }
}

/// In-memory [`AttachmentStore`].
#[derive(Debug, Default)]
pub struct MemoryEngine {
    inner: Mutex<Inner>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: EngineState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                ..Default::default()
            }),
        }
    }

    /// Load engine contents from a JSON file. A missing file yields an empty
    /// engine.
    pub async fn load(path: &Path) -> io::Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let state: EngineState = serde_json::from_slice(&bytes)?;
                debug!(
                    "Loaded engine state from {}: {} VMs, {} disks, {} attachments",
                    path.display(),
                    state.vms.len(),
                    state.disks.len(),
                    state.attachments.len()
                );
                Ok(Self::from_state(state))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e),
        }
    }

    /// Write engine contents to a JSON file.
    pub async fn save(&self, path: &Path) -> io::Result<()> {
        let state = self.state().await;
        let json = serde_json::to_vec_pretty(&state)?;
        tokio::fs::write(path, json).await
    }

    pub async fn state(&self) -> EngineState {
        self.inner.lock().await.state.clone()
    }

    /// Register a VM, generating an ID if none is given.
    pub async fn add_vm(&self, id: Option<String>) -> String {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.inner.lock().await.state.vms.insert(id.clone());
        info!("Added VM {}", id);
        id
    }

    pub async fn add_disk(&self, params: DiskParams) -> Disk {
        let disk = Disk {
            id: params
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            alias: params.alias,
            format: params.format,
            size: params.size,
            shared: params.shared,
            status: DiskStatus::Ok,
            created_at: Utc::now(),
        };
        self.inner
            .lock()
            .await
            .state
            .disks
            .insert(disk.id.clone(), disk.clone());
        info!("Added disk {} ({} bytes, {})", disk.id, disk.size, disk.format);
        disk
    }

    pub async fn set_disk_status(&self, disk_id: &str, status: DiskStatus) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let disk = inner
            .state
            .disks
            .get_mut(disk_id)
            .ok_or_else(|| StoreError::NotFound(format!("disk {}", disk_id)))?;
        disk.status = status;
        Ok(())
    }

    /// Attach out of band: not recorded, not subject to faults.
    pub async fn attach(
        &self,
        vm_id: &str,
        disk_id: &str,
        disk_interface: DiskInterface,
    ) -> StoreResult<Attachment> {
        let mut inner = self.inner.lock().await;
        attach(&mut inner.state, vm_id, disk_id, disk_interface)
    }

    pub async fn attachments(&self, vm_id: &str) -> Vec<Attachment> {
        let inner = self.inner.lock().await;
        attachments_of(&inner.state, vm_id)
    }

    pub async fn disk(&self, disk_id: &str) -> Option<Disk> {
        self.inner.lock().await.state.disks.get(disk_id).cloned()
    }

    /// Fail the next attempt of `operation` (on `target`, if given).
    pub async fn fail_next(&self, operation: Operation, target: Option<&str>, error: StoreError) {
        self.inject(operation, target, error, Some(1)).await;
    }

    /// Fail every attempt of `operation` (on `target`, if given).
    pub async fn fail_always(&self, operation: Operation, target: Option<&str>, error: StoreError) {
        self.inject(operation, target, error, None).await;
    }

    async fn inject(
        &self,
        operation: Operation,
        target: Option<&str>,
        error: StoreError,
        remaining: Option<usize>,
    ) {
        self.inner.lock().await.faults.push(Fault {
            operation,
            target: target.map(str::to_string),
            error,
            remaining,
        });
    }

    /// Attempts recorded so far.
    pub async fn calls(&self) -> Vec<Call> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Record an attempt and fire a matching fault, if any.
    async fn begin(&self, operation: Operation, target: &str) -> StoreResult<MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(Call {
            operation,
            target: target.to_string(),
        });

        let pos = inner.faults.iter().position(|f| {
            f.operation == operation && f.target.as_deref().map_or(true, |t| t == target)
        });
        if let Some(pos) = pos {
            let error = inner.faults[pos].error.clone();
            let exhausted = match inner.faults[pos].remaining.as_mut() {
                Some(n) => {
                    *n = n.saturating_sub(1);
                    *n == 0
                }
                None => false,
            };
            if exhausted {
                inner.faults.remove(pos);
            }
            debug!("Injected fault on {} {}: {}", operation, target, error);
            return Err(error);
        }
        Ok(inner)
    }

    async fn list_once(&self, vm_id: &str) -> StoreResult<Vec<Attachment>> {
        let inner = self.begin(Operation::List, vm_id).await?;
        if !inner.state.vms.contains(vm_id) {
            return Err(StoreError::NotFound(format!("VM {}", vm_id)));
        }
        Ok(attachments_of(&inner.state, vm_id))
    }

    async fn get_once(&self, vm_id: &str, attachment_id: &str) -> StoreResult<Attachment> {
        let inner = self.begin(Operation::Get, attachment_id).await?;
        inner
            .state
            .attachments
            .iter()
            .find(|a| a.vm_id == vm_id && a.id == attachment_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("disk attachment {}", attachment_id)))
    }

    async fn create_once(
        &self,
        vm_id: &str,
        disk_id: &str,
        disk_interface: DiskInterface,
    ) -> StoreResult<Attachment> {
        let mut inner = self.begin(Operation::Create, disk_id).await?;
        attach(&mut inner.state, vm_id, disk_id, disk_interface)
    }

    async fn remove_once(&self, vm_id: &str, attachment_id: &str) -> StoreResult<()> {
        let mut inner = self.begin(Operation::Remove, attachment_id).await?;
        let pos = inner
            .state
            .attachments
            .iter()
            .position(|a| a.vm_id == vm_id && a.id == attachment_id)
            .ok_or_else(|| StoreError::NotFound(format!("disk attachment {}", attachment_id)))?;
        let removed = inner.state.attachments.remove(pos);
        debug!("Detached disk {} from VM {}", removed.disk_id, vm_id);
        Ok(())
    }

    async fn resolve_disk_once(&self, attachment: &Attachment) -> StoreResult<Disk> {
        let inner = self.begin(Operation::ResolveDisk, &attachment.id).await?;
        inner
            .state
            .disks
            .get(&attachment.disk_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("disk {}", attachment.disk_id)))
    }

    async fn delete_disk_once(&self, disk_id: &str) -> StoreResult<()> {
        let mut inner = self.begin(Operation::DeleteDisk, disk_id).await?;
        let status = inner
            .state
            .disks
            .get(disk_id)
            .map(|d| d.status)
            .ok_or_else(|| StoreError::NotFound(format!("disk {}", disk_id)))?;
        if status == DiskStatus::Locked {
            return Err(StoreError::Rejected(format!("disk {} is locked", disk_id)));
        }
        inner.state.attachments.retain(|a| a.disk_id != disk_id);
        inner.state.disks.remove(disk_id);
        debug!("Deleted disk {}", disk_id);
        Ok(())
    }
}

fn attachments_of(state: &EngineState, vm_id: &str) -> Vec<Attachment> {
    state
        .attachments
        .iter()
        .filter(|a| a.vm_id == vm_id)
        .cloned()
        .collect()
}

fn attach(
    state: &mut EngineState,
    vm_id: &str,
    disk_id: &str,
    disk_interface: DiskInterface,
) -> StoreResult<Attachment> {
    if !state.vms.contains(vm_id) {
        return Err(StoreError::NotFound(format!("VM {}", vm_id)));
    }
    let disk = state
        .disks
        .get(disk_id)
        .ok_or_else(|| StoreError::NotFound(format!("disk {}", disk_id)))?;
    if disk.status != DiskStatus::Ok {
        return Err(StoreError::Rejected(format!(
            "disk {} is {:?}",
            disk_id, disk.status
        )));
    }

    for existing in state.attachments.iter().filter(|a| a.disk_id == disk_id) {
        if existing.vm_id == vm_id {
            return Err(StoreError::Conflict(format!(
                "disk {} is already attached to VM {}",
                disk_id, vm_id
            )));
        }
        if !disk.shared {
            return Err(StoreError::Conflict(format!(
                "disk {} is attached to VM {} and not shared",
                disk_id, existing.vm_id
            )));
        }
    }

    let attachment = Attachment {
        id: uuid::Uuid::new_v4().to_string(),
        vm_id: vm_id.to_string(),
        disk_id: disk_id.to_string(),
        disk_interface,
    };
    state.attachments.push(attachment.clone());
    debug!(
        "Attached disk {} to VM {} via {} ({})",
        disk_id, vm_id, disk_interface, attachment.id
    );
    Ok(attachment)
}

#[async_trait]
impl AttachmentStore for MemoryEngine {
    async fn list(&self, vm_id: &str, retry: &RetryStrategy) -> StoreResult<Vec<Attachment>> {
        retry
            .run("list disk attachments", move || async move {
                self.list_once(vm_id).await
            })
            .await
    }

    async fn get(
        &self,
        vm_id: &str,
        attachment_id: &str,
        retry: &RetryStrategy,
    ) -> StoreResult<Attachment> {
        retry
            .run("get disk attachment", move || async move {
                self.get_once(vm_id, attachment_id).await
            })
            .await
    }

    async fn create(
        &self,
        vm_id: &str,
        disk_id: &str,
        disk_interface: DiskInterface,
        retry: &RetryStrategy,
    ) -> StoreResult<Attachment> {
        retry
            .run("create disk attachment", move || async move {
                self.create_once(vm_id, disk_id, disk_interface).await
            })
            .await
    }

    async fn remove(
        &self,
        vm_id: &str,
        attachment_id: &str,
        retry: &RetryStrategy,
    ) -> StoreResult<()> {
        retry
            .run("remove disk attachment", move || async move {
                self.remove_once(vm_id, attachment_id).await
            })
            .await
    }

    async fn resolve_disk(
        &self,
        attachment: &Attachment,
        retry: &RetryStrategy,
    ) -> StoreResult<Disk> {
        retry
            .run("get disk", move || async move {
                self.resolve_disk_once(attachment).await
            })
            .await
    }

    async fn delete_disk(&self, disk: &Disk, retry: &RetryStrategy) -> StoreResult<()> {
        let disk_id = disk.id.as_str();
        retry
            .run("remove disk", move || async move {
                self.delete_disk_once(disk_id).await
            })
            .await
    }
}
