//! Declared-state document: the JSON form callers persist between passes.
//!
//! ```json
//! {
//!   "vm_id": "0b7d3e4c-1a2b-4c5d-8e9f-001122334455",
//!   "remove_unmanaged": false,
//!   "destructive": false,
//!   "attachments": [
//!     { "disk_id": "5e1c...", "disk_interface": "virtio_scsi", "id": "9f0a..." }
//!   ]
//! }
//! ```
//!
//! Strings are validated here, before anything reaches the reconcilers.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{DesiredSet, DiskInterface, ResolvedAttachment};
use crate::reconciler::attachments::{AttachmentsSpec, AttachmentsStatus};
use crate::reconciler::cleaner::UnmanagedPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub vm_id: String,
    #[serde(default)]
    pub remove_unmanaged: bool,
    #[serde(default)]
    pub destructive: bool,
    #[serde(default)]
    pub attachments: Vec<ManifestAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestAttachment {
    pub disk_id: String,
    pub disk_interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl From<&ResolvedAttachment> for ManifestAttachment {
    fn from(a: &ResolvedAttachment) -> Self {
        Self {
            disk_id: a.disk_id.clone(),
            disk_interface: a.disk_interface.to_string(),
            id: Some(a.id.clone()),
        }
    }
}

/// Accept only the canonical lowercase, hyphenated UUID form.
pub fn validate_uuid(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidUuid {
        field,
        value: value.to_string(),
    };
    let parsed = uuid::Uuid::try_parse(value).map_err(|_| invalid())?;
    if parsed.hyphenated().to_string() != value {
        return Err(invalid());
    }
    Ok(())
}

impl Manifest {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn policy(&self) -> Result<UnmanagedPolicy, ConfigError> {
        UnmanagedPolicy::from_flags(self.remove_unmanaged, self.destructive)
    }

    /// Validate and convert into a reconciliation request.
    pub fn to_spec(&self) -> Result<AttachmentsSpec, ConfigError> {
        validate_uuid("vm_id", &self.vm_id)?;
        let policy = self.policy()?;

        let mut desired = DesiredSet::new();
        for attachment in &self.attachments {
            validate_uuid("disk_id", &attachment.disk_id)?;
            let disk_interface: DiskInterface = attachment.disk_interface.parse()?;
            desired.insert(attachment.disk_id.clone(), disk_interface)?;
        }

        Ok(AttachmentsSpec::new(self.vm_id.clone(), desired).unmanaged(policy))
    }

    /// Persisted state as last recorded: entries without an ID are not
    /// attached yet and are skipped.
    pub fn to_status(&self) -> Result<AttachmentsStatus, ConfigError> {
        validate_uuid("vm_id", &self.vm_id)?;
        let mut attachments = Vec::new();
        for attachment in &self.attachments {
            let Some(id) = &attachment.id else { continue };
            attachments.push(ResolvedAttachment {
                disk_id: attachment.disk_id.clone(),
                disk_interface: attachment.disk_interface.parse()?,
                id: id.clone(),
            });
        }
        Ok(AttachmentsStatus::new(self.vm_id.clone(), attachments))
    }

    /// Write-back document for a status.
    ///
    /// Every declared entry is kept with its declared interface. Its `id` is
    /// taken from the status when the disk is bound through the declared
    /// interface and cleared otherwise, so failed, pending and drifted
    /// entries stay declared and are converged again on the next pass.
    /// Attachments of undeclared disks are not adopted.
    pub fn with_status(&self, status: &AttachmentsStatus) -> Self {
        let attachments = self
            .attachments
            .iter()
            .map(|declared| ManifestAttachment {
                id: status
                    .attachment(&declared.disk_id)
                    .filter(|a| a.disk_interface.as_str() == declared.disk_interface)
                    .map(|a| a.id.clone()),
                ..declared.clone()
            })
            .collect();

        Self {
            vm_id: self.vm_id.clone(),
            remove_unmanaged: self.remove_unmanaged,
            destructive: self.destructive,
            attachments,
        }
    }

    /// Live attachments in `status` that differ from this manifest: bound
    /// through another interface than declared, or not declared at all.
    pub fn drift<'a>(&self, status: &'a AttachmentsStatus) -> Vec<&'a ResolvedAttachment> {
        status
            .attachments
            .iter()
            .filter(|live| {
                !self.attachments.iter().any(|declared| {
                    declared.disk_id == live.disk_id
                        && declared.disk_interface == live.disk_interface.as_str()
                })
            })
            .collect()
    }

    /// Document for an imported VM.
    pub fn from_status(status: &AttachmentsStatus) -> Self {
        Self {
            vm_id: status.vm_id.clone(),
            remove_unmanaged: false,
            destructive: false,
            attachments: status.attachments.iter().map(Into::into).collect(),
        }
    }
}
