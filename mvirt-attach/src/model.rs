//! Domain types: attachments, disks and the desired attachment set.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StoreError};

/// Bus a disk is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskInterface {
    Ide,
    Sata,
    SpaprVscsi,
    Virtio,
    VirtioScsi,
}

impl DiskInterface {
    pub const ALL: [DiskInterface; 5] = [
        DiskInterface::Ide,
        DiskInterface::Sata,
        DiskInterface::SpaprVscsi,
        DiskInterface::Virtio,
        DiskInterface::VirtioScsi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskInterface::Ide => "ide",
            DiskInterface::Sata => "sata",
            DiskInterface::SpaprVscsi => "spapr_vscsi",
            DiskInterface::Virtio => "virtio",
            DiskInterface::VirtioScsi => "virtio_scsi",
        }
    }

    fn allowed() -> String {
        Self::ALL
            .iter()
            .map(|i| i.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for DiskInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskInterface {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| ConfigError::InvalidDiskInterface {
                value: s.to_string(),
                allowed: Self::allowed(),
            })
    }
}

/// On-disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Cow,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Raw => write!(f, "raw"),
            ImageFormat::Cow => write!(f, "cow"),
        }
    }
}

impl FromStr for ImageFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(ImageFormat::Raw),
            "cow" => Ok(ImageFormat::Cow),
            other => Err(ConfigError::InvalidImageFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskStatus {
    Ok,
    Locked,
    Illegal,
}

/// A disk as known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub id: String,
    pub alias: Option<String>,
    pub format: ImageFormat,
    pub size: u64,
    /// Shared disks may be attached to more than one VM.
    pub shared: bool,
    pub status: DiskStatus,
    pub created_at: DateTime<Utc>,
}

/// A live binding between a VM and a disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub vm_id: String,
    pub disk_id: String,
    pub disk_interface: DiskInterface,
}

/// Declared target: disk ID to interface, unique by disk.
///
/// Iteration is ordered by disk ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredSet {
    entries: BTreeMap<String, DiskInterface>,
}

impl DesiredSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, rejecting a disk declared twice.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, DiskInterface)>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for (disk_id, interface) in entries {
            set.insert(disk_id.into(), interface)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, disk_id: String, interface: DiskInterface) -> Result<(), ConfigError> {
        if self.entries.contains_key(&disk_id) {
            return Err(ConfigError::DuplicateDisk(disk_id));
        }
        self.entries.insert(disk_id, interface);
        Ok(())
    }

    pub fn contains(&self, disk_id: &str) -> bool {
        self.entries.contains_key(disk_id)
    }

    pub fn get(&self, disk_id: &str) -> Option<DiskInterface> {
        self.entries.get(disk_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DiskInterface)> {
        self.entries.iter().map(|(d, i)| (d.as_str(), *i))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Persisted form of one attachment: `{disk_id, disk_interface, id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAttachment {
    pub disk_id: String,
    pub disk_interface: DiskInterface,
    pub id: String,
}

impl From<&Attachment> for ResolvedAttachment {
    fn from(a: &Attachment) -> Self {
        ResolvedAttachment {
            disk_id: a.disk_id.clone(),
            disk_interface: a.disk_interface,
            id: a.id.clone(),
        }
    }
}

/// Remote operation a failure was raised by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    List,
    Get,
    Create,
    Remove,
    ResolveDisk,
    DeleteDisk,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::List => write!(f, "list disk attachments"),
            Operation::Get => write!(f, "get disk attachment"),
            Operation::Create => write!(f, "create disk attachment"),
            Operation::Remove => write!(f, "remove disk attachment"),
            Operation::ResolveDisk => write!(f, "get disk for disk attachment"),
            Operation::DeleteDisk => write!(f, "remove disk"),
        }
    }
}

/// A non-fatal, per-entry failure collected during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub disk_id: Option<String>,
    pub attachment_id: Option<String>,
    pub operation: Operation,
    pub cause: StoreError,
}

impl Failure {
    pub fn new(operation: Operation, cause: StoreError) -> Self {
        Self {
            disk_id: None,
            attachment_id: None,
            operation,
            cause,
        }
    }

    pub fn disk(mut self, disk_id: impl Into<String>) -> Self {
        self.disk_id = Some(disk_id.into());
        self
    }

    pub fn attachment(mut self, attachment_id: impl Into<String>) -> Self {
        self.attachment_id = Some(attachment_id.into());
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        if let Some(id) = &self.attachment_id {
            write!(f, " {}", id)?;
        }
        if let Some(disk) = &self.disk_id {
            write!(f, " (disk {})", disk)?;
        }
        write!(f, ": {}", self.cause)
    }
}
