//! Domain Ports - Core types and trait definitions for the node driver
//!
//! These traits define the boundaries between the attach/mount core and the
//! systems it drives: the cloud volume registry, the instance metadata service,
//! and the local operating system.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Volume
// =============================================================================

/// Status of a cloud volume
///
/// Statuses other than the four the driver reasons about are kept verbatim in
/// [`VolumeStatus::Other`] and treated as transient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VolumeStatus {
    Available,
    InUse,
    Deleted,
    Error,
    Other(String),
}

impl VolumeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            VolumeStatus::Available => "available",
            VolumeStatus::InUse => "in-use",
            VolumeStatus::Deleted => "deleted",
            VolumeStatus::Error => "error",
            VolumeStatus::Other(s) => s,
        }
    }
}

impl From<&str> for VolumeStatus {
    fn from(s: &str) -> Self {
        match s {
            "available" => VolumeStatus::Available,
            "in-use" => VolumeStatus::InUse,
            "deleted" => VolumeStatus::Deleted,
            "error" => VolumeStatus::Error,
            other => VolumeStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for VolumeStatus {
    fn from(s: String) -> Self {
        VolumeStatus::from(s.as_str())
    }
}

impl From<VolumeStatus> for String {
    fn from(status: VolumeStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of cloud block storage, as last reported by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Opaque identifier, stable for the volume's lifetime
    pub id: String,
    /// Human-readable name, not unique
    pub name: String,
    /// Current status
    pub status: VolumeStatus,
    /// Capacity in GiB
    pub size_gib: u64,
    /// Placement domain
    pub availability_zone: String,
    /// Instance holding the attachment, empty when unattached
    pub attached_server_id: String,
    /// Device path as reported by the cloud side (often unreliable)
    pub attached_device: String,
}

impl Volume {
    /// Whether any instance holds an attachment
    pub fn is_attached(&self) -> bool {
        !self.attached_server_id.is_empty()
    }

    /// Whether the attachment is held by `instance_id`
    pub fn is_attached_to(&self, instance_id: &str) -> bool {
        !instance_id.is_empty() && self.attached_server_id == instance_id
    }
}

/// Request to create a volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: String,
    pub size_gib: u64,
    #[serde(default)]
    pub volume_type: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

// =============================================================================
// Volume Registry Port
// =============================================================================

/// Port for the cloud block-storage control plane
///
/// `attach` and `detach` return once the request is accepted; completion is
/// observed by re-fetching the volume.
#[async_trait]
pub trait VolumeRegistry: Send + Sync {
    /// Create a volume
    async fn create(&self, request: &CreateVolumeRequest) -> Result<Volume>;

    /// Fetch a volume, `Error::VolumeNotFound` if the id is unknown
    async fn get(&self, volume_id: &str) -> Result<Volume>;

    /// List volumes, optionally filtered by exact name
    async fn list(&self, name_filter: Option<&str>) -> Result<Vec<Volume>>;

    /// Delete a volume
    async fn delete(&self, volume_id: &str) -> Result<()>;

    /// Request attachment of a volume to an instance
    async fn attach(&self, instance_id: &str, volume_id: &str) -> Result<()>;

    /// Request detachment of a volume from an instance
    async fn detach(&self, instance_id: &str, volume_id: &str) -> Result<()>;

    /// Backend name for logs and health reporting
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Instance Metadata Port
// =============================================================================

/// Device entry in the instance metadata document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub bus: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub serial: String,
}

/// Subset of the OpenStack `meta_data.json` the driver consumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadataDocument {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub availability_zone: String,
    #[serde(default)]
    pub devices: Vec<DeviceMetadata>,
}

/// Port for the node-local instance metadata service
#[async_trait]
pub trait InstanceMetadata: Send + Sync {
    /// Fetch the current metadata document, uncached
    async fn fetch(&self) -> Result<InstanceMetadataDocument>;
}

// =============================================================================
// Local OS Ports
// =============================================================================

/// Output of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external utilities
///
/// A non-zero exit is not an error at this layer; callers interpret the code.
#[async_trait]
pub trait Exec: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Queries the local mount table
#[async_trait]
pub trait MountTable: Send + Sync {
    /// Whether `path` is likely a mount point; an `io::ErrorKind::NotFound`
    /// error is returned when the path does not exist
    async fn is_mount_point(&self, path: &Path) -> Result<bool>;
}

/// Mounts and unmounts filesystems
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `source` on `target`; an empty `fs_type` with a `bind` option
    /// performs a bind mount
    async fn mount(&self, source: &str, target: &Path, fs_type: &str, options: &[String])
        -> Result<()>;

    /// Unmount `target`
    async fn unmount(&self, target: &Path) -> Result<()>;
}

/// Existing signature found on a raw device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskFormat {
    /// No filesystem or partition table signature
    Unformatted,
    /// Carries a filesystem of the given type
    Filesystem(String),
    /// Carries a partition table; must never be formatted
    Partitioned(String),
}

/// Probes and creates filesystems
#[async_trait]
pub trait Formatter: Send + Sync {
    async fn disk_format(&self, device: &str) -> Result<DiskFormat>;

    async fn format(&self, device: &str, fs_type: &str) -> Result<()>;
}

/// Observes and nudges the local block device tree
#[async_trait]
pub trait DeviceScanner: Send + Sync {
    /// Whether the device node exists
    async fn exists(&self, device: &str) -> bool;

    /// Trigger a bus rescan so newly attached disks show up
    async fn rescan(&self) -> Result<()>;
}

// =============================================================================
// Volume Capability
// =============================================================================

/// Access type requested for a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "accessType")]
pub enum VolumeCapability {
    /// Filesystem access
    #[serde(rename_all = "camelCase")]
    Mount {
        #[serde(default)]
        fs_type: String,
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    /// Raw block access
    Block,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        VolumeCapability::Mount {
            fs_type: String::new(),
            mount_flags: Vec::new(),
        }
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeRegistryRef = Arc<dyn VolumeRegistry>;
pub type InstanceMetadataRef = Arc<dyn InstanceMetadata>;
pub type ExecRef = Arc<dyn Exec>;
pub type MountTableRef = Arc<dyn MountTable>;
pub type MounterRef = Arc<dyn Mounter>;
pub type FormatterRef = Arc<dyn Formatter>;
pub type DeviceScannerRef = Arc<dyn DeviceScanner>;
