//! Cinder CSI Node Driver
//!
//! Attaches OpenStack Cinder volumes to the compute instance a workload runs
//! on, finds the resulting block device, and formats and mounts it for the
//! container orchestrator.
//!
//! # Architecture
//!
//! ```text
//! REST API (axum)
//!   └── CinderDriver
//!         ├── AttachmentManager ── VolumeRegistry (Cinder + Nova, or memory)
//!         │     └── DeviceResolver ── /dev/disk/by-id, then metadata + by-path
//!         ├── MountOrchestrator ── MountProvider (mount, blkid, mkfs, rescan)
//!         └── NodeIdentity ─────── instance-id file, metadata service
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Volume registry, attachment state machine, driver and API
//! - [`node`]: Device discovery, mounts and node identity
//! - [`domain`]: Core domain types and ports
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod node;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, AttachmentConfig, AttachmentManager, CinderDriver,
    DriverConfig, InMemoryRegistry, OpenStackConfig, OpenStackRegistry, RegistryFactory,
    RegistryKind, StepBackoff,
};

pub use domain::ports::{
    CreateVolumeRequest, DeviceScanner, DiskFormat, Exec, Formatter, InstanceMetadata,
    MountTable, Mounter, Volume, VolumeCapability, VolumeRegistry, VolumeStatus,
};

pub use error::{Error, ErrorKind, Result};

pub use metrics::DriverMetrics;

pub use node::{
    DeviceResolver, HttpMetadataService, MetadataConfig, MountOrchestrator, MountProvider,
    NodeConfig, NodeIdentity, NodeInfo, PublishRequest, ResolverConfig, ScanConfig,
    StageRequest,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
