//! Mount Orchestrator
//!
//! Per volume on this node: `unstaged -> staged -> published -> staged ->
//! unstaged`. Stage formats and mounts the device to a private staging path;
//! publish bind-mounts the staging path into the workload's directory.

use super::MountProvider;
use crate::domain::ports::{DiskFormat, VolumeCapability};
use crate::error::{Error, Result};
use crate::node::discovery::{wait_for_device, ScanConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Publish-context key carrying the device handle produced by attach
pub const DEVICE_PATH_KEY: &str = "DevicePath";

/// Filesystem used when the capability does not name one
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Mode for staging and target directories created on demand
const TARGET_DIR_MODE: u32 = 0o750;

// =============================================================================
// Requests
// =============================================================================

/// Request to stage a volume on this node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRequest {
    pub volume_id: String,
    pub staging_path: String,
    #[serde(default)]
    pub capability: VolumeCapability,
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,
}

/// Request to publish a staged volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub staging_path: String,
    pub target_path: String,
    #[serde(default)]
    pub read_only: bool,
}

// =============================================================================
// Mount Orchestrator
// =============================================================================

/// Drives stage/publish and their inverses against the local OS
pub struct MountOrchestrator {
    provider: MountProvider,
    scan: ScanConfig,
}

impl MountOrchestrator {
    pub fn new(provider: MountProvider, scan: ScanConfig) -> Self {
        Self { provider, scan }
    }

    /// Format (if needed) and mount the attached device on the staging path
    pub async fn stage(&self, request: &StageRequest, cancel: &CancellationToken) -> Result<()> {
        debug!("Stage called with {:?}", request);

        if request.staging_path.is_empty() {
            return Err(Error::InvalidArgument("staging target not provided".into()));
        }
        let device = request
            .publish_context
            .get(DEVICE_PATH_KEY)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::InvalidArgument("device path not provided".into()))?;

        let (fs_type, options) = match &request.capability {
            VolumeCapability::Block => {
                return Err(Error::Unimplemented(
                    "block volume support is not yet implemented".into(),
                ));
            }
            VolumeCapability::Mount {
                fs_type,
                mount_flags,
            } => {
                let fs_type = if fs_type.is_empty() {
                    DEFAULT_FS_TYPE
                } else {
                    fs_type.as_str()
                };
                (fs_type, mount_flags.clone())
            }
        };

        wait_for_device(self.provider.scanner.as_ref(), device, &self.scan, cancel).await?;

        let staging = Path::new(&request.staging_path);
        if self.prepare_target(staging).await? {
            info!(
                "Volume {} already staged at {}",
                request.volume_id, request.staging_path
            );
            return Ok(());
        }

        self.format_and_mount(device, staging, fs_type, &options)
            .await?;
        info!(
            "Staged volume {} ({}) at {}",
            request.volume_id, device, request.staging_path
        );
        Ok(())
    }

    /// Bind-mount the staging path onto the target path
    pub async fn publish(&self, request: &PublishRequest) -> Result<()> {
        debug!("Publish called with {:?}", request);

        if request.staging_path.is_empty() || request.target_path.is_empty() {
            return Err(Error::InvalidArgument(
                "staging and target paths are required".into(),
            ));
        }

        let target = Path::new(&request.target_path);
        if self.prepare_target(target).await? {
            debug!("{} is already a mount point", request.target_path);
            return Ok(());
        }

        let options = vec![
            "bind".to_string(),
            if request.read_only { "ro" } else { "rw" }.to_string(),
        ];
        self.provider
            .mounter
            .mount(&request.staging_path, target, "", &options)
            .await?;

        info!(
            "Published {} at {} ({})",
            request.staging_path, request.target_path, options[1]
        );
        Ok(())
    }

    /// Undo a publish; `NotFound` when the target is not mounted
    pub async fn unpublish(&self, target_path: &str) -> Result<()> {
        self.unmount_path(target_path).await?;
        info!("Unpublished {}", target_path);
        Ok(())
    }

    /// Undo a stage; `NotFound` when the staging path is not mounted
    pub async fn unstage(&self, staging_path: &str) -> Result<()> {
        self.unmount_path(staging_path).await?;
        info!("Unstaged {}", staging_path);
        Ok(())
    }

    /// Create `path` if missing and report whether it is already mounted
    async fn prepare_target(&self, path: &Path) -> Result<bool> {
        match self.provider.mount_table.is_mount_point(path).await {
            Ok(mounted) => Ok(mounted),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(TARGET_DIR_MODE)
                    .create(path)
                    .await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Unmount `path` and remove the directory
    async fn unmount_path(&self, path_str: &str) -> Result<()> {
        if path_str.is_empty() {
            return Err(Error::InvalidArgument("target path not provided".into()));
        }
        let path = Path::new(path_str);

        let mounted = match self.provider.mount_table.is_mount_point(path).await {
            Ok(mounted) => mounted,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::PathNotFound {
                    path: path_str.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        if !mounted {
            return Err(Error::NotMounted {
                path: path_str.to_string(),
            });
        }

        self.provider.mounter.unmount(path).await?;

        match tokio::fs::remove_dir(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to remove {} after unmount: {}", path_str, e);
                Err(e.into())
            }
        }
    }

    /// Probe the device, format it when blank, then mount it
    pub async fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let mount_fs = match self.provider.formatter.disk_format(device).await? {
            DiskFormat::Unformatted => {
                info!("Disk {} is unformatted, creating {}", device, fs_type);
                self.provider.formatter.format(device, fs_type).await?;
                fs_type.to_string()
            }
            DiskFormat::Filesystem(existing) => {
                if existing != fs_type {
                    warn!(
                        "Disk {} already carries {}, requested {}; mounting as {}",
                        device, existing, fs_type, existing
                    );
                }
                existing
            }
            DiskFormat::Partitioned(table) => {
                debug!("Disk {} has a {} partition table", device, table);
                return Err(Error::PartitionedDevice {
                    device: device.to_string(),
                });
            }
        };

        self.provider
            .mounter
            .mount(device, target, &mount_fs, options)
            .await
    }
}
