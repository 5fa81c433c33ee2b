//! Volume Device Resolver
//!
//! Maps a Cinder volume id to the local block device node. Hypervisor drivers
//! differ in what they expose, so two strategies are tried in order:
//!
//! 1. serial-id matching in `/dev/disk/by-id`, using the naming conventions of
//!    KVM virtio-blk, KVM virtio-scsi and ESXi;
//! 2. the instance metadata device list, matched to `/dev/disk/by-path` by
//!    bus and address (Hyper-V cannot override disk serials).
//!
//! Neither strategy fails: "not there yet" and I/O trouble both resolve to
//! `None` so the caller's polling loop tries again.

use crate::domain::ports::InstanceMetadataRef;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// =============================================================================
// Constants
// =============================================================================

/// Length of the volume id prefix embedded in KVM disk serials
const SERIAL_PREFIX_LEN: usize = 20;

// =============================================================================
// Resolver Configuration
// =============================================================================

/// Configuration for the device resolver
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Stable by-id device directory
    pub by_id_dir: PathBuf,
    /// Stable by-path device directory
    pub by_path_dir: PathBuf,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            by_id_dir: PathBuf::from("/dev/disk/by-id"),
            by_path_dir: PathBuf::from("/dev/disk/by-path"),
        }
    }
}

// =============================================================================
// Device Resolver
// =============================================================================

/// Resolves volume ids to local device paths
pub struct DeviceResolver {
    config: ResolverConfig,
    metadata: InstanceMetadataRef,
}

impl DeviceResolver {
    pub fn new(config: ResolverConfig, metadata: InstanceMetadataRef) -> Self {
        Self { config, metadata }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Run both strategies once, serial id first
    pub async fn resolve_once(&self, volume_id: &str) -> Option<PathBuf> {
        if let Some(path) = self.by_serial_id(volume_id) {
            return Some(path);
        }
        self.by_instance_metadata(volume_id).await
    }

    /// by-id entry names a volume may appear under, in lookup order
    pub fn candidate_names(volume_id: &str) -> Vec<String> {
        let prefix: String = volume_id.chars().take(SERIAL_PREFIX_LEN).collect();
        vec![
            // KVM virtio-blk
            format!("virtio-{}", prefix),
            // KVM virtio-scsi
            format!("scsi-0QEMU_QEMU_HARDDISK_{}", prefix),
            // ESXi
            format!("wwn-0x{}", volume_id.replace('-', "")),
        ]
    }

    /// Look the volume up by disk serial in the by-id directory
    pub fn by_serial_id(&self, volume_id: &str) -> Option<PathBuf> {
        let entries = match fs::read_dir(&self.config.by_id_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(
                    "Failed to read {}: {}",
                    self.config.by_id_dir.display(),
                    e
                );
                return None;
            }
        };

        let present: HashSet<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();

        for candidate in Self::candidate_names(volume_id) {
            if present.contains(&candidate) {
                let path = self.config.by_id_dir.join(&candidate);
                debug!(
                    "Found disk attached as {}; full device path: {}",
                    candidate,
                    path.display()
                );
                return Some(path);
            }
        }

        debug!("No by-id device found for volume {} by serial id", volume_id);
        None
    }

    /// Look the volume up through the instance metadata device list
    pub async fn by_instance_metadata(&self, volume_id: &str) -> Option<PathBuf> {
        let document = match self.metadata.fetch().await {
            Ok(document) => document,
            Err(e) => {
                debug!("Could not retrieve instance metadata: {}", e);
                return None;
            }
        };

        let device = document
            .devices
            .iter()
            .find(|d| d.device_type == "disk" && d.serial == volume_id);

        let Some(device) = device else {
            debug!("No device metadata for volume {}", volume_id);
            return None;
        };

        debug!(
            "Found disk metadata for volume {}: bus {}, address {}",
            volume_id, device.bus, device.address
        );

        let matches = glob_by_path(&self.config.by_path_dir, &device.bus, &device.address);
        match matches.as_slice() {
            [single] => Some(single.clone()),
            _ => {
                warn!(
                    "Expected one by-path device for volume {}, found {}: {:?}",
                    volume_id,
                    matches.len(),
                    matches
                );
                None
            }
        }
    }
}

/// Glob `<dir>/*-<bus>-<address>`
fn glob_by_path(dir: &Path, bus: &str, address: &str) -> Vec<PathBuf> {
    let pattern = format!(
        "{}/*-{}-{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(bus),
        glob::Pattern::escape(address)
    );

    match glob::glob(&pattern) {
        Ok(paths) => paths.filter_map(|p| p.ok()).collect(),
        Err(e) => {
            warn!("Invalid by-path pattern {}: {}", pattern, e);
            Vec::new()
        }
    }
}
