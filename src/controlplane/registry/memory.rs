//! In-Memory Volume Registry
//!
//! Mirrors the Cinder/Nova contract closely enough for standalone runs and
//! tests: attach and detach take effect immediately, conflicts are reported
//! the way the cloud reports them.

use crate::domain::ports::{CreateVolumeRequest, Volume, VolumeRegistry, VolumeStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default availability zone for volumes created without one
pub const DEFAULT_ZONE: &str = "nova";

/// Volume registry kept in process memory
pub struct InMemoryRegistry {
    volumes: RwLock<BTreeMap<String, Volume>>,
    next_id: AtomicU64,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            volumes: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert or replace a volume record as-is
    pub async fn insert(&self, volume: Volume) {
        self.volumes.write().await.insert(volume.id.clone(), volume);
    }

    /// Drop a volume record without any precondition
    pub async fn remove(&self, volume_id: &str) -> Option<Volume> {
        self.volumes.write().await.remove(volume_id)
    }

    /// Force a volume into `status`
    pub async fn set_status(&self, volume_id: &str, status: VolumeStatus) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found(volume_id))?;
        volume.status = status;
        Ok(())
    }

    /// Cinder-style id: 36 characters, dash separated
    fn generate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{:08x}-0000-4000-8000-{:012x}", std::process::id(), n)
    }

    /// Next free `/dev/vdX` on `instance_id`, as Nova would report it
    fn next_device(volumes: &BTreeMap<String, Volume>, instance_id: &str) -> String {
        let used = volumes
            .values()
            .filter(|v| v.attached_server_id == instance_id)
            .count();
        // vda is the root disk.
        let letter = (b'b' + (used % 25) as u8) as char;
        format!("/dev/vd{}", letter)
    }
}

fn not_found(volume_id: &str) -> Error {
    Error::VolumeNotFound {
        volume_id: volume_id.to_string(),
    }
}

fn conflict(reason: String) -> Error {
    Error::OpenStackConflict {
        service: "memory".into(),
        reason,
    }
}

#[async_trait]
impl VolumeRegistry for InMemoryRegistry {
    async fn create(&self, request: &CreateVolumeRequest) -> Result<Volume> {
        if request.size_gib == 0 {
            return Err(Error::OpenStackApi {
                service: "memory".into(),
                reason: "volume size must be at least 1 GiB".into(),
            });
        }

        let volume = Volume {
            id: self.generate_id(),
            name: request.name.clone(),
            status: VolumeStatus::Available,
            size_gib: request.size_gib,
            availability_zone: request
                .availability_zone
                .clone()
                .unwrap_or_else(|| DEFAULT_ZONE.to_string()),
            attached_server_id: String::new(),
            attached_device: String::new(),
        };

        info!(
            "Created in-memory volume {} ({}, {} GiB)",
            volume.id, volume.name, volume.size_gib
        );
        self.insert(volume.clone()).await;
        Ok(volume)
    }

    async fn get(&self, volume_id: &str) -> Result<Volume> {
        self.volumes
            .read()
            .await
            .get(volume_id)
            .cloned()
            .ok_or_else(|| not_found(volume_id))
    }

    async fn list(&self, name_filter: Option<&str>) -> Result<Vec<Volume>> {
        let volumes = self.volumes.read().await;
        Ok(volumes
            .values()
            .filter(|v| name_filter.map_or(true, |name| v.name == name))
            .cloned()
            .collect())
    }

    async fn delete(&self, volume_id: &str) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes.get(volume_id).ok_or_else(|| not_found(volume_id))?;
        if volume.is_attached() {
            return Err(conflict(format!(
                "volume {} is attached to {}",
                volume_id, volume.attached_server_id
            )));
        }
        volumes.remove(volume_id);
        debug!("Deleted in-memory volume {}", volume_id);
        Ok(())
    }

    async fn attach(&self, instance_id: &str, volume_id: &str) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let device = Self::next_device(&volumes, instance_id);
        let volume = volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found(volume_id))?;

        if volume.is_attached() {
            return Err(conflict(format!(
                "volume {} is already attached to {}",
                volume_id, volume.attached_server_id
            )));
        }
        if volume.status != VolumeStatus::Available {
            return Err(conflict(format!(
                "volume {} is {}, expected available",
                volume_id, volume.status
            )));
        }

        volume.status = VolumeStatus::InUse;
        volume.attached_server_id = instance_id.to_string();
        volume.attached_device = device;
        Ok(())
    }

    async fn detach(&self, instance_id: &str, volume_id: &str) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found(volume_id))?;

        if !volume.is_attached_to(instance_id) {
            return Err(conflict(format!(
                "volume {} is not attached to {}",
                volume_id, instance_id
            )));
        }

        volume.status = VolumeStatus::Available;
        volume.attached_server_id.clear();
        volume.attached_device.clear();
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}
