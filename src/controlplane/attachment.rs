//! Attachment State Machine
//!
//! Drives a volume through `unattached -> attaching -> attached(instance) ->
//! detaching -> unattached` against the cloud registry. The cloud only
//! *accepts* attach and detach requests; the wait operations poll until the
//! volume record agrees, re-reading it on every tick.

use super::polling::{poll_until, PollError, StepBackoff};
use crate::domain::ports::{CreateVolumeRequest, Volume, VolumeRegistryRef, VolumeStatus};
use crate::error::{Error, Result};
use crate::node::DeviceResolver;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Backoff shapes for the three polling loops
#[derive(Debug, Clone, Copy)]
pub struct AttachmentConfig {
    pub attach: StepBackoff,
    pub detach: StepBackoff,
    pub resolve: StepBackoff,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            attach: StepBackoff::disk_attach(),
            detach: StepBackoff::disk_detach(),
            resolve: StepBackoff::device_resolve(),
        }
    }
}

/// Translate a finished poll into a driver error
fn poll_error(err: PollError, volume_id: &str, operation: &str) -> Error {
    match err {
        PollError::Exhausted { attempts } => Error::Timeout {
            volume_id: volume_id.to_string(),
            operation: operation.to_string(),
            attempts,
        },
        PollError::Cancelled { attempts } => {
            debug!(
                "{} for volume {} cancelled after {} attempts",
                operation, volume_id, attempts
            );
            Error::Cancelled {
                operation: operation.to_string(),
            }
        }
        PollError::Failed(e) => e,
    }
}

// =============================================================================
// Attachment Manager
// =============================================================================

/// Volume lifecycle on the cloud side plus device resolution on this node
pub struct AttachmentManager {
    registry: VolumeRegistryRef,
    resolver: Arc<DeviceResolver>,
    config: AttachmentConfig,
}

impl AttachmentManager {
    pub fn new(
        registry: VolumeRegistryRef,
        resolver: Arc<DeviceResolver>,
        config: AttachmentConfig,
    ) -> Self {
        Self {
            registry,
            resolver,
            config,
        }
    }

    pub fn registry(&self) -> &VolumeRegistryRef {
        &self.registry
    }

    // =========================================================================
    // Volume CRUD
    // =========================================================================

    pub async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<Volume> {
        if request.name.is_empty() {
            return Err(Error::InvalidArgument("volume name is required".into()));
        }
        let volume = self.registry.create(request).await?;
        info!(
            "Created volume {} ({}, {} GiB) in zone {}",
            volume.id, volume.name, volume.size_gib, volume.availability_zone
        );
        Ok(volume)
    }

    pub async fn get_volume(&self, volume_id: &str) -> Result<Volume> {
        self.registry.get(volume_id).await
    }

    pub async fn list_volumes(&self, name_filter: Option<&str>) -> Result<Vec<Volume>> {
        self.registry.list(name_filter).await
    }

    /// Delete a volume that is not attached anywhere
    ///
    /// An attach racing with this call is reported by the registry's delete.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let volume = self.registry.get(volume_id).await?;
        if volume.is_attached() {
            return Err(Error::VolumeInUse {
                volume_id: volume_id.to_string(),
                attached_to: volume.attached_server_id,
            });
        }

        self.registry.delete(volume_id).await?;
        info!("Deleted volume {}", volume_id);
        Ok(())
    }

    // =========================================================================
    // Attach
    // =========================================================================

    /// Request attachment of `volume_id` to `instance_id`
    ///
    /// Returns the volume id as the logical device handle. Already attached to
    /// `instance_id` is a no-op.
    pub async fn attach_volume(&self, instance_id: &str, volume_id: &str) -> Result<String> {
        let volume = self.registry.get(volume_id).await?;

        if volume.is_attached_to(instance_id) {
            debug!(
                "Volume {} is already attached to instance {}",
                volume_id, instance_id
            );
            return Ok(volume.id);
        }
        if volume.is_attached() {
            return Err(Error::AttachedElsewhere {
                volume_id: volume_id.to_string(),
                attached_to: volume.attached_server_id,
            });
        }

        self.registry.attach(instance_id, volume_id).await?;
        info!(
            "Requested attachment of volume {} to instance {}",
            volume_id, instance_id
        );
        Ok(volume.id)
    }

    /// Poll until the volume reports an attachment to `instance_id`
    ///
    /// A missing volume counts as "not attached yet".
    pub async fn wait_disk_attached(
        &self,
        instance_id: &str,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let registry = &self.registry;
        poll_until(self.config.attach, cancel, || async move {
            match registry.get(volume_id).await {
                Ok(volume) if volume.is_attached_to(instance_id) => Ok(Some(())),
                Ok(volume) => {
                    debug!(
                        "Volume {} not attached to {} yet (status {})",
                        volume_id, instance_id, volume.status
                    );
                    Ok(None)
                }
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| poll_error(e, volume_id, "wait for attach"))?;

        info!("Volume {} is attached to instance {}", volume_id, instance_id);
        Ok(())
    }

    // =========================================================================
    // Detach
    // =========================================================================

    /// Request detachment of `volume_id` from `instance_id`
    ///
    /// An `available` volume is already detached.
    pub async fn detach_volume(&self, instance_id: &str, volume_id: &str) -> Result<()> {
        let volume = self.registry.get(volume_id).await?;

        if volume.status == VolumeStatus::Available {
            debug!("Volume {} is already detached", volume_id);
            return Ok(());
        }
        if volume.status != VolumeStatus::InUse {
            return Err(Error::InvalidVolumeState {
                volume_id: volume_id.to_string(),
                status: volume.status.to_string(),
                operation: "detach".into(),
            });
        }
        if !volume.is_attached_to(instance_id) {
            return Err(Error::NotAttachedHere {
                volume_id: volume_id.to_string(),
                instance_id: instance_id.to_string(),
            });
        }

        self.registry.detach(instance_id, volume_id).await?;
        info!(
            "Requested detachment of volume {} from instance {}",
            volume_id, instance_id
        );
        Ok(())
    }

    /// Poll until the volume no longer reports an attachment to `instance_id`
    ///
    /// Any error while fetching the volume, `NotFound` included, aborts.
    pub async fn wait_disk_detached(
        &self,
        instance_id: &str,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let registry = &self.registry;
        poll_until(self.config.detach, cancel, || async move {
            let volume = registry.get(volume_id).await?;
            Ok((!volume.is_attached_to(instance_id)).then_some(()))
        })
        .await
        .map_err(|e| poll_error(e, volume_id, "wait for detach"))?;

        info!(
            "Volume {} is detached from instance {}",
            volume_id, instance_id
        );
        Ok(())
    }

    // =========================================================================
    // Device Paths
    // =========================================================================

    /// Poll the device resolver until the volume's local device node shows up
    pub async fn get_device_path(
        &self,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let resolver = &self.resolver;
        let path = poll_until(self.config.resolve, cancel, || async move {
            Ok(resolver.resolve_once(volume_id).await)
        })
        .await
        .map_err(|e| {
            warn!("Failed to find device for volume {}", volume_id);
            poll_error(e, volume_id, "resolve device path")
        })?;

        if path.as_os_str().is_empty() {
            return Err(Error::EmptyDevicePath {
                volume_id: volume_id.to_string(),
            });
        }

        debug!("Volume {} resolved to {}", volume_id, path.display());
        Ok(path)
    }

    /// Device path as reported by the cloud for an attachment to `instance_id`
    pub async fn get_attachment_disk_path(
        &self,
        instance_id: &str,
        volume_id: &str,
    ) -> Result<String> {
        let volume = self.registry.get(volume_id).await?;

        if volume.status != VolumeStatus::InUse {
            return Err(Error::InvalidVolumeState {
                volume_id: volume_id.to_string(),
                status: volume.status.to_string(),
                operation: "get the device path of".into(),
            });
        }
        if volume.is_attached_to(instance_id) {
            return Ok(volume.attached_device);
        }
        if volume.is_attached() {
            return Err(Error::AttachedElsewhere {
                volume_id: volume_id.to_string(),
                attached_to: volume.attached_server_id,
            });
        }
        Err(Error::NotAttachedHere {
            volume_id: volume_id.to_string(),
            instance_id: instance_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::registry::InMemoryRegistry;
    use crate::domain::ports::{InstanceMetadata, InstanceMetadataDocument, VolumeRegistry};
    use crate::error::ErrorKind;
    use crate::node::ResolverConfig;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const INSTANCE: &str = "server-a";

    /// Registry wrapper counting calls, optionally hiding attachments
    struct CountingRegistry {
        inner: InMemoryRegistry,
        gets: AtomicU32,
        deletes: AtomicU32,
        attaches: AtomicU32,
        detaches: AtomicU32,
        /// Report no attachment until this many gets have happened
        attach_lag: u32,
        /// Keep reporting `in-use` on `INSTANCE` for this many gets
        detach_lag: u32,
    }

    impl CountingRegistry {
        fn new(attach_lag: u32) -> Self {
            Self {
                inner: InMemoryRegistry::new(),
                gets: AtomicU32::new(0),
                deletes: AtomicU32::new(0),
                attaches: AtomicU32::new(0),
                detaches: AtomicU32::new(0),
                attach_lag,
                detach_lag: 0,
            }
        }

        fn with_detach_lag(mut self, detach_lag: u32) -> Self {
            self.detach_lag = detach_lag;
            self
        }
    }

    #[async_trait]
    impl VolumeRegistry for CountingRegistry {
        async fn create(&self, request: &CreateVolumeRequest) -> Result<Volume> {
            self.inner.create(request).await
        }

        async fn get(&self, volume_id: &str) -> Result<Volume> {
            let n = self.gets.fetch_add(1, Ordering::SeqCst) + 1;
            let mut volume = self.inner.get(volume_id).await?;
            if n <= self.attach_lag {
                volume.attached_server_id.clear();
                volume.status = VolumeStatus::from("attaching");
            }
            if n <= self.detach_lag {
                volume.attached_server_id = INSTANCE.to_string();
                volume.status = VolumeStatus::InUse;
            }
            Ok(volume)
        }

        async fn list(&self, name_filter: Option<&str>) -> Result<Vec<Volume>> {
            self.inner.list(name_filter).await
        }

        async fn delete(&self, volume_id: &str) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(volume_id).await
        }

        async fn attach(&self, instance_id: &str, volume_id: &str) -> Result<()> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            self.inner.attach(instance_id, volume_id).await
        }

        async fn detach(&self, instance_id: &str, volume_id: &str) -> Result<()> {
            self.detaches.fetch_add(1, Ordering::SeqCst);
            self.inner.detach(instance_id, volume_id).await
        }

        fn backend_name(&self) -> &str {
            "counting"
        }
    }

    struct NoMetadata;

    #[async_trait]
    impl InstanceMetadata for NoMetadata {
        async fn fetch(&self) -> Result<InstanceMetadataDocument> {
            Ok(InstanceMetadataDocument::default())
        }
    }

    fn manager_with(registry: Arc<CountingRegistry>, by_id: &TempDir) -> AttachmentManager {
        let resolver = DeviceResolver::new(
            ResolverConfig {
                by_id_dir: by_id.path().to_path_buf(),
                by_path_dir: by_id.path().join("by-path"),
            },
            Arc::new(NoMetadata),
        );
        AttachmentManager::new(registry, Arc::new(resolver), AttachmentConfig::default())
    }

    async fn new_volume(registry: &CountingRegistry) -> Volume {
        registry
            .create(&CreateVolumeRequest {
                name: "data".into(),
                size_gib: 1,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(0));
        let manager = manager_with(registry.clone(), &tmp);
        let volume = new_volume(&registry).await;

        let first = manager.attach_volume(INSTANCE, &volume.id).await.unwrap();
        let second = manager.attach_volume(INSTANCE, &volume.id).await.unwrap();

        assert_eq!(first, volume.id);
        assert_eq!(second, volume.id);
        assert_eq!(registry.attaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attach_elsewhere_is_conflict() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(0));
        let manager = manager_with(registry.clone(), &tmp);
        let volume = new_volume(&registry).await;
        registry.inner.attach("server-b", &volume.id).await.unwrap();

        let err = manager.attach_volume(INSTANCE, &volume.id).await.unwrap_err();
        assert_matches!(err, Error::AttachedElsewhere { ref attached_to, .. } if attached_to == "server-b");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(registry.attaches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_attached_volume_never_calls_registry_delete() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(0));
        let manager = manager_with(registry.clone(), &tmp);
        let volume = new_volume(&registry).await;
        registry.inner.attach(INSTANCE, &volume.id).await.unwrap();

        let err = manager.delete_volume(&volume.id).await.unwrap_err();
        assert_matches!(err, Error::VolumeInUse { .. });
        assert_eq!(registry.deletes.load(Ordering::SeqCst), 0);

        registry.inner.detach(INSTANCE, &volume.id).await.unwrap();
        manager.delete_volume(&volume.id).await.unwrap();
        assert_eq!(registry.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_attached_converges_after_lag() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(3));
        let manager = manager_with(registry.clone(), &tmp);
        let volume = new_volume(&registry).await;
        registry.inner.attach(INSTANCE, &volume.id).await.unwrap();

        manager
            .wait_disk_attached(INSTANCE, &volume.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(registry.gets.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_attached_times_out_at_step_ceiling() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(u32::MAX));
        let manager = manager_with(registry.clone(), &tmp);
        let volume = new_volume(&registry).await;

        let err = manager
            .wait_disk_attached(INSTANCE, &volume.id, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, Error::Timeout { attempts: 15, .. });
        assert_eq!(registry.gets.load(Ordering::SeqCst), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_deleted_mid_attach_is_timeout() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(0));
        let manager = manager_with(registry.clone(), &tmp);

        let err = manager
            .wait_disk_attached(INSTANCE, "gone", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_deleted_mid_detach_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(0));
        let manager = manager_with(registry.clone(), &tmp);

        let err = manager
            .wait_disk_detached(INSTANCE, "gone", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(registry.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_attached_honours_cancellation() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(u32::MAX));
        let manager = manager_with(registry.clone(), &tmp);
        let volume = new_volume(&registry).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let err = manager
            .wait_disk_attached(INSTANCE, &volume.id, &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Cancelled { .. });
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(registry.gets.load(Ordering::SeqCst) < 15);
    }

    #[tokio::test]
    async fn test_detach_state_checks() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(0));
        let manager = manager_with(registry.clone(), &tmp);
        let volume = new_volume(&registry).await;

        // available: already detached
        manager.detach_volume(INSTANCE, &volume.id).await.unwrap();

        registry.inner.attach("server-b", &volume.id).await.unwrap();
        let err = manager.detach_volume(INSTANCE, &volume.id).await.unwrap_err();
        assert_matches!(err, Error::NotAttachedHere { .. });

        registry
            .inner
            .set_status(&volume.id, VolumeStatus::Error)
            .await
            .unwrap();
        let err = manager.detach_volume(INSTANCE, &volume.id).await.unwrap_err();
        assert_matches!(err, Error::InvalidVolumeState { .. });
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(registry.detaches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_then_wait() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(0));
        let manager = manager_with(registry.clone(), &tmp);
        let volume = new_volume(&registry).await;
        registry.inner.attach(INSTANCE, &volume.id).await.unwrap();

        manager.detach_volume(INSTANCE, &volume.id).await.unwrap();
        manager
            .wait_disk_detached(INSTANCE, &volume.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(registry.detaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_detached_times_out_at_step_ceiling() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(0));
        let manager = manager_with(registry.clone(), &tmp);
        let volume = new_volume(&registry).await;
        registry.inner.attach(INSTANCE, &volume.id).await.unwrap();

        let err = manager
            .wait_disk_detached(INSTANCE, &volume.id, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, Error::Timeout { attempts: 13, .. });
        assert_eq!(registry.gets.load(Ordering::SeqCst), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_detached_tolerates_stale_in_use() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(0).with_detach_lag(3));
        let manager = manager_with(registry.clone(), &tmp);
        let volume = new_volume(&registry).await;

        manager
            .wait_disk_detached(INSTANCE, &volume.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(registry.gets.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_path_from_by_id() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(0));
        let manager = manager_with(registry, &tmp);
        let volume_id = "0123456789abcdef0123456789";
        let entry = tmp.path().join("virtio-0123456789abcdef0123");
        std::fs::write(&entry, "").unwrap();

        let path = manager
            .get_device_path(volume_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, entry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_path_times_out() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(0));
        let manager = manager_with(registry, &tmp);

        let err = manager
            .get_device_path("missing-volume", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Timeout { attempts: 10, .. });
    }

    #[tokio::test]
    async fn test_attachment_disk_path() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(CountingRegistry::new(0));
        let manager = manager_with(registry.clone(), &tmp);
        let volume = new_volume(&registry).await;

        let err = manager
            .get_attachment_disk_path(INSTANCE, &volume.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        registry.inner.attach(INSTANCE, &volume.id).await.unwrap();
        assert_eq!(
            manager
                .get_attachment_disk_path(INSTANCE, &volume.id)
                .await
                .unwrap(),
            "/dev/vdb"
        );
        assert_matches!(
            manager.get_attachment_disk_path("server-b", &volume.id).await,
            Err(Error::AttachedElsewhere { .. })
        );
    }
}
