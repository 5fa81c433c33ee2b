//! Cinder Driver
//!
//! Single entry point for every operation the node driver exposes. Wires the
//! attachment state machine, the mount orchestrator and node identity
//! together and records metrics for each call.

use super::attachment::{AttachmentConfig, AttachmentManager};
use crate::domain::ports::{CreateVolumeRequest, InstanceMetadataRef, Volume, VolumeRegistryRef};
use crate::error::Result;
use crate::metrics::DriverMetrics;
use crate::node::{
    DeviceResolver, MountOrchestrator, MountProvider, NodeConfig, NodeIdentity, NodeInfo,
    PublishRequest, ResolverConfig, ScanConfig, StageRequest,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// =============================================================================
// Driver Configuration
// =============================================================================

/// Configuration for the driver
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    pub attachment: AttachmentConfig,
    pub resolver: ResolverConfig,
    pub scan: ScanConfig,
    pub node: NodeConfig,
}

// =============================================================================
// Driver
// =============================================================================

/// Node driver facade
pub struct CinderDriver {
    attachments: AttachmentManager,
    mounts: MountOrchestrator,
    identity: NodeIdentity,
    metrics: DriverMetrics,
}

impl CinderDriver {
    /// Build the driver from its collaborators
    pub fn new(
        config: DriverConfig,
        registry: VolumeRegistryRef,
        metadata: InstanceMetadataRef,
        provider: MountProvider,
    ) -> Result<Arc<Self>> {
        let resolver = Arc::new(DeviceResolver::new(config.resolver, metadata.clone()));

        info!(
            "Initializing driver with the {} volume registry",
            registry.backend_name()
        );

        Ok(Arc::new(Self {
            attachments: AttachmentManager::new(registry, resolver, config.attachment),
            mounts: MountOrchestrator::new(provider, config.scan),
            identity: NodeIdentity::new(config.node, metadata),
            metrics: DriverMetrics::new()?,
        }))
    }

    pub fn metrics(&self) -> &DriverMetrics {
        &self.metrics
    }

    pub fn backend_name(&self) -> &str {
        self.attachments.registry().backend_name()
    }

    /// Run `operation`, recording its outcome and duration
    async fn instrumented<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = fut.await;
        self.metrics.observe(operation, &result, start.elapsed());
        if let Err(e) = &result {
            error!("{} failed ({}): {}", operation, e.kind(), e);
        }
        result
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    pub async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<Volume> {
        self.instrumented("create_volume", self.attachments.create_volume(request))
            .await
    }

    pub async fn get_volume(&self, volume_id: &str) -> Result<Volume> {
        self.instrumented("get_volume", self.attachments.get_volume(volume_id))
            .await
    }

    pub async fn list_volumes(&self, name_filter: Option<&str>) -> Result<Vec<Volume>> {
        self.instrumented("list_volumes", self.attachments.list_volumes(name_filter))
            .await
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.instrumented("delete_volume", self.attachments.delete_volume(volume_id))
            .await
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    pub async fn attach_volume(&self, instance_id: &str, volume_id: &str) -> Result<String> {
        self.instrumented(
            "attach_volume",
            self.attachments.attach_volume(instance_id, volume_id),
        )
        .await
    }

    pub async fn wait_disk_attached(
        &self,
        instance_id: &str,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.instrumented(
            "wait_disk_attached",
            self.attachments
                .wait_disk_attached(instance_id, volume_id, cancel),
        )
        .await
    }

    pub async fn detach_volume(&self, instance_id: &str, volume_id: &str) -> Result<()> {
        self.instrumented(
            "detach_volume",
            self.attachments.detach_volume(instance_id, volume_id),
        )
        .await
    }

    pub async fn wait_disk_detached(
        &self,
        instance_id: &str,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.instrumented(
            "wait_disk_detached",
            self.attachments
                .wait_disk_detached(instance_id, volume_id, cancel),
        )
        .await
    }

    /// Local device node of an attached volume
    pub async fn get_device_path(
        &self,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.instrumented("get_device_path", async {
            let path = self.attachments.get_device_path(volume_id, cancel).await?;
            Ok(path.to_string_lossy().into_owned())
        })
        .await
    }

    pub async fn get_attachment_disk_path(
        &self,
        instance_id: &str,
        volume_id: &str,
    ) -> Result<String> {
        self.instrumented(
            "get_attachment_disk_path",
            self.attachments
                .get_attachment_disk_path(instance_id, volume_id),
        )
        .await
    }

    // =========================================================================
    // Node
    // =========================================================================

    pub async fn node_stage(&self, request: &StageRequest, cancel: &CancellationToken) -> Result<()> {
        self.instrumented("node_stage", self.mounts.stage(request, cancel))
            .await
    }

    pub async fn node_unstage(&self, staging_path: &str) -> Result<()> {
        self.instrumented("node_unstage", self.mounts.unstage(staging_path))
            .await
    }

    pub async fn node_publish(&self, request: &PublishRequest) -> Result<()> {
        self.instrumented("node_publish", self.mounts.publish(request))
            .await
    }

    pub async fn node_unpublish(&self, target_path: &str) -> Result<()> {
        self.instrumented("node_unpublish", self.mounts.unpublish(target_path))
            .await
    }

    pub async fn node_info(&self) -> Result<NodeInfo> {
        self.instrumented("node_info", self.identity.info()).await
    }
}
