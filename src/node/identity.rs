//! Node Identity
//!
//! The node id is the compute instance id. cloud-init leaves it on disk; the
//! metadata service is the fallback.

use crate::domain::ports::InstanceMetadataRef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

/// Configuration for node identity lookup
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// File written by cloud-init holding the instance id
    pub instance_id_file: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_id_file: PathBuf::from("/var/lib/cloud/data/instance-id"),
        }
    }
}

/// Identity and topology of this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    pub availability_zone: String,
}

/// Resolves this node's instance id and availability zone
pub struct NodeIdentity {
    config: NodeConfig,
    metadata: InstanceMetadataRef,
}

impl NodeIdentity {
    pub fn new(config: NodeConfig, metadata: InstanceMetadataRef) -> Self {
        Self { config, metadata }
    }

    /// Instance id from the local file, else from the metadata service
    pub async fn instance_id(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.config.instance_id_file).await {
            Ok(contents) if !contents.trim().is_empty() => {
                let id = contents.trim().to_string();
                debug!(
                    "Got instance id from {}: {}",
                    self.config.instance_id_file.display(),
                    id
                );
                return Ok(id);
            }
            Ok(_) => debug!(
                "{} is empty",
                self.config.instance_id_file.display()
            ),
            Err(e) => debug!(
                "Failed to read {}: {}",
                self.config.instance_id_file.display(),
                e
            ),
        }

        info!("Falling back to the metadata service for the instance id");
        let document = self.metadata.fetch().await?;
        if document.uuid.is_empty() {
            return Err(Error::Metadata("metadata document has no uuid".into()));
        }
        Ok(document.uuid)
    }

    /// Availability zone from the metadata service
    pub async fn availability_zone(&self) -> Result<String> {
        Ok(self.metadata.fetch().await?.availability_zone)
    }

    /// Node id plus topology
    pub async fn info(&self) -> Result<NodeInfo> {
        let node_id = self.instance_id().await?;
        let availability_zone = self.availability_zone().await.unwrap_or_else(|e| {
            debug!("Availability zone unavailable: {}", e);
            String::new()
        });
        Ok(NodeInfo {
            node_id,
            availability_zone,
        })
    }
}
