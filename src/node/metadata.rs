//! Instance Metadata Service Client
//!
//! Reads the OpenStack `meta_data.json` document served on the link-local
//! address. Responses are never cached: device lists change on every attach.

use crate::domain::ports::{InstanceMetadata, InstanceMetadataDocument};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the metadata service client
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    /// Base URL of the metadata service
    pub base_url: String,
    /// Metadata API version
    pub version: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            base_url: "http://169.254.169.254".to_string(),
            version: "latest".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl MetadataConfig {
    /// Full URL of the metadata document
    pub fn document_url(&self) -> String {
        format!(
            "{}/openstack/{}/meta_data.json",
            self.base_url.trim_end_matches('/'),
            self.version
        )
    }
}

// =============================================================================
// HTTP Metadata Service
// =============================================================================

/// Metadata service reached over HTTP
pub struct HttpMetadataService {
    config: MetadataConfig,
    client: reqwest::Client,
}

impl HttpMetadataService {
    pub fn new(config: MetadataConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl InstanceMetadata for HttpMetadataService {
    async fn fetch(&self) -> Result<InstanceMetadataDocument> {
        let url = self.config.document_url();
        debug!("Fetching instance metadata from {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Metadata(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_url() {
        let config = MetadataConfig::default();
        assert_eq!(
            config.document_url(),
            "http://169.254.169.254/openstack/latest/meta_data.json"
        );

        let config = MetadataConfig {
            base_url: "http://127.0.0.1:8775/".into(),
            version: "2012-08-10".into(),
            ..Default::default()
        };
        assert_eq!(
            config.document_url(),
            "http://127.0.0.1:8775/openstack/2012-08-10/meta_data.json"
        );
    }
}
