//! OpenStack Volume Registry
//!
//! Talks to the real cloud:
//! - Keystone v3: password authentication and service catalog
//! - Cinder v3: volume create/get/list/delete
//! - Nova: `os-volume_attachments` for attach/detach

use crate::domain::ports::{CreateVolumeRequest, Volume, VolumeRegistry, VolumeStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Description stamped on every volume this driver creates
pub const VOLUME_DESCRIPTION: &str = "Created by OpenStack Cinder CSI driver";

const TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// Re-authenticate when the token expires within this window
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the OpenStack registry
#[derive(Debug, Clone)]
pub struct OpenStackConfig {
    /// Keystone auth URL
    pub auth_url: String,
    /// Username
    pub username: String,
    /// Password (should use secrets in production)
    pub password: String,
    /// Project name
    pub project_name: String,
    /// User domain name
    pub user_domain_name: String,
    /// Project domain name
    pub project_domain_name: String,
    /// Region name
    pub region: String,
    /// Catalog endpoint interface (public, internal, admin)
    pub endpoint_interface: String,
    /// Override for the block storage endpoint
    pub block_storage_url: Option<String>,
    /// Override for the compute endpoint
    pub compute_url: Option<String>,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for OpenStackConfig {
    fn default() -> Self {
        Self {
            auth_url: "http://keystone:5000/v3".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            project_name: "admin".to_string(),
            user_domain_name: "Default".to_string(),
            project_domain_name: "Default".to_string(),
            region: "RegionOne".to_string(),
            endpoint_interface: "public".to_string(),
            block_storage_url: None,
            compute_url: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct CinderAttachment {
    #[serde(default)]
    server_id: String,
    #[serde(default)]
    device: String,
}

#[derive(Debug, Deserialize)]
struct CinderVolume {
    id: String,
    #[serde(default)]
    name: Option<String>,
    status: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    availability_zone: Option<String>,
    #[serde(default)]
    attachments: Vec<CinderAttachment>,
}

impl From<CinderVolume> for Volume {
    fn from(v: CinderVolume) -> Self {
        // The driver models at most one attachment.
        let (attached_server_id, attached_device) = v
            .attachments
            .into_iter()
            .next()
            .map(|a| (a.server_id, a.device))
            .unwrap_or_default();

        Volume {
            id: v.id,
            name: v.name.unwrap_or_default(),
            status: VolumeStatus::from(v.status),
            size_gib: v.size,
            availability_zone: v.availability_zone.unwrap_or_default(),
            attached_server_id,
            attached_device,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VolumeEnvelope {
    volume: CinderVolume,
}

#[derive(Debug, Deserialize)]
struct Link {
    rel: String,
    href: String,
}

#[derive(Debug, Deserialize)]
struct VolumeListPage {
    volumes: Vec<CinderVolume>,
    #[serde(default)]
    volumes_links: Vec<Link>,
}

#[derive(Debug, Serialize)]
struct CreateVolumeBody<'a> {
    name: &'a str,
    size: u64,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    volume_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    availability_zone: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_id: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: &'a BTreeMap<String, String>,
}

// =============================================================================
// Session
// =============================================================================

/// Which OpenStack service a request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Service {
    BlockStorage,
    Compute,
}

impl Service {
    fn name(&self) -> &'static str {
        match self {
            Service::BlockStorage => "cinder",
            Service::Compute => "nova",
        }
    }

    fn catalog_types(&self) -> &'static [&'static str] {
        match self {
            Service::BlockStorage => &["volumev3", "block-storage"],
            Service::Compute => &["compute"],
        }
    }
}

/// Authenticated token plus resolved endpoints
#[derive(Debug, Clone)]
struct Session {
    token: String,
    expires_at: DateTime<Utc>,
    block_storage_url: String,
    compute_url: String,
}

impl Session {
    fn is_fresh(&self) -> bool {
        self.expires_at - Utc::now() > ChronoDuration::seconds(TOKEN_REFRESH_MARGIN_SECS)
    }

    fn endpoint(&self, service: Service) -> &str {
        match service {
            Service::BlockStorage => &self.block_storage_url,
            Service::Compute => &self.compute_url,
        }
    }
}

// =============================================================================
// OpenStack Registry
// =============================================================================

/// Volume registry backed by Cinder and Nova
pub struct OpenStackRegistry {
    config: OpenStackConfig,
    client: reqwest::Client,
    session: RwLock<Option<Session>>,
}

impl OpenStackRegistry {
    /// Create a new registry client; authentication is deferred to first use
    pub fn new(config: OpenStackConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config,
            client,
            session: RwLock::new(None),
        })
    }

    /// Current session, authenticating when missing or about to expire
    async fn session(&self) -> Result<Session> {
        if let Some(session) = self.session.read().as_ref().filter(|s| s.is_fresh()) {
            return Ok(session.clone());
        }

        let session = self.authenticate().await?;
        *self.session.write() = Some(session.clone());
        Ok(session)
    }

    /// Keystone v3 password authentication scoped to the project
    async fn authenticate(&self) -> Result<Session> {
        let url = format!("{}/auth/tokens", self.config.auth_url.trim_end_matches('/'));
        info!("Authenticating to Keystone at {} as {}", url, self.config.username);

        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.config.username,
                            "domain": { "name": self.config.user_domain_name },
                            "password": self.config.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.config.project_name,
                        "domain": { "name": self.config.project_domain_name },
                    }
                }
            }
        });

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::OpenStackApi {
                service: "keystone".into(),
                reason: format!("{}: {}", status, text),
            });
        }

        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::OpenStackApi {
                service: "keystone".into(),
                reason: format!("response is missing {}", SUBJECT_TOKEN_HEADER),
            })?;

        let body: TokenResponse = response.json().await?;

        let block_storage_url = match &self.config.block_storage_url {
            Some(url) => url.clone(),
            None => self.catalog_endpoint(&body.token.catalog, Service::BlockStorage)?,
        };
        let compute_url = match &self.config.compute_url {
            Some(url) => url.clone(),
            None => self.catalog_endpoint(&body.token.catalog, Service::Compute)?,
        };

        debug!(
            "Keystone token valid until {}; cinder at {}, nova at {}",
            body.token.expires_at, block_storage_url, compute_url
        );

        Ok(Session {
            token,
            expires_at: body.token.expires_at,
            block_storage_url,
            compute_url,
        })
    }

    /// Pick the endpoint of `service` for our region and interface
    fn catalog_endpoint(&self, catalog: &[CatalogEntry], service: Service) -> Result<String> {
        catalog
            .iter()
            .filter(|entry| service.catalog_types().contains(&entry.service_type.as_str()))
            .flat_map(|entry| entry.endpoints.iter())
            .find(|ep| {
                ep.interface == self.config.endpoint_interface
                    && ep
                        .region
                        .as_deref()
                        .map_or(true, |region| region == self.config.region)
            })
            .map(|ep| ep.url.trim_end_matches('/').to_string())
            .ok_or_else(|| Error::OpenStackApi {
                service: service.name().into(),
                reason: format!(
                    "no {} endpoint in region {} of the service catalog",
                    self.config.endpoint_interface, self.config.region
                ),
            })
    }

    /// Issue an authenticated request and map failure statuses
    ///
    /// `path` is either relative to the service endpoint or an absolute URL
    /// (pagination links).
    async fn request(
        &self,
        service: Service,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        volume_id: &str,
    ) -> Result<reqwest::Response> {
        let session = self.session().await?;
        let url = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", session.endpoint(service), path)
        };

        debug!("{} {}", method, url);
        let mut builder = self
            .client
            .request(method.clone(), &url)
            .header(TOKEN_HEADER, &session.token);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            warn!("{} rejected the token, dropping session", service.name());
            *self.session.write() = None;
        }
        Err(status_error(
            service,
            status,
            volume_id,
            format!("{} {} returned {}: {}", method, url, status, text),
        ))
    }
}

/// Map a failed response to an error
///
/// Only block storage 404s name a missing volume. A compute 404 concerns the
/// server or its attachment record.
fn status_error(service: Service, status: StatusCode, volume_id: &str, reason: String) -> Error {
    match (service, status) {
        (Service::BlockStorage, StatusCode::NOT_FOUND) if !volume_id.is_empty() => {
            Error::VolumeNotFound {
                volume_id: volume_id.to_string(),
            }
        }
        (_, StatusCode::CONFLICT) => Error::OpenStackConflict {
            service: service.name().into(),
            reason,
        },
        _ => Error::OpenStackApi {
            service: service.name().into(),
            reason,
        },
    }
}

#[async_trait]
impl VolumeRegistry for OpenStackRegistry {
    async fn create(&self, request: &CreateVolumeRequest) -> Result<Volume> {
        info!(
            "Creating Cinder volume: {} ({} GiB, type: {:?})",
            request.name, request.size_gib, request.volume_type
        );

        let body = CreateVolumeBody {
            name: &request.name,
            size: request.size_gib,
            description: VOLUME_DESCRIPTION,
            volume_type: request.volume_type.as_deref(),
            availability_zone: request.availability_zone.as_deref(),
            snapshot_id: request.snapshot_id.as_deref(),
            metadata: &request.tags,
        };

        let response = self
            .request(
                Service::BlockStorage,
                Method::POST,
                "/volumes",
                Some(json!({ "volume": body })),
                "",
            )
            .await?;
        let envelope: VolumeEnvelope = response.json().await?;
        Ok(envelope.volume.into())
    }

    async fn get(&self, volume_id: &str) -> Result<Volume> {
        let path = format!("/volumes/{}", urlencoding::encode(volume_id));
        let response = self
            .request(Service::BlockStorage, Method::GET, &path, None, volume_id)
            .await?;
        let envelope: VolumeEnvelope = response.json().await?;
        Ok(envelope.volume.into())
    }

    async fn list(&self, name_filter: Option<&str>) -> Result<Vec<Volume>> {
        let mut next = match name_filter {
            Some(name) => format!("/volumes/detail?name={}", urlencoding::encode(name)),
            None => "/volumes/detail".to_string(),
        };

        let mut volumes = Vec::new();
        loop {
            let response = self
                .request(Service::BlockStorage, Method::GET, &next, None, "")
                .await?;
            let page: VolumeListPage = response.json().await?;
            volumes.extend(page.volumes.into_iter().map(Volume::from));

            match page.volumes_links.into_iter().find(|l| l.rel == "next") {
                Some(link) => next = link.href,
                None => break,
            }
        }

        debug!("Listed {} Cinder volumes", volumes.len());
        Ok(volumes)
    }

    async fn delete(&self, volume_id: &str) -> Result<()> {
        info!("Deleting Cinder volume: {}", volume_id);
        let path = format!("/volumes/{}", urlencoding::encode(volume_id));
        self.request(Service::BlockStorage, Method::DELETE, &path, None, volume_id)
            .await?;
        Ok(())
    }

    async fn attach(&self, instance_id: &str, volume_id: &str) -> Result<()> {
        let path = format!(
            "/servers/{}/os-volume_attachments",
            urlencoding::encode(instance_id)
        );
        self.request(
            Service::Compute,
            Method::POST,
            &path,
            Some(json!({ "volumeAttachment": { "volumeId": volume_id } })),
            volume_id,
        )
        .await?;
        Ok(())
    }

    async fn detach(&self, instance_id: &str, volume_id: &str) -> Result<()> {
        let path = format!(
            "/servers/{}/os-volume_attachments/{}",
            urlencoding::encode(instance_id),
            urlencoding::encode(volume_id)
        );
        self.request(Service::Compute, Method::DELETE, &path, None, volume_id)
            .await?;
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "openstack"
    }
}
