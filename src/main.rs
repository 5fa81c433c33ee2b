//! Cinder CSI Node Driver
//!
//! Node-side driver attaching OpenStack Cinder volumes to this compute
//! instance and mounting them for workloads.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cinder_csi_node::{
    ApiServer, ApiServerConfig, CinderDriver, DriverConfig, DriverMetrics, Error,
    HttpMetadataService, MetadataConfig, MountProvider, NodeConfig, OpenStackConfig,
    RegistryFactory, RegistryKind, ResolverConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cinder CSI Node Driver - volume attach, device discovery and mounts
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Per-request deadline in seconds, waits included
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "120")]
    request_timeout_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Keystone v3 auth URL
    #[arg(long, env = "OS_AUTH_URL", default_value = "http://keystone:5000/v3")]
    os_auth_url: String,

    /// OpenStack username
    #[arg(long, env = "OS_USERNAME", default_value = "admin")]
    os_username: String,

    /// OpenStack password
    #[arg(long, env = "OS_PASSWORD", default_value = "", hide_env_values = true)]
    os_password: String,

    /// OpenStack project name
    #[arg(long, env = "OS_PROJECT_NAME", default_value = "admin")]
    os_project_name: String,

    /// User domain name
    #[arg(long, env = "OS_USER_DOMAIN_NAME", default_value = "Default")]
    os_user_domain_name: String,

    /// Project domain name
    #[arg(long, env = "OS_PROJECT_DOMAIN_NAME", default_value = "Default")]
    os_project_domain_name: String,

    /// OpenStack region
    #[arg(long, env = "OS_REGION_NAME", default_value = "RegionOne")]
    os_region: String,

    /// Service catalog interface (public, internal, admin)
    #[arg(long, env = "OS_INTERFACE", default_value = "public")]
    os_interface: String,

    /// Metadata service base URL
    #[arg(long, env = "METADATA_URL", default_value = "http://169.254.169.254")]
    metadata_url: String,

    /// File holding this instance's id
    #[arg(
        long,
        env = "INSTANCE_ID_FILE",
        default_value = "/var/lib/cloud/data/instance-id"
    )]
    instance_id_file: PathBuf,

    /// Stable by-id device directory
    #[arg(long, env = "BY_ID_DIR", default_value = "/dev/disk/by-id")]
    by_id_dir: PathBuf,

    /// Stable by-path device directory
    #[arg(long, env = "BY_PATH_DIR", default_value = "/dev/disk/by-path")]
    by_path_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (in-memory volume registry, no OpenStack)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Cinder CSI node driver");
    info!("  Version: {}", cinder_csi_node::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Standalone mode: {}", args.standalone);

    let kind = if args.standalone {
        RegistryKind::Memory
    } else {
        RegistryKind::OpenStack
    };
    let registry = RegistryFactory::create(kind, openstack_config(&args))?;

    let metadata = Arc::new(HttpMetadataService::new(MetadataConfig {
        base_url: args.metadata_url.clone(),
        ..Default::default()
    })?);

    let config = DriverConfig {
        resolver: ResolverConfig {
            by_id_dir: args.by_id_dir.clone(),
            by_path_dir: args.by_path_dir.clone(),
        },
        node: NodeConfig {
            instance_id_file: args.instance_id_file.clone(),
        },
        ..Default::default()
    };

    // The only handle to host mount, format and rescan utilities.
    let provider = MountProvider::linux(&config.scan);

    let driver = CinderDriver::new(config, registry, metadata, provider)?;

    match driver.node_info().await {
        Ok(node) => info!(
            "Node id {} in availability zone {:?}",
            node.node_id, node.availability_zone
        ),
        Err(e) => error!("Node identity unavailable: {}", e),
    }

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics = driver.metrics().clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
    };
    let api_server = ApiServer::new(api_config, driver);

    let shutdown = api_server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            shutdown.cancel();
        }
    });

    api_server.run().await?;

    info!("Driver shutdown complete");
    Ok(())
}

fn openstack_config(args: &Args) -> OpenStackConfig {
    OpenStackConfig {
        auth_url: args.os_auth_url.clone(),
        username: args.os_username.clone(),
        password: args.os_password.clone(),
        project_name: args.os_project_name.clone(),
        user_domain_name: args.os_user_domain_name.clone(),
        project_domain_name: args.os_project_domain_name.clone(),
        region: args.os_region.clone(),
        endpoint_interface: args.os_interface.clone(),
        ..Default::default()
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info", "tower=warn", "tower_http=info", "axum=info"] {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| Error::Configuration(format!("log directive {}: {}", directive, e)))?,
        );
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let (status, body) = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => (StatusCode::OK, "ok"),
                _ => (StatusCode::NOT_FOUND, "not found"),
            };
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: DriverMetrics) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let mut response = Response::new(Body::empty());
                    if req.uri().path() != "/metrics" {
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        *response.body_mut() = Body::from("not found");
                        return Ok::<_, std::convert::Infallible>(response);
                    }
                    match metrics.encode() {
                        Ok((content_type, buffer)) => {
                            if let Ok(value) = content_type.parse() {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            *response.body_mut() = Body::from(buffer);
                        }
                        Err(e) => {
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            *response.body_mut() = Body::from(e.to_string());
                        }
                    }
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
