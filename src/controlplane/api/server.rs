//! API Server
//!
//! Runs the REST server for the node driver and owns the shutdown token that
//! every in-flight request derives its cancellation from.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::rest::RestRouter;
use crate::controlplane::CinderDriver;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Deadline for a single request, waits included
    pub request_timeout: Duration,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            // Long enough for the full attach wait.
            request_timeout: Duration::from_secs(120),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST server for the driver
pub struct ApiServer {
    config: ApiServerConfig,
    driver: Arc<CinderDriver>,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, driver: Arc<CinderDriver>) -> Self {
        Self {
            config,
            driver,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled when the server shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the API server until shutdown
    pub async fn run(&self) -> Result<()> {
        let app = RestRouter::new(
            self.driver.clone(),
            self.shutdown.clone(),
            self.config.request_timeout,
        )
        .build();

        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;

        info!("REST API listening on {}", self.config.rest_addr);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown; in-flight waits are cancelled
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
