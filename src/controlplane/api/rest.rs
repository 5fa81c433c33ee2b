//! REST API Handlers
//!
//! JSON over HTTP for every driver operation: volume CRUD, attach/detach and
//! their waits, device resolution, and node stage/publish.

use crate::controlplane::CinderDriver;
use crate::domain::ports::CreateVolumeRequest;
use crate::error::{Error, ErrorKind};
use crate::node::{PublishRequest, StageRequest};
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Volume list query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListVolumesQuery {
    #[serde(default)]
    pub name: Option<String>,
}

/// Attach response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachResponse {
    pub device_id: String,
}

/// Device path response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePathResponse {
    pub device_path: String,
}

/// Unstage request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnstageRequest {
    pub staging_path: String,
}

/// Unpublish request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpublishRequest {
    pub target_path: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

/// HTTP status for an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InvalidState => StatusCode::PRECONDITION_FAILED,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::EmptyResult => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::BackendError => StatusCode::BAD_GATEWAY,
    }
}

/// Driver error rendered as `{error, message}`
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        (
            status_for(kind),
            Json(ApiErrorResponse {
                error: kind.to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    driver: Arc<CinderDriver>,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl RestRouter {
    pub fn new(
        driver: Arc<CinderDriver>,
        shutdown: CancellationToken,
        request_timeout: Duration,
    ) -> Self {
        Self {
            driver,
            shutdown,
            request_timeout,
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            driver: self.driver,
            shutdown: self.shutdown,
            request_timeout: self.request_timeout,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes", post(create_volume).get(list_volumes))
            .route("/v1/volumes/:id", get(get_volume).delete(delete_volume))
            .route("/v1/volumes/:id/device", get(get_device_path))
            // Attachment endpoints
            .route(
                "/v1/instances/:instance/volumes/:id",
                post(attach_volume).delete(detach_volume),
            )
            .route(
                "/v1/instances/:instance/volumes/:id/attached",
                get(wait_attached),
            )
            .route(
                "/v1/instances/:instance/volumes/:id/detached",
                get(wait_detached),
            )
            .route(
                "/v1/instances/:instance/volumes/:id/disk-path",
                get(get_attachment_disk_path),
            )
            // Node endpoints
            .route("/v1/node/info", get(node_info))
            .route("/v1/node/stage", post(node_stage))
            .route("/v1/node/unstage", post(node_unstage))
            .route("/v1/node/publish", post(node_publish))
            .route("/v1/node/unpublish", post(node_unpublish))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    driver: Arc<CinderDriver>,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl AppState {
    /// Token for one request: cancelled on shutdown, on timeout, or when the
    /// returned guard drops at the end of the handler
    fn request_token(&self) -> (CancellationToken, DropGuard) {
        let token = self.shutdown.child_token();
        let timer = token.clone();
        let timeout = self.request_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    debug!("Request deadline of {:?} reached", timeout);
                    timer.cancel();
                }
            }
        });
        let guard = token.clone().drop_guard();
        (token, guard)
    }
}

// =============================================================================
// Volume Handlers
// =============================================================================

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> ApiResult<impl IntoResponse> {
    info!("Creating volume: {}", request.name);
    let volume = state.driver.create_volume(&request).await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

async fn list_volumes(
    State(state): State<AppState>,
    Query(query): Query<ListVolumesQuery>,
) -> ApiResult<impl IntoResponse> {
    let volumes = state.driver.list_volumes(query.name.as_deref()).await?;
    Ok(Json(volumes))
}

async fn get_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.driver.get_volume(&id).await?))
}

async fn delete_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    info!("Deleting volume: {}", id);
    state.driver.delete_volume(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_device_path(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (cancel, _guard) = state.request_token();
    let device_path = state.driver.get_device_path(&id, &cancel).await?;
    Ok(Json(DevicePathResponse { device_path }))
}

// =============================================================================
// Attachment Handlers
// =============================================================================

async fn attach_volume(
    State(state): State<AppState>,
    Path((instance, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let device_id = state.driver.attach_volume(&instance, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(AttachResponse { device_id })))
}

async fn wait_attached(
    State(state): State<AppState>,
    Path((instance, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let (cancel, _guard) = state.request_token();
    state
        .driver
        .wait_disk_attached(&instance, &id, &cancel)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn detach_volume(
    State(state): State<AppState>,
    Path((instance, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.driver.detach_volume(&instance, &id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn wait_detached(
    State(state): State<AppState>,
    Path((instance, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let (cancel, _guard) = state.request_token();
    state
        .driver
        .wait_disk_detached(&instance, &id, &cancel)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_attachment_disk_path(
    State(state): State<AppState>,
    Path((instance, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let device_path = state
        .driver
        .get_attachment_disk_path(&instance, &id)
        .await?;
    Ok(Json(DevicePathResponse { device_path }))
}

// =============================================================================
// Node Handlers
// =============================================================================

async fn node_info(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.driver.node_info().await?))
}

async fn node_stage(
    State(state): State<AppState>,
    Json(request): Json<StageRequest>,
) -> ApiResult<impl IntoResponse> {
    let (cancel, _guard) = state.request_token();
    state.driver.node_stage(&request, &cancel).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn node_unstage(
    State(state): State<AppState>,
    Json(request): Json<UnstageRequest>,
) -> ApiResult<impl IntoResponse> {
    state.driver.node_unstage(&request.staging_path).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn node_publish(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<impl IntoResponse> {
    state.driver.node_publish(&request).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn node_unpublish(
    State(state): State<AppState>,
    Json(request): Json<UnpublishRequest>,
) -> ApiResult<impl IntoResponse> {
    state.driver.node_unpublish(&request.target_path).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Health Handlers
// =============================================================================

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.shutdown.is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "ready")
    }
}
