//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::deploy::fsm::DeploymentStatus;
use crate::errors::PipelineError;
use crate::models::deployment::{Deployment, DeploymentRequest, HaltPolicy};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Maps engine errors onto HTTP status codes
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::ValidationError(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::InvalidTransition(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub active_deployments: usize,
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "fleetpipe".to_string(),
        version: version.version,
        active_deployments: state.controller.active_count(),
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Submit response
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: String,
    pub status: DeploymentStatus,
}

/// Submit a deployment
pub async fn submit_handler(
    State(state): State<Arc<ServerState>>,
    request: Result<Json<DeploymentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = request.map_err(|rejection| {
        PipelineError::ValidationError(format!(
            "Malformed deployment request: {}",
            rejection.body_text()
        ))
    })?;
    let id = state.controller.submit(request).await?;
    info!("Deployment {} submitted over HTTP", id);

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            id,
            status: DeploymentStatus::InProgress,
        }),
    ))
}

/// One line of the deployment listing
#[derive(Debug, Serialize)]
pub struct DeploymentSummary {
    pub id: String,
    pub status: DeploymentStatus,
    pub artifact_version: String,
    pub halt_policy: HaltPolicy,
    pub hosts: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Deployment> for DeploymentSummary {
    fn from(deployment: &Deployment) -> Self {
        Self {
            id: deployment.id.clone(),
            status: deployment.status(),
            artifact_version: deployment.artifact.version.clone(),
            halt_policy: deployment.halt_policy,
            hosts: deployment.target_hosts.len(),
            created_at: deployment.created_at,
            finished_at: deployment.finished_at,
        }
    }
}

/// Deployments response
#[derive(Debug, Serialize)]
pub struct DeploymentsResponse {
    pub deployments: Vec<DeploymentSummary>,
    pub total: usize,
}

/// List deployments
pub async fn list_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ApiError> {
    let deployments: Vec<DeploymentSummary> = state
        .controller
        .list()
        .await?
        .iter()
        .map(DeploymentSummary::from)
        .collect();
    let total = deployments.len();

    Ok(Json(DeploymentsResponse { deployments, total }))
}

/// Full deployment snapshot
pub async fn status_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state.controller.status(&id).await?;
    Ok(Json(deployment))
}

/// Abort response
#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub id: String,
    pub abort_requested: bool,
}

/// Request cancellation of a deployment
pub async fn abort_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.controller.abort(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AbortResponse {
            id,
            abort_requested: true,
        }),
    ))
}
