//! Request handlers.
//!
//! The registry is synchronous and may block for the length of a command, so
//! every call into it runs on tokio's blocking pool.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use tracing::{debug, error};

use super::types::{
    ApiError, CleanupResponse, CreateSandboxRequest, CreateSandboxResponse, ExecuteRequest,
    ExecuteResponse, StatusResponse,
};
use crate::error::SandboxError;
use crate::registry::{HealthReport, SandboxId, SandboxRegistry};

/// Shared handler state.
pub type AppState = Arc<SandboxRegistry>;

/// Runs `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!(error = %e, "Blocking task failed");
        ApiError::internal("request task failed")
    })
}

/// Unparseable ids cannot name a live sandbox.
fn parse_id(raw: &str) -> Result<SandboxId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::from(SandboxError::NotFound {
            id: raw.to_string(),
        })
    })
}

/// `POST /sandbox/create`
pub async fn create_sandbox(
    State(registry): State<AppState>,
    Json(req): Json<CreateSandboxRequest>,
) -> Result<Json<CreateSandboxResponse>, ApiError> {
    if req.player_id.trim().is_empty() {
        return Err(ApiError::bad_request("player_id must not be empty"));
    }

    let sandbox = blocking(move || {
        let lesson = req.lesson();
        match &req.seed {
            Some(seed) => registry.create_seeded(&req.player_id, lesson, seed),
            None => registry.create(&req.player_id, lesson),
        }
    })
    .await??;

    Ok(Json(CreateSandboxResponse {
        sandbox_id: sandbox.id,
        created: true,
        message: format!("Sandbox {} ready", sandbox.id),
    }))
}

/// `POST /sandbox/{id}/execute`
///
/// Validator rejections are a normal outcome for the player and come back
/// as `200` with `rejected` set.
pub async fn execute_command(
    State(registry): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let id = parse_id(&id)?;

    match blocking(move || registry.execute(id, &req.command)).await? {
        Ok(result) => Ok(Json(ExecuteResponse::from(&result))),
        Err(SandboxError::Rejected(reason)) => {
            debug!(%id, code = reason.code(), "Command rejected");
            Ok(Json(ExecuteResponse::rejected(&reason)))
        }
        Err(e) => Err(e.into()),
    }
}

/// `GET /sandbox/{id}/status`
pub async fn sandbox_status(
    State(registry): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = parse_id(&id)?;
    let (snapshot, repository) = blocking(move || {
        let snapshot = registry.status(id)?;
        let repository = registry
            .repository(id)
            .inspect_err(|e| debug!(%id, error = %e, "Repository state unavailable"))
            .ok();
        Ok::<_, SandboxError>((snapshot, repository))
    })
    .await??;

    let mut response = StatusResponse::from(snapshot);
    response.repository = repository;
    Ok(Json(response))
}

/// `POST /sandbox/{id}/cleanup`
pub async fn cleanup_sandbox(
    State(registry): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CleanupResponse>, ApiError> {
    // Destroying an unknown id is not an error
    let Ok(id) = id.parse::<SandboxId>() else {
        return Ok(Json(CleanupResponse { destroyed: false }));
    };
    let destroyed = blocking(move || registry.destroy(id)).await?;
    Ok(Json(CleanupResponse { destroyed }))
}

/// `GET /sandbox/health`
pub async fn health(
    State(registry): State<AppState>,
) -> Result<(StatusCode, Json<HealthReport>), ApiError> {
    let report = blocking(move || registry.health_check()).await?;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(report)))
}
