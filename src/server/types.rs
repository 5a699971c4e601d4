//! Request and response bodies for the HTTP surface, plus error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, ValidationError};
use crate::registry::{HistoryEntry, RepoSeed, RepoState, SandboxId, SandboxSnapshot, SandboxStatus};
use crate::sandbox::CommandResult;

/// Body of `POST /sandbox/create`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSandboxRequest {
    pub player_id: String,
    #[serde(default)]
    pub lesson_id: Option<String>,
    /// Accepted as an alias for `lesson_id`.
    #[serde(default)]
    pub challenge_id: Option<String>,
    /// Initial repository state.
    #[serde(default)]
    pub seed: Option<RepoSeed>,
}

impl CreateSandboxRequest {
    /// The lesson identifier, from either field.
    #[must_use]
    pub fn lesson(&self) -> Option<&str> {
        self.lesson_id.as_deref().or(self.challenge_id.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSandboxResponse {
    pub sandbox_id: SandboxId,
    pub created: bool,
    pub message: String,
}

/// Body of `POST /sandbox/{id}/execute`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub output: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
    pub truncated: bool,
    pub timed_out: bool,
    /// False for blank or rejected input.
    pub executed: bool,
    /// Validator code when the command was refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

impl From<&CommandResult> for ExecuteResponse {
    fn from(result: &CommandResult) -> Self {
        Self {
            output: result.stdout_text(),
            stderr: result.stderr_text(),
            success: result.success(),
            exit_code: result.exit_code,
            execution_time_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            truncated: result.truncated(),
            timed_out: result.timed_out(),
            executed: result.executed(),
            rejected: None,
        }
    }
}

impl ExecuteResponse {
    /// Response for a command the validator refused.
    #[must_use]
    pub fn rejected(err: &ValidationError) -> Self {
        Self {
            output: String::new(),
            stderr: err.to_string(),
            success: false,
            exit_code: None,
            execution_time_ms: 0,
            truncated: false,
            timed_out: false,
            executed: false,
            rejected: Some(err.code().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub sandbox_id: SandboxId,
    pub status: SandboxStatus,
    pub owner: String,
    pub lesson_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub busy: bool,
    pub history: Vec<HistoryEntry>,
    /// Absent while a command is running or when git could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepoState>,
}

impl From<SandboxSnapshot> for StatusResponse {
    fn from(snapshot: SandboxSnapshot) -> Self {
        let SandboxSnapshot {
            sandbox,
            busy,
            history,
        } = snapshot;
        Self {
            sandbox_id: sandbox.id,
            status: sandbox.status,
            owner: sandbox.owner,
            lesson_id: sandbox.lesson_id,
            created_at: sandbox.created_at,
            last_activity_at: sandbox.last_activity_at,
            busy,
            history,
            repository: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub destroyed: bool,
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// An error on its way to becoming an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Stable error code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        self.code
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        let (status, code) = match &err {
            SandboxError::QuotaExceeded { .. } => (StatusCode::TOO_MANY_REQUESTS, "quota_exceeded"),
            SandboxError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            SandboxError::Busy { .. } => (StatusCode::CONFLICT, "busy"),
            SandboxError::Rejected(v) => (StatusCode::UNPROCESSABLE_ENTITY, v.code()),
            SandboxError::Seed { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "seed_failed"),
            SandboxError::Allocation(_) => (StatusCode::SERVICE_UNAVAILABLE, "allocation_failed"),
            SandboxError::Spawn(_) => (StatusCode::INTERNAL_SERVER_ERROR, "spawn_failed"),
        };

        // Include the source so operators see the underlying cause
        let message = match std::error::Error::source(&err) {
            Some(source) if !err.is_player_error() => format!("{err}: {source}"),
            _ => err.to_string(),
        };

        Self::new(status, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}
