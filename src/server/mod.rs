//! HTTP surface over the sandbox registry.
//!
//! | Method | Path                     | Handler                         |
//! |--------|--------------------------|---------------------------------|
//! | POST   | `/sandbox/create`        | [`handler::create_sandbox`]     |
//! | POST   | `/sandbox/{id}/execute`  | [`handler::execute_command`]    |
//! | GET    | `/sandbox/{id}/status`   | [`handler::sandbox_status`]     |
//! | POST   | `/sandbox/{id}/cleanup`  | [`handler::cleanup_sandbox`]    |
//! | GET    | `/sandbox/health`        | [`handler::health`]             |
//!
//! Errors are returned as `{"error": {"code": ..., "message": ...}}`.

pub mod handler;
pub mod types;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use handler::AppState;
pub use types::{ApiError, ErrorDetail, ErrorResponse};

use crate::error::ServerError;
use crate::registry::SandboxRegistry;

/// Builds the router with all routes and middleware.
pub fn router(registry: Arc<SandboxRegistry>) -> Router {
    Router::new()
        .route("/sandbox/create", post(handler::create_sandbox))
        .route("/sandbox/health", get(handler::health))
        .route("/sandbox/{id}/execute", post(handler::execute_command))
        .route("/sandbox/{id}/status", get(handler::sandbox_status))
        .route("/sandbox/{id}/cleanup", post(handler::cleanup_sandbox))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Serves the API on `listen` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn run<F>(registry: Arc<SandboxRegistry>, listen: &str, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(listen).await.map_err(|source| ServerError::Bind {
        addr: listen.to_string(),
        source,
    })?;

    match listener.local_addr() {
        Ok(addr) => info!(%addr, "Sandbox server listening"),
        Err(_) => info!(addr = listen, "Sandbox server listening"),
    }

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)?;

    info!("Server shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::command::Program;
    use crate::config::EngineConfig;
    use crate::error::RunnerError;
    use crate::sandbox::{CancelToken, CommandResult, CommandRunner, Invocation, Termination};

    /// Echoes the raw command back on stdout.
    struct EchoRunner;

    impl CommandRunner for EchoRunner {
        fn run(&self, invocation: &Invocation, _cancel: &CancelToken) -> Result<CommandResult, RunnerError> {
            Ok(CommandResult {
                program: Some(invocation.program),
                args: invocation.args.clone(),
                stdout: format!("{}\n", invocation.raw).into_bytes(),
                exit_code: Some(0),
                duration: Duration::from_millis(3),
                termination: Termination::Exited,
                ..CommandResult::nothing_executed(invocation.raw.clone())
            })
        }

        fn runtime_present(&self, _program: Program) -> bool {
            true
        }
    }

    fn app(config: EngineConfig) -> (TempDir, Router) {
        let temp = TempDir::new().expect("failed to create temp dir");
        let registry = SandboxRegistry::with_runner(
            config.with_workspace_root(temp.path().join("root")),
            Arc::new(EchoRunner),
        )
        .expect("open registry");
        (temp, router(Arc::new(registry)))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn create(app: &Router, player: &str) -> String {
        let (status, body) = call(app, "POST", "/sandbox/create", Some(json!({"player_id": player}))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["created"], true);
        body["sandbox_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_create_execute_status_cleanup() {
        let (_temp, app) = app(EngineConfig::default());
        let id = create(&app, "alice").await;

        let (status, body) = call(
            &app,
            "POST",
            &format!("/sandbox/{id}/execute"),
            Some(json!({"command": "git status"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"], "git status\n");
        assert_eq!(body["success"], true);
        assert_eq!(body["executed"], true);
        assert_eq!(body["exit_code"], 0);
        assert!(body.get("rejected").is_none());

        let (status, body) = call(&app, "GET", &format!("/sandbox/{id}/status"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sandbox_id"], id.as_str());
        assert_eq!(body["owner"], "alice");
        assert_eq!(body["status"], "active");
        assert_eq!(body["history"].as_array().unwrap().len(), 1);
        assert!(body.get("workspace").is_none());
        // The echo runner never answers `true` to rev-parse
        assert_eq!(body["repository"]["is_repository"], false);

        let (status, body) = call(&app, "POST", &format!("/sandbox/{id}/cleanup"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["destroyed"], true);

        let (_, body) = call(&app, "POST", &format!("/sandbox/{id}/cleanup"), None).await;
        assert_eq!(body["destroyed"], false);

        let (status, body) = call(&app, "GET", &format!("/sandbox/{id}/status"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_rejected_command_is_ok_response() {
        let (_temp, app) = app(EngineConfig::default());
        let id = create(&app, "alice").await;

        let (status, body) = call(
            &app,
            "POST",
            &format!("/sandbox/{id}/execute"),
            Some(json!({"command": "git status; rm -rf /"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["executed"], false);
        assert_eq!(body["rejected"], "disallowed_syntax");
    }

    #[tokio::test]
    async fn test_quota_exceeded_is_429() {
        let (_temp, app) = app(EngineConfig::default().with_max_sandboxes_per_owner(1));
        create(&app, "alice").await;

        let (status, body) = call(&app, "POST", "/sandbox/create", Some(json!({"player_id": "alice"}))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "quota_exceeded");

        create(&app, "bob").await;
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let (_temp, app) = app(EngineConfig::default());

        for id in [uuid::Uuid::new_v4().to_string(), "not-a-uuid".to_string()] {
            let (status, body) = call(
                &app,
                "POST",
                &format!("/sandbox/{id}/execute"),
                Some(json!({"command": "ls"})),
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["error"]["code"], "not_found");
        }
    }

    #[tokio::test]
    async fn test_empty_player_id_is_bad_request() {
        let (_temp, app) = app(EngineConfig::default());
        let (status, body) = call(&app, "POST", "/sandbox/create", Some(json!({"player_id": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_health() {
        let (_temp, app) = app(EngineConfig::default());
        let (status, body) = call(&app, "GET", "/sandbox/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["active_sandboxes"], 0);
    }

    #[tokio::test]
    async fn test_invalid_seed_is_rejected() {
        let (_temp, app) = app(EngineConfig::default());
        let (status, body) = call(
            &app,
            "POST",
            "/sandbox/create",
            Some(json!({
                "player_id": "alice",
                "challenge_id": "branching",
                "seed": {"commits": [{"message": "x", "files": {"../escape": "x"}}]}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "seed_failed");
    }
}
