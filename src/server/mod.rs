pub mod generate;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dashmap::DashMap;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::credits::CreditGate;
use crate::db::{DbHandle, PrefabDb};
use crate::engine::EngineLauncher;
use crate::errors::GenerateError;
use crate::models::CreditType;
use crate::sandbox::provider::HttpSandboxProvider;
use crate::sandbox::{LifecycleManager, SandboxProvider};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub credits: CreditGate,
    pub provider: Arc<dyn SandboxProvider>,
    pub lifecycle: LifecycleManager,
    pub launcher: EngineLauncher,
    pub config: ServerConfig,
    /// Per-sandbox lease: generations against the same sandbox are
    /// serialized because its filesystem and dev server are shared state.
    pub sandbox_leases: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl AppState {
    pub fn new(db: PrefabDb, provider: Arc<dyn SandboxProvider>, config: ServerConfig) -> Self {
        let db = DbHandle::new(db);
        Self {
            credits: CreditGate::new(db.clone()),
            lifecycle: LifecycleManager::new(provider.clone(), config.engine.preview_port),
            launcher: EngineLauncher::new(config.engine.clone()),
            db,
            provider,
            config,
            sandbox_leases: DashMap::new(),
        }
    }

    /// Lease guarding all mutation of one sandbox.
    pub fn sandbox_lease(&self, sandbox_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.sandbox_leases
            .entry(sandbox_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

/// Pre-stream failures become plain JSON error responses. Once an SSE
/// stream has begun, errors go in-band instead (see `generate.rs`).
pub struct ApiError(pub GenerateError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, needs_upgrade) = match &self.0 {
            GenerateError::AuthenticationRequired => (StatusCode::UNAUTHORIZED, false),
            GenerateError::InsufficientCredits { .. } => (StatusCode::PAYMENT_REQUIRED, true),
            GenerateError::ProjectLimitReached { .. } => (StatusCode::FORBIDDEN, true),
            GenerateError::SandboxNotFound { .. } => (StatusCode::NOT_FOUND, false),
            GenerateError::SandboxUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, false),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, false),
        };
        let mut body = serde_json::json!({ "error": self.0.to_string() });
        if needs_upgrade {
            body["needsUpgrade"] = serde_json::Value::Bool(true);
        }
        (status, Json(body)).into_response()
    }
}

impl From<GenerateError> for ApiError {
    fn from(err: GenerateError) -> Self {
        Self(err)
    }
}

/// User identity from the session-auth collaborator, surfaced as a header.
pub fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or(ApiError(GenerateError::AuthenticationRequired))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/generate", post(generate::generate))
        .route("/api/chat-continue", post(generate::chat_continue))
        .route("/api/projects", get(list_projects))
        .route("/api/projects/{id}", get(get_project))
        .route("/api/credits/grant", post(grant_credits))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_projects(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user(&headers)?;
    let projects = state
        .db
        .call(move |db| db.list_projects(&user_id))
        .await
        .map_err(|e| ApiError(GenerateError::Database(e)))?;
    Ok(Json(projects))
}

async fn get_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;
    let project = state
        .db
        .call(move |db| db.get_project(id))
        .await
        .map_err(|e| ApiError(GenerateError::Database(e)))?;
    match project {
        Some(project) if project.user_id == user_id => Ok(Json(project).into_response()),
        _ => Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Project not found" })),
        )
            .into_response()),
    }
}

#[derive(Deserialize)]
struct GrantRequest {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "creditType")]
    credit_type: CreditType,
    amount: i64,
}

/// Dev/ops seeding endpoint. Billing webhooks are the real credit source;
/// this exists for local development and tests.
async fn grant_credits(
    State(state): State<SharedState>,
    Json(req): Json<GrantRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |db| db.grant_credits(&req.user_id, req.credit_type, req.amount))
        .await
        .map_err(|e| ApiError(GenerateError::Database(e)))?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Startup ───────────────────────────────────────────────────────────

pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = PrefabDb::new(&config.db_path).context("Failed to initialize database")?;
    let provider: Arc<dyn SandboxProvider> =
        Arc::new(HttpSandboxProvider::new(config.provider_url.clone()));

    let dev_mode = config.dev_mode;
    let port = config.port;
    let state = Arc::new(AppState::new(db, provider, config));

    let mut app = build_router(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("prefab listening at http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::sandbox::MockSandboxProvider;

    fn test_state() -> SharedState {
        let db = PrefabDb::new_in_memory().unwrap();
        let provider = MockSandboxProvider::new();
        Arc::new(AppState::new(db, provider, ServerConfig::default()))
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn projects_require_auth() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn projects_listed_per_user() {
        let state = test_state();
        state
            .db
            .call(|db| db.create_project("u1", "app", "a prompt").map(|_| ()))
            .await
            .unwrap();
        let app = build_router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects")
                    .header("x-user-id", "u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let projects: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(projects.as_array().unwrap().len(), 1);
        assert_eq!(projects[0]["name"], "app");
    }

    #[tokio::test]
    async fn foreign_project_is_not_found() {
        let state = test_state();
        state
            .db
            .call(|db| db.create_project("owner", "app", "p").map(|_| ()))
            .await
            .unwrap();
        let app = build_router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects/1")
                    .header("x-user-id", "intruder")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn grant_endpoint_seeds_credits() {
        let state = test_state();
        let app = build_router(state.clone());

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/credits/grant")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"userId": "u1", "creditType": "message", "amount": 5})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let balance = state
            .db
            .call(|db| db.get_balance("u1", CreditType::Message))
            .await
            .unwrap();
        assert_eq!(balance, 5);
    }

    #[test]
    fn api_error_statuses() {
        let resp = ApiError(GenerateError::AuthenticationRequired).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = ApiError(GenerateError::InsufficientCredits {
            credit_type: "message".into(),
            needed: 1,
            available: 0,
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);

        let resp = ApiError(GenerateError::SandboxNotFound { id: "x".into() }).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
