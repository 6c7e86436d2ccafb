//! HTTP API served by `weft serve`.
//!
//! JSON envelope over the engine's contracts: challenge-response login,
//! instance launch/cancel/kill, queue statistics, counters, and the
//! event subscription surface (subscribe / long-poll / ack). Errors come
//! back as `{"status":"KO","code":...,"message":...}`.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;

use weft_core::error::EngineError;
use weft_core::events::EventType;
use weft_core::instance::LaunchOptions;
use weft_core::runtime::Runtime;
use weft_core::workflow::Workflow;
use weft_db::queries::{instances as instance_db, users as user_db};

use crate::auth;

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "INSUFFICIENT_RIGHTS",
            message: "authentication required".to_owned(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: format!("{err:#}"),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match err.code() {
            "UNKNOWN_WORKFLOW" | "UNKNOWN_QUEUE" | "UNKNOWN_NOTIFICATION" => StatusCode::NOT_FOUND,
            "INSUFFICIENT_RIGHTS" => StatusCode::UNAUTHORIZED,
            "DB_ERROR" | "INTERNAL_ERROR" | "IO_ERROR" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "status": "KO",
            "code": self.code,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiState {
    runtime: Arc<Runtime>,
    pool: PgPool,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    challenges: Arc<Mutex<HashMap<String, String>>>,
    next_subscriber: Arc<AtomicU64>,
}

#[derive(Clone)]
struct Session {
    #[allow(dead_code)]
    login: String,
    subscriber: u64,
}

impl ApiState {
    pub fn new(runtime: Arc<Runtime>, pool: PgPool) -> Self {
        Self {
            runtime,
            pool,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            challenges: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: Arc::new(AtomicU64::new(1)),
        }
    }

    fn session(&self, headers: &HeaderMap) -> Result<Session, ApiError> {
        self.runtime
            .stats
            .api_queries
            .fetch_add(1, Ordering::Relaxed);

        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(ApiError::unauthorized)?;

        self.sessions
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or_else(|| {
                self.runtime
                    .stats
                    .api_exceptions
                    .fetch_add(1, Ordering::Relaxed);
                ApiError::unauthorized()
            })
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/auth/challenge", post(auth_challenge))
        .route("/auth/response", post(auth_response))
        .route("/instances", get(list_instances).post(launch_instance))
        .route("/instances/{id}", get(get_instance))
        .route("/instances/{id}/cancel", post(cancel_instance))
        .route("/instances/{id}/kill", post(kill_instance))
        .route("/queues", get(queue_stats))
        .route("/statistics", get(statistics))
        .route("/events/subscribe", post(subscribe_events))
        .route("/events", get(poll_events))
        .route("/events/ack", post(ack_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Auth handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChallengeRequest {
    login: String,
}

#[derive(Serialize)]
struct ChallengeResponse {
    nonce: String,
}

async fn auth_challenge(
    State(state): State<ApiState>,
    Json(request): Json<ChallengeRequest>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    let nonce = auth::generate_nonce();
    state
        .challenges
        .lock()
        .unwrap()
        .insert(request.login, nonce.clone());
    Ok(Json(ChallengeResponse { nonce }))
}

#[derive(Deserialize)]
struct LoginRequest {
    login: String,
    /// `HMAC-SHA1(stored_password_hash, nonce)` hex.
    response: String,
}

#[derive(Serialize)]
struct LoginResponse {
    status: &'static str,
    token: String,
}

async fn auth_response(
    State(state): State<ApiState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let nonce = state
        .challenges
        .lock()
        .unwrap()
        .remove(&request.login)
        .ok_or_else(ApiError::unauthorized)?;

    let stored = user_db::get_password_hash(&state.pool, &request.login)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(ApiError::unauthorized)?;

    if !auth::verify_response(&stored, &nonce, &request.response) {
        state
            .runtime
            .stats
            .api_exceptions
            .fetch_add(1, Ordering::Relaxed);
        return Err(ApiError::unauthorized());
    }

    let token = uuid::Uuid::new_v4().simple().to_string();
    let subscriber = state.next_subscriber.fetch_add(1, Ordering::SeqCst);
    state.sessions.lock().unwrap().insert(
        token.clone(),
        Session {
            login: request.login,
            subscriber,
        },
    );

    Ok(Json(LoginResponse {
        status: "OK",
        token,
    }))
}

// ---------------------------------------------------------------------------
// Instance handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LaunchRequest {
    workflow: String,
    #[serde(default)]
    parameters: HashMap<String, String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Serialize)]
struct LaunchResponse {
    status: &'static str,
    instance_id: i64,
}

async fn launch_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<LaunchRequest>,
) -> Result<Json<LaunchResponse>, ApiError> {
    state.session(&headers)?;

    let workflow = Workflow::load(&state.pool, &request.workflow).await?;
    let parameters: Vec<(String, String)> = request.parameters.into_iter().collect();

    let instance_id = state
        .runtime
        .engine
        .launch(
            &workflow,
            &parameters,
            LaunchOptions {
                host: request.host,
                user: request.user,
                schedule_id: None,
            },
        )
        .await?;

    Ok(Json(LaunchResponse {
        status: "OK",
        instance_id,
    }))
}

async fn list_instances(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.session(&headers)?;
    let rows = instance_db::list_instances(&state.pool, 100)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(serde_json::json!({ "status": "OK", "instances": rows })))
}

async fn get_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.session(&headers)?;
    let row = instance_db::get_instance(&state.pool, id)
        .await
        .map_err(ApiError::internal)?
        .ok_or(ApiError {
            status: StatusCode::NOT_FOUND,
            code: "UNKNOWN_INSTANCE",
            message: format!("no workflow instance {id}"),
        })?;
    Ok(Json(serde_json::json!({ "status": "OK", "instance": row })))
}

#[derive(Deserialize, Default)]
struct CancelRequest {
    #[serde(default)]
    kill: bool,
}

async fn cancel_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    request: Option<Json<CancelRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.session(&headers)?;
    let kill = request.map(|Json(r)| r.kill).unwrap_or(false);
    state.runtime.engine.cancel(id, kill).await?;
    Ok(Json(serde_json::json!({ "status": "OK" })))
}

#[derive(Deserialize, Default)]
struct KillRequest {
    #[serde(default)]
    task: Option<String>,
}

async fn kill_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    request: Option<Json<KillRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.session(&headers)?;
    let task = request.and_then(|Json(r)| r.task);
    let killed = state.runtime.engine.kill(id, task.as_deref()).await?;
    Ok(Json(serde_json::json!({ "status": "OK", "killed": killed })))
}

// ---------------------------------------------------------------------------
// Introspection handlers
// ---------------------------------------------------------------------------

async fn queue_stats(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.session(&headers)?;
    let stats = state.runtime.queue_pool.queue_stats();
    Ok(Json(serde_json::json!({ "status": "OK", "queues": stats })))
}

async fn statistics(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.session(&headers)?;
    let snapshot = state.runtime.stats.snapshot();
    Ok(Json(serde_json::json!({ "status": "OK", "statistics": snapshot })))
}

// ---------------------------------------------------------------------------
// Event handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SubscribeRequest {
    /// Symbolic event type, e.g. "INSTANCE_TERMINATED".
    event_type: String,
    #[serde(default)]
    object_filter: u64,
    #[serde(default)]
    correlation: i64,
    #[serde(default)]
    api_cmd: String,
}

async fn subscribe_events(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<SubscribeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state.session(&headers)?;

    let event_type = EventType::from_str(&request.event_type).map_err(|message| ApiError {
        status: StatusCode::BAD_REQUEST,
        code: "UNKNOWN_TYPE",
        message,
    })?;

    state.runtime.events.subscribe(
        session.subscriber,
        event_type,
        request.object_filter,
        request.correlation,
        request.api_cmd,
    );
    Ok(Json(serde_json::json!({ "status": "OK" })))
}

#[derive(Deserialize)]
struct PollQuery {
    /// Long-poll timeout; 0 returns immediately.
    #[serde(default)]
    wait_ms: u64,
}

async fn poll_events(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state.session(&headers)?;

    let mut events = state.runtime.events.get(session.subscriber);
    if events.is_empty() && query.wait_ms > 0 {
        let waker = state.runtime.events.register(session.subscriber);
        let _ = tokio::time::timeout(Duration::from_millis(query.wait_ms), waker.notified()).await;
        events = state.runtime.events.get(session.subscriber);
    }

    Ok(Json(serde_json::json!({ "status": "OK", "events": events })))
}

#[derive(Deserialize)]
struct AckRequest {
    event_id: u64,
}

async fn ack_events(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<AckRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state.session(&headers)?;
    state.runtime.events.ack(session.subscriber, request.event_id);
    Ok(Json(serde_json::json!({ "status": "OK" })))
}
