//! HTTP question-answering endpoint.
//!
//! Exposes the answering engine over a small JSON API:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Answer a single question, optionally within a session |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Error responses carry a machine-readable code and message:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Internal failures return a generic 500 error object; exception details
//! never leak to the caller.
//!
//! # Sessions
//!
//! Each session id owns an independent conversation memory behind its own
//! async mutex, so queries within a session are processed one at a time.
//! The engine and index are shared read-only across all sessions.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::engine::AnsweringEngine;
use crate::memory::ConversationMemory;
use crate::models::Answer;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    engine: Arc<AnsweringEngine>,
    sessions: Arc<Mutex<HashMap<String, Arc<Mutex<ConversationMemory>>>>>,
    memory_budget: usize,
}

/// Start the HTTP server on the configured bind address.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = AnsweringEngine::from_config(config).await?;
    if engine.is_fallback_only() {
        println!("warning: no usable index; every answer will come from the fallback model");
    }

    let state = AppState {
        engine: Arc::new(engine),
        sessions: Arc::new(Mutex::new(HashMap::new())),
        memory_budget: config.memory.max_tokens,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ask", post(handle_ask))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("taxqa server listening on http://{}", config.server.bind);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal_error() -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: "internal error".to_string(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    /// Optional session identifier; questions sharing a session share
    /// conversation memory.
    #[serde(default)]
    session: Option<String>,
}

#[derive(Serialize)]
struct AskResponse {
    answer: String,
    provenance: &'static str,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    if request.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let session_key = request.session.unwrap_or_else(|| "default".to_string());

    // Fetch or create the session memory, then release the map lock so
    // other sessions proceed while this one answers.
    let memory = {
        let mut sessions = state.sessions.lock().await;
        sessions
            .entry(session_key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(ConversationMemory::new(state.memory_budget)))
            })
            .clone()
    };

    let mut memory = memory.lock().await;
    let answer = state.engine.answer(&request.question, &mut memory).await;

    match answer {
        Answer::Error { .. } => Err(internal_error()),
        other => Ok(Json(AskResponse {
            answer: other.text(),
            provenance: other.provenance(),
        })),
    }
}
