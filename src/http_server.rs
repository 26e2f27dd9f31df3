//! HTTP server implementation using Axum.

use crate::pipeline::{Language, SubmitError, Submission};
use crate::state::AppState;
use crate::transport;
use axum::{
    extract::{rejection::JsonRejection, Query, State, WebSocketUpgrade},
    http::{header, HeaderValue, Method, StatusCode},
    response::Response,
    routing::{any, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

// Request/Response types
#[derive(Deserialize)]
struct RunRequest {
    #[serde(default)]
    input: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    language: Language,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResponse {
    pub id: String,
    pub errors: Vec<String>,
}

impl RunResponse {
    fn accepted(id: String) -> Self {
        Self {
            id,
            errors: Vec::new(),
        }
    }

    fn rejected(errors: Vec<String>) -> Self {
        Self {
            id: String::new(),
            errors,
        }
    }
}

#[derive(Deserialize)]
struct AttachParams {
    id: Option<String>,
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);
    let cors = match state.frontend_url.as_deref().map(HeaderValue::from_str) {
        Some(Ok(origin)) => cors.allow_origin(origin),
        Some(Err(e)) => {
            warn!(error = %e, "Invalid frontend url; cross-origin requests will be refused");
            cors
        }
        None => cors.allow_origin(Any),
    };

    Router::new()
        .route("/v1", any(method_not_allowed))
        .route(
            "/v1/run",
            post(submit_run).get(attach_run).fallback(method_not_allowed),
        )
        .route("/v1/version", get(version).fallback(method_not_allowed))
        // Health check
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given address with the provided state.
pub async fn run_server(host: &str, port: u16, state: AppState) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "OK"
}

async fn method_not_allowed() -> (StatusCode, Json<Value>) {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "Method Not Allowed" })),
    )
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "message": "API Version 1",
    }))
}

async fn submit_run(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> (StatusCode, Json<RunResponse>) {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(RunResponse::rejected(vec![rejection.body_text()])),
            )
        }
    };

    let submission = Submission {
        input: req.input,
        args: req.args,
        language: req.language,
    };
    match state.pipeline.submit(submission).await {
        Ok(key) => {
            info!("POST /v1/run - session {}", key);
            (
                StatusCode::CREATED,
                Json(RunResponse::accepted(key.to_string())),
            )
        }
        Err(SubmitError::Validation(reason)) => (
            StatusCode::BAD_REQUEST,
            Json(RunResponse::rejected(vec![reason])),
        ),
        Err(e) => {
            error!(error = %e, "POST /v1/run - could not create session");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RunResponse::rejected(vec![e.to_string()])),
            )
        }
    }
}

async fn attach_run(
    State(state): State<AppState>,
    Query(params): Query<AttachParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| transport::serve(state, socket, params.id))
}
