use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::db::Db;
use crate::error::BridgeError;
use crate::service::{ControlService, TelemetryService, UpdateOutcome};
use crate::status::SharedStatus;

const INDEX_HTML: &str = include_str!("ui/index.html");

#[derive(Clone)]
pub struct AppState {
    pub control: ControlService,
    pub telemetry: TelemetryService,
    pub status: SharedStatus,
    pub db: Db,
    pub default_window: u32,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route(
            "/api/control",
            get(get_control)
                .put(update_control)
                .post(update_control)
                .fallback(control_method_not_allowed),
        )
        .route(
            "/api/telemetry",
            get(get_telemetry).fallback(read_only_method_not_allowed),
        )
        .route(
            "/api/status",
            get(api_status).fallback(read_only_method_not_allowed),
        )
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn get_control(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.control.handle_fetch().await)
}

async fn update_control(State(state): State<AppState>, body: String) -> Response {
    match state.control.handle_update(&body).await {
        Ok(UpdateOutcome::Accepted(s)) => (StatusCode::OK, Json(s)).into_response(),
        Ok(UpdateOutcome::Rejected(reason)) => error_response(StatusCode::BAD_REQUEST, &reason),
        Err(e) => storage_failure("control update", e),
    }
}

async fn get_telemetry(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let count = match params.get("count") {
        None => state.default_window,
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(n) => n,
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "count must be a non-negative integer",
                )
            }
        },
    };

    match state.telemetry.handle_recent(count).await {
        Ok(series) => Json(series).into_response(),
        Err(e) => storage_failure("telemetry query", e),
    }
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let stored = state.db.count().await.ok();
    let st = state.status.read().await;
    Json(st.to_status(stored))
}

async fn control_method_not_allowed() -> Response {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "Use GET, PUT or POST")
}

async fn read_only_method_not_allowed() -> Response {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "Use GET")
}

fn storage_failure(what: &str, err: BridgeError) -> Response {
    error!("{what} failed: {err}");
    let status = match err {
        BridgeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, "storage unavailable, try again later")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("web ui listening on http://{addr}");
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
