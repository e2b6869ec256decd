//! Axum HTTP/SSE transport.
//!
//! Exposes the gateway over a small JSON API. Execution results are always
//! structured bodies; the status code encodes the failure class (400
//! validation, 403 disabled, 404 unknown tool, 500 execution error) and
//! `/health` encodes the aggregate state (200/207/503).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::error::{ErrorKind, TransportError};
use crate::gateway::{DispatchError, Gateway};
use crate::health::{HealthMonitor, HealthStatus};
use crate::types::ToolRequest;

/// How often `/events` pushes a health snapshot to each subscriber.
const EVENTS_PUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Shared state for all handlers.
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub health: Arc<HealthMonitor>,
    pub prometheus: Option<PrometheusHandle>,
}

/// Build the gateway router.
pub fn app(state: Arc<AppState>) -> Router {
    // CORS: only localhost/127.0.0.1 origins are allowed, since the gateway
    // is a local-first service behind the orchestrator.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin, _| {
            origin.to_str().is_ok_and(|o| {
                o.strip_prefix("http://")
                    .map(|rest| rest.split_once(':').map(|(host, _)| host).unwrap_or(rest))
                    .is_some_and(|host| host == "localhost" || host == "127.0.0.1")
            })
        }))
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(AllowHeaders::list([header::CONTENT_TYPE]));

    Router::new()
        .route("/health", get(health_handler))
        .route("/tools", get(tools_handler))
        .route("/tools/{name}/execute", post(execute_handler))
        .route("/tools/{name}/enable", post(enable_handler))
        .route("/tools/{name}/disable", post(disable_handler))
        .route("/events", get(events_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

/// Start the HTTP server; resolves once the listener is bound.
///
/// Returns the bound address (useful when binding to port 0) and a handle
/// that completes when the server has shut down.
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), TransportError> {
    let listener =
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::StartupFailed {
                name: "http".to_string(),
                reason: format!("failed to bind {addr}: {e}"),
            })?;
    let bound = listener
        .local_addr()
        .map_err(|e| TransportError::StartupFailed {
            name: "http".to_string(),
            reason: format!("failed to read local addr: {e}"),
        })?;

    let router = app(state);
    let handle = tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            tracing::info!("http transport shutting down");
        });
        if let Err(e) = serve.await {
            tracing::error!("http transport error: {e}");
        }
    });

    tracing::info!(%bound, "http transport listening");
    Ok((bound, handle))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let health = state.health.check().await;
    let status = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::MULTI_STATUS,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(health)).into_response()
}

async fn tools_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.gateway.tool_statuses()).into_response()
}

async fn execute_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<ToolRequest>,
) -> Response {
    match state.gateway.execute(&name, &request).await {
        Ok(result) => {
            let status = match result.error_kind {
                Some(ErrorKind::ValidationError) => StatusCode::BAD_REQUEST,
                Some(ErrorKind::ExecutionError) | Some(ErrorKind::NotFound) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                _ => StatusCode::OK,
            };
            (status, Json(result)).into_response()
        }
        Err(e) => dispatch_error(e),
    }
}

async fn enable_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    toggle(&state, &name, true)
}

async fn disable_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    toggle(&state, &name, false)
}

fn toggle(state: &AppState, name: &str, enabled: bool) -> Response {
    match state.gateway.set_enabled(name, enabled) {
        Ok(()) => Json(json!({ "tool": name, "enabled": enabled })).into_response(),
        Err(e) => dispatch_error(e),
    }
}

async fn events_handler(State(state): State<Arc<AppState>>) -> Response {
    let health = Arc::clone(&state.health);
    let mut interval = tokio::time::interval(EVENTS_PUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let stream = tokio_stream::wrappers::IntervalStream::new(interval)
        .then(move |_| {
            let health = Arc::clone(&health);
            async move {
                let snapshot = match health.last_snapshot() {
                    Some(snapshot) => snapshot,
                    None => health.check().await,
                };
                Ok::<_, std::convert::Infallible>(
                    Event::default()
                        .event("health")
                        .data(serde_json::to_string(&snapshot).unwrap_or_default()),
                )
            }
        })
        .boxed();

    (
        [("X-Accel-Buffering", "no"), ("Cache-Control", "no-cache")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => Json(state.gateway.metrics().snapshot_all()).into_response(),
    }
}

fn dispatch_error(e: DispatchError) -> Response {
    let status = match &e {
        DispatchError::UnknownTool(_) => StatusCode::NOT_FOUND,
        DispatchError::ToolDisabled(_) => StatusCode::FORBIDDEN,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}
