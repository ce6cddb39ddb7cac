//! Reverse HTTP tunneling relay.
//!
//! The binary in `main.rs` is a thin wrapper around [`router`] so that
//! integration tests can stand up the real `axum::Router` against an
//! in-memory listener without spawning a separate process.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::Router;

pub mod config;
pub mod control;
pub mod error;
pub mod forwarder;
pub mod hostname;
pub mod metrics;
pub mod registry;
pub mod tunnel;
pub mod upgrade;

use config::Config;
use metrics::Metrics;
use registry::Registry;

/// Shared state handed to every axum handler. Cheap to clone: everything
/// inside is already reference-counted or trivially small.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<Registry>,
    pub config: Arc<Config>,
    pub metrics: Metrics,
}

impl RelayState {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            config: Arc::new(config),
            metrics: Metrics::new(),
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/tunnel", get(control::ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(any(dispatch))
        .with_state(state)
}

async fn health_handler(State(state): State<RelayState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "active_tunnels": state.registry.len(),
    }))
}

async fn metrics_handler(State(state): State<RelayState>) -> impl IntoResponse {
    let body = state.metrics.to_prometheus().await;
    (StatusCode::OK, [("content-type", "text/plain")], body)
}

/// Every request not addressed to the control channel or the ambient
/// endpoints above is public ingress: either an ordinary request (C4) or
/// one asking to switch protocols (C5).
async fn dispatch(state: State<RelayState>, req: Request<Body>) -> axum::response::Response {
    if upgrade::wants_upgrade(&req) {
        match upgrade::forward_upgrade(state, req).await {
            Ok(resp) => resp,
            Err(err) => err.into_response(),
        }
    } else {
        match forwarder::forward(state, req).await {
            Ok(resp) => resp,
            Err(err) => err.into_response(),
        }
    }
}
