//! K8s readiness and liveness probe handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;

use crate::app::AppState;

/// Axum-compatible readiness probe; returns 200 while the app is running,
/// 503 before startup finishes and once shutdown has begun.
#[derive(Clone)]
pub struct ReadinessHandler {
    state: watch::Receiver<AppState>,
}

impl ReadinessHandler {
    pub(crate) fn new(state: watch::Receiver<AppState>) -> Self {
        Self { state }
    }

    /// Returns OK or SERVICE_UNAVAILABLE based on app state; no I/O.
    pub fn check(&self) -> StatusCode {
        if *self.state.borrow() == AppState::Running {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// K8s liveness probe handler. Always returns 200: liveness means "the
/// process is reachable".
#[derive(Clone, Copy, Default)]
pub struct LivenessHandler;

impl LivenessHandler {
    pub fn check(&self) -> LivenessStatus {
        LivenessStatus
    }
}

/// Always-healthy liveness status. Implements [`IntoResponse`] for axum.
pub struct LivenessStatus;

impl IntoResponse for LivenessStatus {
    fn into_response(self) -> Response {
        (StatusCode::OK, "ok").into_response()
    }
}

/// Router serving `/_readiness` and `/_liveness`; merge it into a service router.
pub fn probe_router(readiness: ReadinessHandler) -> Router {
    let liveness = LivenessHandler;
    Router::new()
        .route(
            "/_readiness",
            get(move || {
                let readiness = readiness.clone();
                async move { readiness.check() }
            }),
        )
        .route("/_liveness", get(move || async move { liveness.check() }))
}
