//! Circuit breaker inspection and manual reset.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/circuit", get(circuit))
        .route("/circuit/reset", post(reset_circuit))
}

/// GET /flow/circuit
pub async fn circuit(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    (StatusCode::OK, Json(services.driver().circuit())).into_response()
}

/// POST /flow/circuit/reset
pub async fn reset_circuit(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let snapshot = services.driver().reset_circuit();
    tracing::warn!(state = ?snapshot.state, "circuit breaker reset manually");
    (StatusCode::OK, Json(snapshot)).into_response()
}
