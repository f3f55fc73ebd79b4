use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use remitsync_core::DomainError;
use remitsync_infra::{DriverError, StoreError};

pub fn driver_error_to_response(err: DriverError) -> axum::response::Response {
    match err {
        DriverError::Store(e) => store_error_to_response(e),
        DriverError::Domain(e) => domain_error_to_response(e),
        DriverError::Busy(_) => json_error(StatusCode::CONFLICT, "busy", err.to_string()),
        DriverError::Stopped => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "driver_stopped", err.to_string())
        }
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::BatchNotFound(_) | StoreError::ItemNotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        StoreError::AlreadyExists(_) => json_error(StatusCode::CONFLICT, "conflict", err.to_string()),
        StoreError::Domain(e) => domain_error_to_response(e),
        StoreError::Storage(msg) => {
            tracing::error!(error = %msg, "store failure while serving request");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        // Illegal lifecycle transitions, e.g. pausing a completed batch.
        DomainError::InvariantViolation(msg) => json_error(StatusCode::CONFLICT, "invalid_state", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
