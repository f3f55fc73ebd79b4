//! Batch hand-off, progress reporting and lifecycle operations.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use remitsync_infra::DriverError;
use remitsync_reconciliation::WorkItemState;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(ingest_batch).get(list_batches))
        .route("/:id", get(get_batch))
        .route("/:id/items", get(list_items))
        .route("/:id/process", post(process_batch))
        .route("/:id/pause", post(pause_batch))
        .route("/:id/resume", post(resume_batch))
        .route("/:id/requeue-failed", post(requeue_failed))
}

/// POST /batches - accept an ingested batch and queue its first pass.
pub async fn ingest_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::IngestBatchRequest>,
) -> axum::response::Response {
    if body.source_name.trim().is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "source_name must not be empty",
        );
    }

    let checkpoint = match services.driver().ingest(body.source_name, body.rows).await {
        Ok(cp) => cp,
        Err(e) => return errors::driver_error_to_response(e),
    };
    let queued = services.request_pass(checkpoint.batch_id);

    (
        StatusCode::CREATED,
        Json(json!({
            "batch_id": checkpoint.batch_id.to_string(),
            "queued": queued,
            "checkpoint": dto::checkpoint_to_json(&checkpoint),
        })),
    )
        .into_response()
}

/// GET /batches
pub async fn list_batches(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.driver().store().list_checkpoints().await {
        Ok(checkpoints) => {
            let body: Vec<_> = checkpoints.iter().map(dto::checkpoint_to_json).collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /batches/:id - checkpoint and item counts.
pub async fn get_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let batch_id = match dto::parse_batch_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.driver().summary(batch_id).await {
        Ok(summary) => (StatusCode::OK, Json(dto::summary_to_json(&summary))).into_response(),
        Err(e) => errors::driver_error_to_response(e),
    }
}

/// GET /batches/:id/items?state=failed
pub async fn list_items(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<dto::ItemsQuery>,
) -> axum::response::Response {
    let batch_id = match dto::parse_batch_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let state = match query.state.as_deref().map(WorkItemState::parse) {
        None => None,
        Some(Some(state)) => Some(state),
        Some(None) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_state",
                "state must be one of: pending, processing, done, failed, skipped",
            );
        }
    };

    let store = services.driver().store();
    if let Err(e) = store.get_checkpoint(batch_id).await {
        return errors::store_error_to_response(e);
    }
    match store.list_items(batch_id).await {
        Ok(items) => {
            let body: Vec<_> = items
                .iter()
                .filter(|it| state.is_none_or(|s| it.state == s))
                .map(dto::item_to_json)
                .collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /batches/:id/process - "process this batch now".
///
/// With a running driver loop the request is queued (202). Without one the
/// pass runs inline and its report is returned. A pass already in flight is
/// not an error: the request is redundant.
pub async fn process_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let batch_id = match dto::parse_batch_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    if let Err(e) = services.driver().store().get_checkpoint(batch_id).await {
        return errors::store_error_to_response(e);
    }

    if services.has_background_driver() {
        let queued = services.request_pass(batch_id);
        if !queued {
            return errors::driver_error_to_response(DriverError::Stopped);
        }
        return (
            StatusCode::ACCEPTED,
            Json(json!({ "batch_id": batch_id.to_string(), "queued": true })),
        )
            .into_response();
    }

    match services.driver().run_pass(batch_id).await {
        Ok(report) => (StatusCode::OK, Json(dto::pass_report_to_json(&report))).into_response(),
        Err(DriverError::Busy(_)) => (
            StatusCode::ACCEPTED,
            Json(json!({ "batch_id": batch_id.to_string(), "in_flight": true })),
        )
            .into_response(),
        Err(e) => errors::driver_error_to_response(e),
    }
}

/// POST /batches/:id/pause
pub async fn pause_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let batch_id = match dto::parse_batch_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.driver().pause(batch_id).await {
        Ok(cp) => (StatusCode::OK, Json(dto::checkpoint_to_json(&cp))).into_response(),
        Err(e) => errors::driver_error_to_response(e),
    }
}

/// POST /batches/:id/resume - back to running and queue a pass.
pub async fn resume_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let batch_id = match dto::parse_batch_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.driver().resume(batch_id).await {
        Ok(cp) => {
            services.request_pass(batch_id);
            (StatusCode::OK, Json(dto::checkpoint_to_json(&cp))).into_response()
        }
        Err(e) => errors::driver_error_to_response(e),
    }
}

/// POST /batches/:id/requeue-failed - fresh retry budget for failed items.
pub async fn requeue_failed(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let batch_id = match dto::parse_batch_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    let requeued = match services.driver().requeue_failed(batch_id).await {
        Ok(n) => n,
        Err(e) => return errors::driver_error_to_response(e),
    };
    if requeued > 0 {
        services.request_pass(batch_id);
    }

    match services.driver().store().get_checkpoint(batch_id).await {
        Ok(cp) => (
            StatusCode::OK,
            Json(json!({
                "requeued": requeued,
                "checkpoint": dto::checkpoint_to_json(&cp),
            })),
        )
            .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
