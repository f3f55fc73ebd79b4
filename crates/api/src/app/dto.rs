use serde::Deserialize;
use serde_json::json;

use remitsync_core::BatchId;
use remitsync_infra::pipeline::BatchSummary;
use remitsync_infra::{PassOutcome, PassReport};
use remitsync_reconciliation::{Checkpoint, PaymentRow, WorkItem};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct IngestBatchRequest {
    pub source_name: String,
    pub rows: Vec<PaymentRow>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ItemsQuery {
    /// Only items in this state (`pending`, `processing`, `done`, `failed`, `skipped`).
    pub state: Option<String>,
}

// -------------------------
// Helpers
// -------------------------

pub fn parse_batch_id(raw: &str) -> Result<BatchId, axum::response::Response> {
    raw.parse().map_err(|_| {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "invalid_id",
            "invalid batch id",
        )
    })
}

// -------------------------
// Response mapping
// -------------------------

pub fn checkpoint_to_json(cp: &Checkpoint) -> serde_json::Value {
    json!({
        "batch_id": cp.batch_id.to_string(),
        "state": cp.state.as_str(),
        "total_rows": cp.total_rows,
        "processed_rows": cp.processed_rows,
        "success_count": cp.success_count,
        "failed_count": cp.failed_count,
        "skipped_count": cp.skipped_count,
        "progress_percentage": cp.progress_percentage(),
        "started_at": cp.started_at,
        "last_checkpoint_at": cp.last_checkpoint_at,
        "completed_at": cp.completed_at,
        "error_message": cp.error_message,
    })
}

pub fn summary_to_json(summary: &BatchSummary) -> serde_json::Value {
    let counts = summary.counts;
    json!({
        "batch": {
            "id": summary.batch.id.to_string(),
            "source_name": summary.batch.source_name,
            "total_rows": summary.batch.total_rows,
            "created_at": summary.batch.created_at,
        },
        "checkpoint": checkpoint_to_json(&summary.checkpoint),
        "counts": {
            "pending": counts.pending,
            "processing": counts.processing,
            "done": counts.done,
            "failed": counts.failed,
            "skipped": counts.skipped,
        },
        "outstanding": counts.outstanding(),
    })
}

pub fn item_to_json(item: &WorkItem) -> serde_json::Value {
    json!({
        "id": item.id.to_string(),
        "row_number": item.row_number,
        "state": item.state.as_str(),
        "attempts": item.attempts,
        "max_attempts": item.max_attempts,
        "priority": item.priority,
        "scheduled_at": item.scheduled_at,
        "payment": {
            "payment_date": item.payment.payment_date,
            "raw_identifier": item.payment.raw_identifier,
            "memo": item.payment.memo,
            "amount": item.payment.amount,
        },
        "party_id": item.party_id,
        "party_name": item.party_name,
        "remote_receipt_id": item.remote_receipt_id,
        "detected_debt": item.detected_debt,
        "outcome": item.outcome.map(|o| o.as_str()),
        "error_message": item.error_message,
        "processing_ms": item.processing_ms,
        "updated_at": item.updated_at,
    })
}

pub fn pass_report_to_json(report: &PassReport) -> serde_json::Value {
    let mut body = json!({
        "batch_id": report.batch_id.to_string(),
        "attempted": report.attempted,
        "done": report.done,
        "skipped": report.skipped,
        "failed": report.failed,
        "rescheduled": report.rescheduled,
    });
    let outcome = match &report.outcome {
        PassOutcome::Completed => json!({ "outcome": "completed" }),
        PassOutcome::Continue => json!({ "outcome": "continue" }),
        PassOutcome::Waiting => json!({ "outcome": "waiting" }),
        PassOutcome::Deferred { retry_in } => {
            json!({ "outcome": "deferred", "retry_in_ms": retry_in.as_millis() as u64 })
        }
        PassOutcome::Paused => json!({ "outcome": "paused" }),
        PassOutcome::NotRunning(state) => {
            json!({ "outcome": "not_running", "state": state.as_str() })
        }
        PassOutcome::Failed(message) => json!({ "outcome": "failed", "message": message }),
    };
    if let (Some(body), serde_json::Value::Object(extra)) = (body.as_object_mut(), outcome) {
        body.extend(extra);
    }
    body
}
