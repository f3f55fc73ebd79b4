//! Postgres-backed pipeline store.
//!
//! Schema lives in `migrations/`; run `PostgresPipelineStore::migrate` once at
//! startup.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database, unique violation (`23505`) on batch insert | `AlreadyExists` |
//! | Database (other) | `Storage` |
//! | PoolClosed / other | `Storage` |
//! | zero rows affected on an item update | `ItemNotFound` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;

use remitsync_core::{BatchId, DomainError, WorkItemId};
use remitsync_reconciliation::{
    Batch, BatchCounts, Checkpoint, CheckpointState, OutcomeCode, PaymentRow, WorkItem,
    WorkItemState,
};

use super::r#trait::{PipelineStore, StoreError};

const ITEM_COLUMNS: &str = "id, batch_id, row_number, payment_date, raw_identifier, memo, amount, \
     source, state, attempts, max_attempts, scheduled_at, priority, party_id, party_name, \
     remote_receipt_id, detected_debt, outcome, error_message, processing_ms, created_at, updated_at";

const CHECKPOINT_COLUMNS: &str = "batch_id, total_rows, processed_rows, success_count, \
     failed_count, skipped_count, state, started_at, last_checkpoint_at, completed_at, error_message";

#[derive(Debug, Clone)]
pub struct PostgresPipelineStore {
    pool: Arc<PgPool>,
}

impl PostgresPipelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("migration failed: {e}")))
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }

    async fn update_item(
        tx: &mut Transaction<'static, Postgres>,
        item: &WorkItem,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_work_items SET
                state = $2,
                attempts = $3,
                max_attempts = $4,
                scheduled_at = $5,
                priority = $6,
                party_id = $7,
                party_name = $8,
                remote_receipt_id = $9,
                detected_debt = $10,
                outcome = $11,
                error_message = $12,
                processing_ms = $13,
                updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(item.state.as_str())
        .bind(item.attempts as i32)
        .bind(item.max_attempts as i32)
        .bind(item.scheduled_at)
        .bind(item.priority)
        .bind(item.party_id)
        .bind(item.party_name.as_deref())
        .bind(item.remote_receipt_id)
        .bind(item.detected_debt)
        .bind(item.outcome.map(|o| o.as_str()))
        .bind(item.error_message.as_deref())
        .bind(item.processing_ms.map(|ms| ms as i64))
        .bind(item.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_item", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ItemNotFound(item.id));
        }
        Ok(())
    }

    async fn load_checkpoint_for_update(
        tx: &mut Transaction<'static, Postgres>,
        batch_id: BatchId,
    ) -> Result<Checkpoint, StoreError> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM pipeline_checkpoints WHERE batch_id = $1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(batch_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_checkpoint", e))?
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        checkpoint_from_row(&row)
    }

    async fn write_checkpoint(
        tx: &mut Transaction<'static, Postgres>,
        checkpoint: &Checkpoint,
        keep_pause: bool,
    ) -> Result<Checkpoint, StoreError> {
        let sql = format!(
            r#"
            UPDATE pipeline_checkpoints SET
                processed_rows = $2,
                success_count = $3,
                failed_count = $4,
                skipped_count = $5,
                state = CASE WHEN $10 AND state = 'paused' AND $6 = 'running' THEN state ELSE $6 END,
                last_checkpoint_at = $7,
                completed_at = $8,
                error_message = $9
            WHERE batch_id = $1
            RETURNING {CHECKPOINT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(checkpoint.batch_id.as_uuid())
            .bind(checkpoint.processed_rows as i64)
            .bind(checkpoint.success_count as i64)
            .bind(checkpoint.failed_count as i64)
            .bind(checkpoint.skipped_count as i64)
            .bind(checkpoint.state.as_str())
            .bind(checkpoint.last_checkpoint_at)
            .bind(checkpoint.completed_at)
            .bind(checkpoint.error_message.as_deref())
            .bind(keep_pause)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("write_checkpoint", e))?
            .ok_or(StoreError::BatchNotFound(checkpoint.batch_id))?;
        checkpoint_from_row(&row)
    }
}

#[async_trait]
impl PipelineStore for PostgresPipelineStore {
    #[instrument(skip(self, batch, items, checkpoint), fields(batch_id = %batch.id, items = items.len()), err)]
    async fn create_batch(
        &self,
        batch: &Batch,
        items: &[WorkItem],
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin("create_batch").await?;

        sqlx::query(
            "INSERT INTO pipeline_batches (id, source_name, total_rows, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(batch.id.as_uuid())
        .bind(&batch.source_name)
        .bind(batch.total_rows as i64)
        .bind(batch.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match map_sqlx_error("create_batch", e) {
            StoreError::Storage(msg) if msg.contains("23505") => StoreError::AlreadyExists(batch.id),
            other => other,
        })?;

        let sql = format!(
            "INSERT INTO pipeline_checkpoints ({CHECKPOINT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        );
        sqlx::query(&sql)
            .bind(checkpoint.batch_id.as_uuid())
            .bind(checkpoint.total_rows as i64)
            .bind(checkpoint.processed_rows as i64)
            .bind(checkpoint.success_count as i64)
            .bind(checkpoint.failed_count as i64)
            .bind(checkpoint.skipped_count as i64)
            .bind(checkpoint.state.as_str())
            .bind(checkpoint.started_at)
            .bind(checkpoint.last_checkpoint_at)
            .bind(checkpoint.completed_at)
            .bind(checkpoint.error_message.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_batch", e))?;

        let sql = format!(
            "INSERT INTO pipeline_work_items ({ITEM_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)"
        );
        for item in items {
            sqlx::query(&sql)
                .bind(item.id.as_uuid())
                .bind(item.batch_id.as_uuid())
                .bind(item.row_number as i32)
                .bind(item.payment.payment_date)
                .bind(&item.payment.raw_identifier)
                .bind(&item.payment.memo)
                .bind(item.payment.amount)
                .bind(&item.payment.source)
                .bind(item.state.as_str())
                .bind(item.attempts as i32)
                .bind(item.max_attempts as i32)
                .bind(item.scheduled_at)
                .bind(item.priority)
                .bind(item.party_id)
                .bind(item.party_name.as_deref())
                .bind(item.remote_receipt_id)
                .bind(item.detected_debt)
                .bind(item.outcome.map(|o| o.as_str()))
                .bind(item.error_message.as_deref())
                .bind(item.processing_ms.map(|ms| ms as i64))
                .bind(item.created_at)
                .bind(item.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("create_batch", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("create_batch", e))
    }

    #[instrument(skip(self), err)]
    async fn get_batch(&self, batch_id: BatchId) -> Result<Batch, StoreError> {
        let row = sqlx::query(
            "SELECT id, source_name, total_rows, created_at FROM pipeline_batches WHERE id = $1",
        )
        .bind(batch_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_batch", e))?
        .ok_or(StoreError::BatchNotFound(batch_id))?;

        Ok(Batch {
            id: BatchId::from_uuid(get(&row, "id")?),
            source_name: get(&row, "source_name")?,
            total_rows: get::<i64>(&row, "total_rows")? as u64,
            created_at: get(&row, "created_at")?,
        })
    }

    #[instrument(skip(self), err)]
    async fn get_checkpoint(&self, batch_id: BatchId) -> Result<Checkpoint, StoreError> {
        let sql = format!("SELECT {CHECKPOINT_COLUMNS} FROM pipeline_checkpoints WHERE batch_id = $1");
        let row = sqlx::query(&sql)
            .bind(batch_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_checkpoint", e))?
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        checkpoint_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM pipeline_checkpoints ORDER BY started_at ASC, batch_id ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_checkpoints", e))?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn running_checkpoints(&self, limit: usize) -> Result<Vec<Checkpoint>, StoreError> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM pipeline_checkpoints WHERE state = 'running' \
             ORDER BY started_at ASC, batch_id ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("running_checkpoints", e))?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn select_runnable(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM pipeline_work_items
            WHERE batch_id = $1
              AND (state = 'pending' OR (state = 'failed' AND attempts < max_attempts))
              AND (scheduled_at IS NULL OR scheduled_at <= $2)
            ORDER BY priority DESC, row_number ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(batch_id.as_uuid())
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("select_runnable", e))?;
        rows.iter().map(item_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn reclaim_processing(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let sql = format!(
            "UPDATE pipeline_work_items SET state = 'pending', updated_at = $2 \
             WHERE batch_id = $1 AND state = 'processing' RETURNING {ITEM_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(batch_id.as_uuid())
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reclaim_processing", e))?;
        let mut items = rows.iter().map(item_from_row).collect::<Result<Vec<_>, _>>()?;
        items.sort_by_key(|it| it.row_number);
        Ok(items)
    }

    #[instrument(skip(self, item), fields(item_id = %item.id, attempts = item.attempts), err)]
    async fn mark_processing(&self, item: &WorkItem) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE pipeline_work_items SET state = $2, attempts = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(item.id.as_uuid())
        .bind(item.state.as_str())
        .bind(item.attempts as i32)
        .bind(item.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_processing", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ItemNotFound(item.id));
        }
        Ok(())
    }

    #[instrument(skip(self, items, checkpoint), fields(batch_id = %checkpoint.batch_id, items = items.len()), err)]
    async fn commit(
        &self,
        items: &[WorkItem],
        checkpoint: &Checkpoint,
    ) -> Result<Checkpoint, StoreError> {
        let mut tx = self.begin("commit").await?;
        for item in items {
            Self::update_item(&mut tx, item).await?;
        }
        let stored = Self::write_checkpoint(&mut tx, checkpoint, true).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(stored)
    }

    #[instrument(skip(self, checkpoint), fields(batch_id = %checkpoint.batch_id, state = checkpoint.state.as_str()), err)]
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_checkpoints SET
                state = $2,
                error_message = $3,
                completed_at = $4,
                last_checkpoint_at = $5
            WHERE batch_id = $1
            "#,
        )
        .bind(checkpoint.batch_id.as_uuid())
        .bind(checkpoint.state.as_str())
        .bind(checkpoint.error_message.as_deref())
        .bind(checkpoint.completed_at)
        .bind(checkpoint.last_checkpoint_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_checkpoint", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::BatchNotFound(checkpoint.batch_id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn batch_counts(&self, batch_id: BatchId) -> Result<BatchCounts, StoreError> {
        // Distinguish "unknown batch" from "batch without items".
        self.get_batch(batch_id).await?;
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM pipeline_work_items WHERE batch_id = $1 GROUP BY state",
        )
        .bind(batch_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("batch_counts", e))?;

        let mut counts = BatchCounts::default();
        for row in rows {
            let state: String = get(&row, "state")?;
            let n: i64 = get(&row, "n")?;
            counts.add(parse_item_state(&state)?, n as u64);
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn list_items(&self, batch_id: BatchId) -> Result<Vec<WorkItem>, StoreError> {
        self.get_batch(batch_id).await?;
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM pipeline_work_items WHERE batch_id = $1 ORDER BY row_number ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(batch_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_items", e))?;
        rows.iter().map(item_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn requeue_failed(&self, batch_id: BatchId, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.begin("requeue_failed").await?;
        let mut checkpoint = Self::load_checkpoint_for_update(&mut tx, batch_id).await?;

        let result = sqlx::query(
            r#"
            UPDATE pipeline_work_items
            SET state = 'pending', attempts = 0, scheduled_at = NULL, outcome = NULL, updated_at = $2
            WHERE batch_id = $1 AND state = 'failed' AND attempts >= max_attempts
            "#,
        )
        .bind(batch_id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("requeue_failed", e))?;

        let requeued = result.rows_affected();
        if requeued == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("requeue_failed", e))?;
            return Ok(0);
        }
        checkpoint.reopen_failed(requeued, now)?;
        Self::write_checkpoint(&mut tx, &checkpoint, false).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("requeue_failed", e))?;
        Ok(requeued)
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Storage(format!("failed to decode column {column}: {e}")))
}

fn parse_item_state(s: &str) -> Result<WorkItemState, StoreError> {
    WorkItemState::parse(s)
        .ok_or_else(|| StoreError::Storage(format!("unknown work item state {s:?}")))
}

fn item_from_row(row: &PgRow) -> Result<WorkItem, StoreError> {
    let outcome: Option<String> = get(row, "outcome")?;
    let outcome = match outcome {
        Some(code) => Some(
            OutcomeCode::parse(&code)
                .ok_or_else(|| StoreError::Storage(format!("unknown outcome code {code:?}")))?,
        ),
        None => None,
    };
    let state: String = get(row, "state")?;

    Ok(WorkItem {
        id: WorkItemId::from_uuid(get(row, "id")?),
        batch_id: BatchId::from_uuid(get(row, "batch_id")?),
        row_number: get::<i32>(row, "row_number")? as u32,
        payment: PaymentRow {
            payment_date: get(row, "payment_date")?,
            raw_identifier: get(row, "raw_identifier")?,
            memo: get(row, "memo")?,
            amount: get(row, "amount")?,
            source: get(row, "source")?,
        },
        state: parse_item_state(&state)?,
        attempts: get::<i32>(row, "attempts")? as u32,
        max_attempts: get::<i32>(row, "max_attempts")? as u32,
        scheduled_at: get(row, "scheduled_at")?,
        priority: get(row, "priority")?,
        party_id: get(row, "party_id")?,
        party_name: get(row, "party_name")?,
        remote_receipt_id: get(row, "remote_receipt_id")?,
        detected_debt: get(row, "detected_debt")?,
        outcome,
        error_message: get(row, "error_message")?,
        processing_ms: get::<Option<i64>>(row, "processing_ms")?.map(|ms| ms as u64),
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn checkpoint_from_row(row: &PgRow) -> Result<Checkpoint, StoreError> {
    let state: String = get(row, "state")?;
    Ok(Checkpoint {
        batch_id: BatchId::from_uuid(get(row, "batch_id")?),
        total_rows: get::<i64>(row, "total_rows")? as u64,
        processed_rows: get::<i64>(row, "processed_rows")? as u64,
        success_count: get::<i64>(row, "success_count")? as u64,
        failed_count: get::<i64>(row, "failed_count")? as u64,
        skipped_count: get::<i64>(row, "skipped_count")? as u64,
        state: CheckpointState::parse(&state)
            .ok_or_else(|| StoreError::Storage(format!("unknown checkpoint state {state:?}")))?,
        started_at: get(row, "started_at")?,
        last_checkpoint_at: get(row, "last_checkpoint_at")?,
        completed_at: get(row, "completed_at")?,
        error_message: get(row, "error_message")?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            if code == "23514" {
                // Check constraint: the row would break a table invariant.
                StoreError::Domain(DomainError::invariant(format!(
                    "{operation} violates a constraint: {}",
                    db_err.message()
                )))
            } else {
                StoreError::Storage(format!(
                    "database error in {operation} ({code}): {}",
                    db_err.message()
                ))
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
