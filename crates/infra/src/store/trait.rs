use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use remitsync_core::{BatchId, DomainError, WorkItemId};
use remitsync_reconciliation::{Batch, BatchCounts, Checkpoint, WorkItem};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("work item not found: {0}")]
    ItemNotFound(WorkItemId),

    #[error("batch already exists: {0}")]
    AlreadyExists(BatchId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable state of the pipeline: batches, their work items and checkpoints.
///
/// ## Write discipline
///
/// - `mark_processing` persists a single claim immediately, before any remote
///   call, so a crash leaves the item in `processing` for `reclaim_processing`.
/// - Everything else an item pass produces is written through `commit`, which
///   persists the given items and the checkpoint in one transaction.
/// - A stored `paused` checkpoint is never overwritten back to `running` by
///   `commit`; the returned checkpoint tells the caller it was paused.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Persist a batch, all of its items and its checkpoint atomically.
    async fn create_batch(
        &self,
        batch: &Batch,
        items: &[WorkItem],
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError>;

    async fn get_batch(&self, batch_id: BatchId) -> Result<Batch, StoreError>;

    async fn get_checkpoint(&self, batch_id: BatchId) -> Result<Checkpoint, StoreError>;

    /// Every checkpoint, oldest `started_at` first.
    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError>;

    /// At most `limit` running checkpoints, oldest `started_at` first.
    async fn running_checkpoints(&self, limit: usize) -> Result<Vec<Checkpoint>, StoreError>;

    /// Runnable items of a batch at `now`: pending (or failed with attempts
    /// left), `scheduled_at` null or due, by priority descending then row number.
    async fn select_runnable(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Move every `processing` item of a batch back to `pending`; returns the
    /// reclaimed items as stored.
    async fn reclaim_processing(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Durably record a claim (`processing`, attempts incremented).
    async fn mark_processing(&self, item: &WorkItem) -> Result<(), StoreError>;

    /// Persist items and checkpoint in one transaction; returns the stored
    /// checkpoint.
    async fn commit(
        &self,
        items: &[WorkItem],
        checkpoint: &Checkpoint,
    ) -> Result<Checkpoint, StoreError>;

    /// Write the lifecycle fields of a checkpoint (state, error message,
    /// completion and checkpoint timestamps) unconditionally. Counters are
    /// left as stored; only `commit` and `requeue_failed` move them.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    async fn batch_counts(&self, batch_id: BatchId) -> Result<BatchCounts, StoreError>;

    /// Items of a batch in row order.
    async fn list_items(&self, batch_id: BatchId) -> Result<Vec<WorkItem>, StoreError>;

    /// Move terminal `failed` items back to `pending` with attempts reset and
    /// roll the checkpoint back to match. Returns how many were requeued.
    async fn requeue_failed(&self, batch_id: BatchId, now: DateTime<Utc>) -> Result<u64, StoreError>;
}
