use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use remitsync_core::BatchId;
use remitsync_reconciliation::{
    Batch, BatchCounts, Checkpoint, CheckpointState, WorkItem, WorkItemState,
};

use super::r#trait::{PipelineStore, StoreError};

#[derive(Debug)]
struct BatchRecord {
    batch: Batch,
    checkpoint: Checkpoint,
    items: Vec<WorkItem>,
}

/// In-memory pipeline store.
///
/// Intended for tests/dev. Every operation runs under one lock, which also
/// makes `commit` atomic.
#[derive(Debug, Default)]
pub struct InMemoryPipelineStore {
    batches: RwLock<HashMap<BatchId, BatchRecord>>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<BatchId, BatchRecord>> {
        self.batches.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<BatchId, BatchRecord>> {
        self.batches.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn record_mut(
    batches: &mut HashMap<BatchId, BatchRecord>,
    batch_id: BatchId,
) -> Result<&mut BatchRecord, StoreError> {
    batches
        .get_mut(&batch_id)
        .ok_or(StoreError::BatchNotFound(batch_id))
}

fn oldest_first(checkpoints: &mut [Checkpoint]) {
    checkpoints.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.batch_id.cmp(&b.batch_id))
    });
}

#[async_trait]
impl PipelineStore for InMemoryPipelineStore {
    async fn create_batch(
        &self,
        batch: &Batch,
        items: &[WorkItem],
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        let mut batches = self.write();
        if batches.contains_key(&batch.id) {
            return Err(StoreError::AlreadyExists(batch.id));
        }
        batches.insert(
            batch.id,
            BatchRecord {
                batch: batch.clone(),
                checkpoint: checkpoint.clone(),
                items: items.to_vec(),
            },
        );
        Ok(())
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Batch, StoreError> {
        self.read()
            .get(&batch_id)
            .map(|r| r.batch.clone())
            .ok_or(StoreError::BatchNotFound(batch_id))
    }

    async fn get_checkpoint(&self, batch_id: BatchId) -> Result<Checkpoint, StoreError> {
        self.read()
            .get(&batch_id)
            .map(|r| r.checkpoint.clone())
            .ok_or(StoreError::BatchNotFound(batch_id))
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let mut all: Vec<Checkpoint> = self.read().values().map(|r| r.checkpoint.clone()).collect();
        oldest_first(&mut all);
        Ok(all)
    }

    async fn running_checkpoints(&self, limit: usize) -> Result<Vec<Checkpoint>, StoreError> {
        let mut running: Vec<Checkpoint> = self
            .read()
            .values()
            .filter(|r| r.checkpoint.state == CheckpointState::Running)
            .map(|r| r.checkpoint.clone())
            .collect();
        oldest_first(&mut running);
        running.truncate(limit);
        Ok(running)
    }

    async fn select_runnable(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let batches = self.read();
        let record = batches
            .get(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        let mut runnable: Vec<WorkItem> = record
            .items
            .iter()
            .filter(|it| it.is_runnable(now))
            .cloned()
            .collect();
        runnable.sort_by_key(|it| (Reverse(it.priority), it.row_number));
        runnable.truncate(limit);
        Ok(runnable)
    }

    async fn reclaim_processing(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut batches = self.write();
        let record = record_mut(&mut batches, batch_id)?;
        let mut reclaimed = Vec::new();
        for item in record
            .items
            .iter_mut()
            .filter(|it| it.state == WorkItemState::Processing)
        {
            item.reclaim(now)?;
            reclaimed.push(item.clone());
        }
        Ok(reclaimed)
    }

    async fn mark_processing(&self, item: &WorkItem) -> Result<(), StoreError> {
        let mut batches = self.write();
        let record = record_mut(&mut batches, item.batch_id)?;
        let stored = record
            .items
            .iter_mut()
            .find(|it| it.id == item.id)
            .ok_or(StoreError::ItemNotFound(item.id))?;
        *stored = item.clone();
        Ok(())
    }

    async fn commit(
        &self,
        items: &[WorkItem],
        checkpoint: &Checkpoint,
    ) -> Result<Checkpoint, StoreError> {
        let mut batches = self.write();
        let record = record_mut(&mut batches, checkpoint.batch_id)?;

        // Validate first so a bad item leaves nothing half-written.
        let mut positions = Vec::with_capacity(items.len());
        for item in items {
            let pos = record
                .items
                .iter()
                .position(|it| it.id == item.id)
                .ok_or(StoreError::ItemNotFound(item.id))?;
            positions.push(pos);
        }
        for (pos, item) in positions.into_iter().zip(items) {
            record.items[pos] = item.clone();
        }

        let paused = record.checkpoint.state == CheckpointState::Paused;
        record.checkpoint = checkpoint.clone();
        if paused && checkpoint.state == CheckpointState::Running {
            record.checkpoint.state = CheckpointState::Paused;
        }
        Ok(record.checkpoint.clone())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut batches = self.write();
        let stored = &mut record_mut(&mut batches, checkpoint.batch_id)?.checkpoint;
        stored.state = checkpoint.state;
        stored.error_message = checkpoint.error_message.clone();
        stored.completed_at = checkpoint.completed_at;
        stored.last_checkpoint_at = checkpoint.last_checkpoint_at;
        Ok(())
    }

    async fn batch_counts(&self, batch_id: BatchId) -> Result<BatchCounts, StoreError> {
        self.read()
            .get(&batch_id)
            .map(|r| BatchCounts::from_items(&r.items))
            .ok_or(StoreError::BatchNotFound(batch_id))
    }

    async fn list_items(&self, batch_id: BatchId) -> Result<Vec<WorkItem>, StoreError> {
        let mut items = self
            .read()
            .get(&batch_id)
            .map(|r| r.items.clone())
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        items.sort_by_key(|it| it.row_number);
        Ok(items)
    }

    async fn requeue_failed(&self, batch_id: BatchId, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut batches = self.write();
        let record = record_mut(&mut batches, batch_id)?;

        let failed = record
            .items
            .iter()
            .filter(|it| it.state == WorkItemState::Failed && it.is_terminal())
            .count() as u64;
        if failed == 0 {
            return Ok(0);
        }
        let mut checkpoint = record.checkpoint.clone();
        checkpoint.reopen_failed(failed, now)?;

        for item in record
            .items
            .iter_mut()
            .filter(|it| it.state == WorkItemState::Failed && it.is_terminal())
        {
            item.requeue(now)?;
        }
        record.checkpoint = checkpoint;
        Ok(failed)
    }
}
