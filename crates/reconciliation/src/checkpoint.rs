//! Per-batch progress record (the checkpoint tracker).
//!
//! A checkpoint is created when a batch is accepted and is the only place the
//! driver looks to decide whether a batch still needs work. Counters only move
//! when an item reaches a terminal state, so `processed_rows` never exceeds
//! `total_rows` even when items are retried.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use remitsync_core::{BatchId, DomainError, DomainResult};

use crate::work_item::Applied;

/// Checkpoint state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Running,
    Paused,
    Completed,
    Failed,
}

impl CheckpointState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointState::Running => "running",
            CheckpointState::Paused => "paused",
            CheckpointState::Completed => "completed",
            CheckpointState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => CheckpointState::Running,
            "paused" => CheckpointState::Paused,
            "completed" => CheckpointState::Completed,
            "failed" => CheckpointState::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckpointState::Completed | CheckpointState::Failed)
    }
}

/// Which outcome counter a progress update feeds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProgressOutcome {
    Success,
    Failed,
    Skipped,
}

impl ProgressOutcome {
    /// Counter for a terminal item transition; `None` for a reschedule.
    pub fn for_applied(applied: Applied) -> Option<Self> {
        match applied {
            Applied::Done => Some(ProgressOutcome::Success),
            Applied::Skipped => Some(ProgressOutcome::Skipped),
            Applied::Failed => Some(ProgressOutcome::Failed),
            Applied::Rescheduled { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub batch_id: BatchId,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub state: CheckpointState,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Checkpoint {
    pub fn new(batch_id: BatchId, total_rows: u64, now: DateTime<Utc>) -> Self {
        Self {
            batch_id,
            total_rows,
            processed_rows: 0,
            success_count: 0,
            failed_count: 0,
            skipped_count: 0,
            state: CheckpointState::Running,
            started_at: now,
            last_checkpoint_at: now,
            completed_at: None,
            error_message: None,
        }
    }

    /// `processed_rows / total_rows * 100`, and 0 for an empty batch.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_rows == 0 {
            return 0.0;
        }
        (self.processed_rows as f64 / self.total_rows as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn is_running(&self) -> bool {
        self.state == CheckpointState::Running
    }

    /// Count `n` more rows as processed with the given outcome.
    pub fn update_progress(
        &mut self,
        n: u64,
        outcome: ProgressOutcome,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let processed = self.processed_rows + n;
        if processed > self.total_rows {
            return Err(DomainError::invariant(format!(
                "checkpoint {} would process {} of {} rows",
                self.batch_id, processed, self.total_rows
            )));
        }
        self.processed_rows = processed;
        match outcome {
            ProgressOutcome::Success => self.success_count += n,
            ProgressOutcome::Failed => self.failed_count += n,
            ProgressOutcome::Skipped => self.skipped_count += n,
        }
        self.last_checkpoint_at = now;
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = CheckpointState::Completed;
        self.completed_at = Some(now);
        self.last_checkpoint_at = now;
    }

    /// Pipeline-fatal condition (e.g. configuration); not for per-item failures.
    pub fn mark_failed(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.state = CheckpointState::Failed;
        self.error_message = Some(message.into());
        self.last_checkpoint_at = now;
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state != CheckpointState::Running {
            return Err(self.illegal("pause"));
        }
        self.state = CheckpointState::Paused;
        self.last_checkpoint_at = now;
        Ok(())
    }

    /// Resume a paused batch, or retry one that failed on a fatal condition.
    pub fn resume(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !matches!(self.state, CheckpointState::Paused | CheckpointState::Failed) {
            return Err(self.illegal("resume"));
        }
        self.state = CheckpointState::Running;
        self.error_message = None;
        self.last_checkpoint_at = now;
        Ok(())
    }

    /// Roll back `n` failed rows that were requeued, and reopen the batch.
    pub fn reopen_failed(&mut self, n: u64, now: DateTime<Utc>) -> DomainResult<()> {
        if n > self.failed_count || n > self.processed_rows {
            return Err(DomainError::invariant(format!(
                "checkpoint {} cannot requeue {} rows with {} failed",
                self.batch_id, n, self.failed_count
            )));
        }
        if n == 0 {
            return Ok(());
        }
        self.failed_count -= n;
        self.processed_rows -= n;
        if self.state != CheckpointState::Paused {
            self.state = CheckpointState::Running;
        }
        self.completed_at = None;
        self.error_message = None;
        self.last_checkpoint_at = now;
        Ok(())
    }

    fn illegal(&self, op: &str) -> DomainError {
        DomainError::invariant(format!(
            "cannot {op} checkpoint {} in state {}",
            self.batch_id,
            self.state.as_str()
        ))
    }
}
