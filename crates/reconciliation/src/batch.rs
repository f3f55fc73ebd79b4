//! Ingestion batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use remitsync_core::BatchId;

use crate::work_item::{WorkItem, WorkItemState};

/// One ingestion run. Owns an ordered set of work items (by row number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub source_name: String,
    pub total_rows: u64,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(source_name: impl Into<String>, total_rows: u64) -> Self {
        Self {
            id: BatchId::new(),
            source_name: source_name.into(),
            total_rows,
            created_at: Utc::now(),
        }
    }
}

/// Work item counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl BatchCounts {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a WorkItem>) -> Self {
        let mut counts = Self::default();
        for item in items {
            counts.add(item.state, 1);
        }
        counts
    }

    pub fn add(&mut self, state: WorkItemState, n: u64) {
        match state {
            WorkItemState::Pending => self.pending += n,
            WorkItemState::Processing => self.processing += n,
            WorkItemState::Done => self.done += n,
            WorkItemState::Failed => self.failed += n,
            WorkItemState::Skipped => self.skipped += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.done + self.failed + self.skipped
    }

    /// Items that still need a pass.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.processing
    }
}
