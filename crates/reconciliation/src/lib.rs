//! `remitsync-reconciliation`: the pure domain of the reconciliation pipeline.
//!
//! - `work_item`: one payment row and its retry state machine
//! - `batch`: an ingestion run and its per-state counts
//! - `checkpoint`: durable progress record enabling safe resume
//! - `idempotency`: the fingerprint that prevents duplicate remote receipts
//! - `outcome`: what processing a single item concluded

pub mod batch;
pub mod checkpoint;
pub mod idempotency;
pub mod outcome;
pub mod work_item;

pub use batch::{Batch, BatchCounts};
pub use checkpoint::{Checkpoint, CheckpointState, ProgressOutcome};
pub use idempotency::IdempotencyKey;
pub use outcome::{Disposition, ItemOutcome, OutcomeCode, PartyRef, SkipReason};
pub use work_item::{Applied, PaymentRow, WorkItem, WorkItemState, DEFAULT_MAX_ATTEMPTS};
