//! The scheduler driver: selects running batches, processes bounded slices of
//! their work items under flow control, and decides what happens next.
//!
//! A pass over one batch:
//!
//! 1. skip unless the checkpoint is `running`; fail it on invalid settings
//! 2. select up to `batch_size` runnable items; with none left, complete the
//!    batch once nothing is outstanding
//! 3. defer while the circuit is open
//! 4. authenticate and resolve the scope context, then resolve every
//!    identifier of the slice in one go
//! 5. process items one at a time, committing every `commit_interval` items
//! 6. stop early when the circuit opens or the batch is paused
//!
//! Passes are triggered by a periodic tick, by explicit "process now" requests
//! and by continuations the driver schedules for itself.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use remitsync_core::{BatchId, DomainError, TaxIdentifier};
use remitsync_reconciliation::{
    Applied, Batch, BatchCounts, Checkpoint, CheckpointState, PaymentRow, ProgressOutcome,
    WorkItem,
};
use remitsync_remote::{
    CircuitSnapshot, FlowControl, GuardedError, IdentityResolver, LedgerApi, RemoteError,
    Resolution, ScopeContext,
};

use crate::config::Settings;
use crate::pipeline::processor::{ItemProcessor, Processed};
use crate::store::{PipelineStore, StoreError};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A pass over the batch is running or queued.
    #[error("batch {0} is being processed, try again when the pass is over")]
    Busy(BatchId),

    #[error("scheduler driver has stopped")]
    Stopped,
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// Nothing outstanding; the checkpoint is now `completed`.
    Completed,
    /// Runnable items remain; a continuation follows shortly.
    Continue,
    /// Items are outstanding but none is due yet; the periodic tick picks
    /// the batch up again.
    Waiting,
    /// The remote side is unavailable; retry after the given delay.
    Deferred { retry_in: Duration },
    /// The batch was paused before or during the pass.
    Paused,
    /// The checkpoint was not running (completed, failed).
    NotRunning(CheckpointState),
    /// Fatal configuration; the checkpoint was marked failed.
    Failed(String),
}

/// Summary of one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub batch_id: BatchId,
    pub outcome: PassOutcome,
    /// Items claimed and handed to the processor.
    pub attempted: usize,
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rescheduled: usize,
}

impl PassReport {
    fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            outcome: PassOutcome::Waiting,
            attempted: 0,
            done: 0,
            skipped: 0,
            failed: 0,
            rescheduled: 0,
        }
    }

    fn record(&mut self, applied: Applied) {
        match applied {
            Applied::Done => self.done += 1,
            Applied::Skipped => self.skipped += 1,
            Applied::Failed => self.failed += 1,
            Applied::Rescheduled { .. } => self.rescheduled += 1,
        }
    }

    fn finish(mut self, outcome: PassOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// A checkpoint together with item counts, for progress reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub batch: Batch,
    pub checkpoint: Checkpoint,
    pub counts: BatchCounts,
}

/// Why the scope context could not be resolved.
enum ContextError {
    Fatal(String),
    Transient(String),
    CircuitOpen(Duration),
}

impl From<GuardedError> for ContextError {
    fn from(err: GuardedError) -> Self {
        match err {
            GuardedError::CircuitOpen { retry_in } => ContextError::CircuitOpen(retry_in),
            GuardedError::Remote(
                e @ (RemoteError::Auth(_) | RemoteError::NotFound(_) | RemoteError::Fault(_)),
            ) => ContextError::Fatal(e.to_string()),
            GuardedError::Remote(e) => ContextError::Transient(e.to_string()),
        }
    }
}

/// Removes the batch from the in-flight set when the pass ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<BatchId>>,
    batch_id: BatchId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.batch_id);
    }
}

pub struct SchedulerDriver {
    store: Arc<dyn PipelineStore>,
    ledger: Arc<dyn LedgerApi>,
    flow: Arc<FlowControl>,
    settings: Settings,
    in_flight: Mutex<HashSet<BatchId>>,
    permits: Semaphore,
}

impl SchedulerDriver {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        ledger: Arc<dyn LedgerApi>,
        flow: Arc<FlowControl>,
        settings: Settings,
    ) -> Self {
        let permits = Semaphore::new(settings.pipeline.max_concurrent_batches.max(1));
        Self {
            store,
            ledger,
            flow,
            settings,
            in_flight: Mutex::new(HashSet::new()),
            permits,
        }
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.flow.circuit()
    }

    /// Manual breaker reset (administrative).
    pub fn reset_circuit(&self) -> CircuitSnapshot {
        self.flow.breaker().reset();
        self.flow.circuit()
    }

    /// Accept an ingested batch: one work item per row, in row order, and a
    /// running checkpoint. Rows must carry an identifier or a nonzero amount.
    pub async fn ingest(
        &self,
        source_name: impl Into<String>,
        rows: Vec<PaymentRow>,
    ) -> Result<Checkpoint, DriverError> {
        for (idx, row) in rows.iter().enumerate() {
            row.validate().map_err(|e| match e {
                DomainError::Validation(msg) => {
                    DomainError::validation(format!("row {}: {msg}", idx + 1))
                }
                other => other,
            })?;
        }

        let batch = Batch::new(source_name, rows.len() as u64);
        let max_attempts = self.settings.pipeline.max_attempts;
        let items: Vec<WorkItem> = rows
            .into_iter()
            .enumerate()
            .map(|(idx, row)| {
                WorkItem::new(batch.id, idx as u32 + 1, row).with_max_attempts(max_attempts)
            })
            .collect();
        let checkpoint = Checkpoint::new(batch.id, batch.total_rows, batch.created_at);

        self.store.create_batch(&batch, &items, &checkpoint).await?;
        info!(
            batch_id = %batch.id,
            source = %batch.source_name,
            rows = batch.total_rows,
            "batch accepted"
        );
        Ok(checkpoint)
    }

    pub async fn summary(&self, batch_id: BatchId) -> Result<BatchSummary, DriverError> {
        Ok(BatchSummary {
            batch: self.store.get_batch(batch_id).await?,
            checkpoint: self.store.get_checkpoint(batch_id).await?,
            counts: self.store.batch_counts(batch_id).await?,
        })
    }

    pub async fn pause(&self, batch_id: BatchId) -> Result<Checkpoint, DriverError> {
        let mut checkpoint = self.store.get_checkpoint(batch_id).await?;
        checkpoint.pause(Utc::now())?;
        self.store.save_checkpoint(&checkpoint).await?;
        info!(batch_id = %batch_id, "batch paused");
        Ok(self.store.get_checkpoint(batch_id).await?)
    }

    /// Back to `running`, from `paused` or a fatal `failed`.
    pub async fn resume(&self, batch_id: BatchId) -> Result<Checkpoint, DriverError> {
        let mut checkpoint = self.store.get_checkpoint(batch_id).await?;
        checkpoint.resume(Utc::now())?;
        self.store.save_checkpoint(&checkpoint).await?;
        info!(batch_id = %batch_id, "batch resumed");
        Ok(self.store.get_checkpoint(batch_id).await?)
    }

    /// Give terminally failed items a fresh retry budget. Rejected while a
    /// pass over the batch is in flight.
    pub async fn requeue_failed(&self, batch_id: BatchId) -> Result<u64, DriverError> {
        let _guard = self.claim(batch_id)?;
        let requeued = self.store.requeue_failed(batch_id, Utc::now()).await?;
        info!(batch_id = %batch_id, requeued, "failed items requeued");
        Ok(requeued)
    }

    /// Crash recovery: return every `processing` item of every unfinished
    /// batch to `pending`. Items that already spent their last attempt are
    /// closed out as failed. Returns the number of reclaimed items.
    pub async fn recover(&self) -> Result<usize, DriverError> {
        let mut reclaimed_total = 0;
        for checkpoint in self.store.list_checkpoints().await? {
            if checkpoint.state.is_terminal() {
                continue;
            }
            let (reclaimed, _) = self.reclaim_stale(checkpoint).await?;
            reclaimed_total += reclaimed;
        }
        Ok(reclaimed_total)
    }

    /// Put `processing` items of one batch back to `pending`, exhausting the
    /// ones with no attempts left. The caller must own the batch (recovery at
    /// startup, or a claimed pass). Returns the reclaimed count and the
    /// checkpoint as stored afterwards.
    async fn reclaim_stale(
        &self,
        mut checkpoint: Checkpoint,
    ) -> Result<(usize, Checkpoint), DriverError> {
        let batch_id = checkpoint.batch_id;
        let now = Utc::now();
        let reclaimed = self.store.reclaim_processing(batch_id, now).await?;
        if reclaimed.is_empty() {
            return Ok((0, checkpoint));
        }
        let count = reclaimed.len();

        let mut exhausted = Vec::new();
        for mut item in reclaimed.into_iter().filter(|it| !it.has_attempts_left()) {
            item.exhaust(now)?;
            checkpoint.update_progress(1, ProgressOutcome::Failed, now)?;
            exhausted.push(item);
        }
        if !exhausted.is_empty() {
            checkpoint = self.store.commit(&exhausted, &checkpoint).await?;
        }
        warn!(
            batch_id = %batch_id,
            reclaimed = count,
            exhausted = exhausted.len(),
            "reclaimed items left in processing"
        );
        Ok((count, checkpoint))
    }

    fn claim(&self, batch_id: BatchId) -> Result<InFlight<'_>, DriverError> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(batch_id) {
            return Err(DriverError::Busy(batch_id));
        }
        Ok(InFlight {
            set: &self.in_flight,
            batch_id,
        })
    }

    /// Run one pass over a batch. At most `max_concurrent_batches` passes run
    /// at once; a second pass over the same batch is rejected with `Busy`.
    pub async fn run_pass(&self, batch_id: BatchId) -> Result<PassReport, DriverError> {
        let _guard = self.claim(batch_id)?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DriverError::Stopped)?;

        let report = self.pass(batch_id).await?;
        info!(
            batch_id = %batch_id,
            outcome = ?report.outcome,
            attempted = report.attempted,
            done = report.done,
            skipped = report.skipped,
            failed = report.failed,
            rescheduled = report.rescheduled,
            "pass finished"
        );
        Ok(report)
    }

    async fn pass(&self, batch_id: BatchId) -> Result<PassReport, DriverError> {
        let report = PassReport::new(batch_id);
        let mut checkpoint = self.store.get_checkpoint(batch_id).await?;
        match checkpoint.state {
            CheckpointState::Running => {}
            CheckpointState::Paused => return Ok(report.finish(PassOutcome::Paused)),
            state => return Ok(report.finish(PassOutcome::NotRunning(state))),
        }

        if let Err(err) = self.settings.validate() {
            return self.fail(report, checkpoint, err.to_string()).await;
        }

        // Claims left behind by an aborted pass of this batch.
        let (_, reclaimed) = self.reclaim_stale(checkpoint).await?;
        checkpoint = reclaimed;
        if checkpoint.state == CheckpointState::Paused {
            return Ok(report.finish(PassOutcome::Paused));
        }

        let pipeline = &self.settings.pipeline;
        let slice = self
            .store
            .select_runnable(batch_id, Utc::now(), pipeline.batch_size)
            .await?;
        if slice.is_empty() {
            let outcome = self.settle(&mut checkpoint).await?;
            return Ok(report.finish(outcome));
        }

        if let Some(retry_in) = self.flow.breaker().retry_in() {
            debug!(batch_id = %batch_id, retry_in_secs = retry_in.as_secs(), "circuit open, pass deferred");
            return Ok(report.finish(PassOutcome::Deferred { retry_in }));
        }

        let scope = match self.scope_context().await {
            Ok(scope) => scope,
            Err(ContextError::Fatal(msg)) => return self.fail(report, checkpoint, msg).await,
            Err(ContextError::Transient(msg)) => {
                warn!(batch_id = %batch_id, error = %msg, "remote unavailable, pass deferred");
                let retry_in = Duration::from_secs(pipeline.poll_interval_secs);
                return Ok(report.finish(PassOutcome::Deferred { retry_in }));
            }
            Err(ContextError::CircuitOpen(retry_in)) => {
                return Ok(report.finish(PassOutcome::Deferred { retry_in }));
            }
        };

        let identifiers: Vec<TaxIdentifier> = slice
            .iter()
            .filter_map(|it| it.payment.identifier())
            .collect();
        let resolution = match IdentityResolver::new(self.ledger.as_ref(), &self.flow)
            .resolve(&identifiers, &scope)
            .await
        {
            Ok(resolution) => resolution,
            Err(GuardedError::CircuitOpen { retry_in }) => {
                return Ok(report.finish(PassOutcome::Deferred { retry_in }));
            }
            Err(GuardedError::Remote(err)) => {
                // Items with an identifier fail this attempt and are retried.
                warn!(batch_id = %batch_id, error = %err, "identity resolution failed");
                Resolution::default()
            }
        };

        let processor = ItemProcessor::new(
            self.ledger.as_ref(),
            &self.flow,
            &scope,
            &resolution,
            pipeline.amount_tolerance,
        )
        .with_payment_method(self.settings.remote.payment_method());

        let result = self.process_slice(report, checkpoint, slice, &processor).await;
        if let Err(err) = &result {
            // Do not leave the claimed item in `processing` until the next pass.
            if let Err(reclaim_err) = self.store.reclaim_processing(batch_id, Utc::now()).await {
                warn!(
                    batch_id = %batch_id,
                    error = %err,
                    reclaim_error = %reclaim_err,
                    "pass aborted, claimed items left in processing"
                );
            }
        }
        result
    }

    async fn process_slice(
        &self,
        mut report: PassReport,
        mut checkpoint: Checkpoint,
        slice: Vec<WorkItem>,
        processor: &ItemProcessor<'_>,
    ) -> Result<PassReport, DriverError> {
        let batch_id = checkpoint.batch_id;
        let commit_interval = self.settings.pipeline.commit_interval.max(1);
        let mut uncommitted: Vec<WorkItem> = Vec::with_capacity(commit_interval);

        for mut item in slice {
            if !item.has_attempts_left() {
                let now = Utc::now();
                let applied = item.exhaust(now)?;
                checkpoint.update_progress(1, ProgressOutcome::Failed, now)?;
                report.record(applied);
                uncommitted.push(item);
                continue;
            }

            item.mark_processing(Utc::now())?;
            self.store.mark_processing(&item).await?;
            report.attempted += 1;

            match processor.process(&item).await {
                Processed::Finished { outcome, elapsed } => {
                    let now = Utc::now();
                    item.processing_ms = Some(elapsed.as_millis() as u64);
                    let applied = item.apply_outcome(outcome, now)?;
                    if let Some(progress) = ProgressOutcome::for_applied(applied) {
                        checkpoint.update_progress(1, progress, now)?;
                    }
                    debug!(
                        batch_id = %batch_id,
                        item_id = %item.id,
                        row = item.row_number,
                        state = item.state.as_str(),
                        attempts = item.attempts,
                        "item settled"
                    );
                    report.record(applied);
                    uncommitted.push(item);
                }
                Processed::CircuitOpen { retry_in } => {
                    item.release(Utc::now())?;
                    uncommitted.push(item);
                    self.flush(&mut uncommitted, &checkpoint).await?;
                    warn!(
                        batch_id = %batch_id,
                        retry_in_secs = retry_in.as_secs(),
                        "circuit opened mid-pass, remaining items left pending"
                    );
                    return Ok(report.finish(PassOutcome::Deferred { retry_in }));
                }
            }

            if uncommitted.len() >= commit_interval {
                checkpoint = self.flush(&mut uncommitted, &checkpoint).await?;
                if checkpoint.state == CheckpointState::Paused {
                    return Ok(report.finish(PassOutcome::Paused));
                }
            }
        }

        checkpoint = self.flush(&mut uncommitted, &checkpoint).await?;
        if checkpoint.state == CheckpointState::Paused {
            return Ok(report.finish(PassOutcome::Paused));
        }

        let more = self.store.select_runnable(batch_id, Utc::now(), 1).await?;
        if !more.is_empty() {
            return Ok(report.finish(PassOutcome::Continue));
        }
        let outcome = self.settle(&mut checkpoint).await?;
        Ok(report.finish(outcome))
    }

    /// Commit the pending items with the checkpoint; returns the stored
    /// checkpoint, which reflects a pause that raced the pass.
    async fn flush(
        &self,
        items: &mut Vec<WorkItem>,
        checkpoint: &Checkpoint,
    ) -> Result<Checkpoint, DriverError> {
        let mut checkpoint = checkpoint.clone();
        checkpoint.last_checkpoint_at = Utc::now();
        let stored = self.store.commit(items, &checkpoint).await?;
        items.clear();
        Ok(stored)
    }

    /// Nothing runnable right now: complete the batch if nothing is
    /// outstanding, otherwise wait for scheduled retries.
    async fn settle(&self, checkpoint: &mut Checkpoint) -> Result<PassOutcome, DriverError> {
        let counts = self.store.batch_counts(checkpoint.batch_id).await?;
        if counts.outstanding() > 0 {
            return Ok(PassOutcome::Waiting);
        }
        checkpoint.mark_completed(Utc::now());
        let stored = self.store.commit(&[], checkpoint).await?;
        info!(
            batch_id = %stored.batch_id,
            success = stored.success_count,
            failed = stored.failed_count,
            skipped = stored.skipped_count,
            "batch completed"
        );
        *checkpoint = stored;
        Ok(PassOutcome::Completed)
    }

    async fn fail(
        &self,
        report: PassReport,
        mut checkpoint: Checkpoint,
        message: String,
    ) -> Result<PassReport, DriverError> {
        error!(batch_id = %checkpoint.batch_id, error = %message, "fatal configuration, batch failed");
        checkpoint.mark_failed(message.clone(), Utc::now());
        self.store.save_checkpoint(&checkpoint).await?;
        Ok(report.finish(PassOutcome::Failed(message)))
    }

    /// Open a session and resolve the target scope and the visible scopes.
    async fn scope_context(&self) -> Result<ScopeContext, ContextError> {
        let ledger = self.ledger.as_ref();
        let journal_id = self.settings.remote.journal_id;

        self.flow
            .call("authenticate", || ledger.authenticate())
            .await?;
        let target_scope = self
            .flow
            .call("journal_scope", || ledger.journal_scope(journal_id))
            .await?;

        let visible_scopes = match self.flow.call("list_scopes", || ledger.list_scopes()).await {
            Ok(scopes) if !scopes.is_empty() => scopes,
            Ok(_) => vec![target_scope],
            Err(GuardedError::CircuitOpen { retry_in }) => {
                return Err(ContextError::CircuitOpen(retry_in));
            }
            Err(GuardedError::Remote(err)) => {
                warn!(error = %err, "listing scopes failed, searching the target scope only");
                vec![target_scope]
            }
        };

        Ok(ScopeContext {
            journal_id,
            target_scope,
            visible_scopes,
        })
    }

    /// Start the periodic tick and the trigger loop. Recovery runs first.
    pub fn spawn(self: Arc<Self>) -> DriverHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let trigger = BatchTrigger { tx };
        let loop_trigger = trigger.clone();
        let poll_interval = Duration::from_secs(self.settings.pipeline.poll_interval_secs.max(1));

        let join = tokio::spawn(async move {
            info!(poll_interval_secs = poll_interval.as_secs(), "scheduler driver started");
            match self.recover().await {
                Ok(0) => {}
                Ok(n) => info!(reclaimed = n, "crash recovery finished"),
                Err(err) => error!(error = %err, "crash recovery failed"),
            }

            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => self.tick(&loop_trigger).await,
                    Some(batch_id) = rx.recv() => Arc::clone(&self).dispatch(batch_id, loop_trigger.clone()),
                }
            }
            info!("scheduler driver stopped");
        });

        DriverHandle {
            trigger,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    async fn tick(self: &Arc<Self>, trigger: &BatchTrigger) {
        let limit = self.settings.pipeline.max_concurrent_batches;
        match self.store.running_checkpoints(limit).await {
            Ok(running) => {
                for checkpoint in running {
                    Arc::clone(self).dispatch(checkpoint.batch_id, trigger.clone());
                }
            }
            Err(err) => error!(error = %err, "failed to list running batches"),
        }
    }

    fn dispatch(self: Arc<Self>, batch_id: BatchId, trigger: BatchTrigger) {
        tokio::spawn(async move {
            match self.run_pass(batch_id).await {
                Ok(report) => {
                    if let Some(delay) = self.follow_up(&report.outcome) {
                        trigger.after(delay, batch_id);
                    }
                }
                Err(DriverError::Busy(_)) => debug!(batch_id = %batch_id, "pass already in flight"),
                Err(err) => error!(batch_id = %batch_id, error = %err, "pass failed"),
            }
        });
    }

    fn follow_up(&self, outcome: &PassOutcome) -> Option<Duration> {
        match outcome {
            PassOutcome::Continue => Some(Duration::from_secs(
                self.settings.pipeline.continuation_delay_secs,
            )),
            PassOutcome::Deferred { retry_in } => Some(*retry_in),
            _ => None,
        }
    }
}

/// "Process this batch now" entry point of a running driver.
#[derive(Debug, Clone)]
pub struct BatchTrigger {
    tx: mpsc::UnboundedSender<BatchId>,
}

impl BatchTrigger {
    /// Request a pass. Redundant requests are harmless.
    pub fn trigger(&self, batch_id: BatchId) -> Result<(), DriverError> {
        self.tx.send(batch_id).map_err(|_| DriverError::Stopped)
    }

    /// Request a pass after `delay`.
    pub fn after(&self, delay: Duration, batch_id: BatchId) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(batch_id);
        });
    }
}

/// Handle to a spawned driver. Dropping it stops the tick loop, like
/// `shutdown` without waiting.
#[derive(Debug)]
pub struct DriverHandle {
    trigger: BatchTrigger,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl DriverHandle {
    pub fn trigger(&self) -> BatchTrigger {
        self.trigger.clone()
    }

    /// Stop the tick loop and wait for it. Passes already running finish on
    /// their own.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}
