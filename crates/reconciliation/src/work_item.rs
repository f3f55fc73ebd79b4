//! Work items and their retry state machine.
//!
//! ```text
//!            mark_processing            apply_outcome
//! pending ─────────────────► processing ─────────────► done | skipped
//!    ▲                          │  │
//!    │   release / reclaim      │  │ failure, attempts < max
//!    └──────────────────────────┘  └──────► pending (scheduled_at = now + 2^attempts min)
//!                                  │
//!                                  └ failure, attempts >= max ─► failed
//! ```
//!
//! `done`, `skipped` and exhausted `failed` are terminal. `processing` is
//! transient: after a crash it is reclaimed to `pending`.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use remitsync_core::{BatchId, DomainError, DomainResult, TaxIdentifier, WorkItemId};

use crate::outcome::{Disposition, ItemOutcome, OutcomeCode, PartyRef};

/// Default retry budget of a new item.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default priority (higher is served first).
pub const DEFAULT_PRIORITY: i32 = 10;

/// Work item state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Pending,
    Processing,
    Done,
    Failed,
    Skipped,
}

impl WorkItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemState::Pending => "pending",
            WorkItemState::Processing => "processing",
            WorkItemState::Done => "done",
            WorkItemState::Failed => "failed",
            WorkItemState::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => WorkItemState::Pending,
            "processing" => WorkItemState::Processing,
            "done" => WorkItemState::Done,
            "failed" => WorkItemState::Failed,
            "skipped" => WorkItemState::Skipped,
            _ => return None,
        })
    }
}

/// The payment row as handed over by ingestion.
///
/// `source` is an opaque copy of the original row, kept for diagnostics only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRow {
    pub payment_date: NaiveDate,
    pub raw_identifier: String,
    #[serde(default)]
    pub memo: String,
    pub amount: f64,
    #[serde(default)]
    pub source: serde_json::Value,
}

impl PaymentRow {
    /// Ingestion contract: a row needs an identifier or a nonzero amount.
    pub fn validate(&self) -> DomainResult<()> {
        if !self.amount.is_finite() {
            return Err(DomainError::validation("amount must be a finite number"));
        }
        if self.raw_identifier.trim().is_empty() && self.amount == 0.0 {
            return Err(DomainError::validation(
                "row has neither an identifier nor a nonzero amount",
            ));
        }
        Ok(())
    }

    pub fn identifier(&self) -> Option<TaxIdentifier> {
        TaxIdentifier::parse(&self.raw_identifier)
    }
}

/// What applying an outcome did to the item.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Applied {
    Done,
    Skipped,
    /// Transient failure; the item is pending again until `at`.
    Rescheduled { at: DateTime<Utc> },
    /// Retry budget exhausted; terminal.
    Failed,
}

impl Applied {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Applied::Rescheduled { .. })
    }
}

/// One row to reconcile against the remote ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub batch_id: BatchId,
    pub row_number: u32,
    pub payment: PaymentRow,
    pub state: WorkItemState,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the item may be retried.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Higher is served first.
    pub priority: i32,
    pub party_id: Option<i64>,
    pub party_name: Option<String>,
    pub remote_receipt_id: Option<i64>,
    pub detected_debt: Option<f64>,
    pub outcome: Option<OutcomeCode>,
    pub error_message: Option<String>,
    pub processing_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(batch_id: BatchId, row_number: u32, payment: PaymentRow) -> Self {
        let now = Utc::now();
        Self {
            id: WorkItemId::new(),
            batch_id,
            row_number,
            payment,
            state: WorkItemState::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: None,
            priority: DEFAULT_PRIORITY,
            party_id: None,
            party_name: None,
            remote_receipt_id: None,
            detected_debt: None,
            outcome: None,
            error_message: None,
            processing_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_terminal(&self) -> bool {
        match self.state {
            WorkItemState::Done | WorkItemState::Skipped => true,
            WorkItemState::Failed => self.attempts >= self.max_attempts,
            WorkItemState::Pending | WorkItemState::Processing => false,
        }
    }

    /// Whether the item may be selected for a processing pass at `now`.
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        let state_ok = match self.state {
            WorkItemState::Pending => true,
            WorkItemState::Failed => self.attempts < self.max_attempts,
            _ => false,
        };
        state_ok && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Whether another attempt is allowed by the retry budget.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Backoff before the next retry: `2^attempts` minutes.
    pub fn retry_delay(attempts: u32) -> Duration {
        // Exponent capped so the resulting timestamp stays representable.
        Duration::minutes(2_i64.pow(attempts.min(30)))
    }

    /// Claim the item for a processing attempt.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !matches!(self.state, WorkItemState::Pending | WorkItemState::Failed) || self.is_terminal() {
            return Err(self.illegal("mark_processing"));
        }
        if !self.has_attempts_left() {
            return Err(DomainError::invariant(format!(
                "work item {} has no attempts left ({}/{})",
                self.id, self.attempts, self.max_attempts
            )));
        }
        self.state = WorkItemState::Processing;
        self.attempts += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Record the processor's conclusion for the current attempt.
    pub fn apply_outcome(&mut self, outcome: ItemOutcome, now: DateTime<Utc>) -> DomainResult<Applied> {
        if self.state != WorkItemState::Processing {
            return Err(self.illegal("apply_outcome"));
        }

        if let Some(PartyRef { id, name }) = outcome.party {
            self.party_id = Some(id);
            self.party_name = Some(name);
        }
        if outcome.detected_debt.is_some() {
            self.detected_debt = outcome.detected_debt;
        }
        if outcome.receipt_id.is_some() {
            self.remote_receipt_id = outcome.receipt_id;
        }
        self.outcome = Some(outcome.code);
        self.updated_at = now;

        let applied = match outcome.disposition {
            Disposition::Done => {
                self.state = WorkItemState::Done;
                self.scheduled_at = None;
                self.error_message = None;
                Applied::Done
            }
            Disposition::Skipped(_) => {
                self.state = WorkItemState::Skipped;
                self.scheduled_at = None;
                self.error_message = Some(outcome.message);
                Applied::Skipped
            }
            Disposition::Failed => {
                self.error_message = Some(outcome.message);
                self.fail_attempt(now)
            }
        };
        Ok(applied)
    }

    /// Close out an item whose retry budget was already spent before it could
    /// be attempted again (e.g. reclaimed after a crash on its last attempt).
    pub fn exhaust(&mut self, now: DateTime<Utc>) -> DomainResult<Applied> {
        if self.is_terminal() || self.state == WorkItemState::Processing || self.has_attempts_left() {
            return Err(self.illegal("exhaust"));
        }
        self.state = WorkItemState::Failed;
        self.outcome.get_or_insert(OutcomeCode::Error);
        let note = format!("retry budget exhausted after {} attempts", self.attempts);
        self.error_message = Some(match self.error_message.take() {
            Some(prev) => format!("{note}; last error: {prev}"),
            None => note,
        });
        self.scheduled_at = None;
        self.updated_at = now;
        Ok(Applied::Failed)
    }

    fn fail_attempt(&mut self, now: DateTime<Utc>) -> Applied {
        if self.attempts >= self.max_attempts {
            self.state = WorkItemState::Failed;
            self.scheduled_at = None;
            Applied::Failed
        } else {
            let at = now + Self::retry_delay(self.attempts);
            self.state = WorkItemState::Pending;
            self.scheduled_at = Some(at);
            Applied::Rescheduled { at }
        }
    }

    /// Give back a claimed item whose attempt never reached the remote side
    /// (the circuit was open). The attempt is not counted.
    pub fn release(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state != WorkItemState::Processing {
            return Err(self.illegal("release"));
        }
        self.state = WorkItemState::Pending;
        self.attempts = self.attempts.saturating_sub(1);
        self.updated_at = now;
        Ok(())
    }

    /// Crash recovery: an item found in `processing` goes back to `pending`.
    /// The attempt may have reached the remote side, so it stays counted.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state != WorkItemState::Processing {
            return Err(self.illegal("reclaim"));
        }
        self.state = WorkItemState::Pending;
        self.updated_at = now;
        Ok(())
    }

    /// Administrative retry of a terminally failed item.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state != WorkItemState::Failed {
            return Err(self.illegal("requeue"));
        }
        self.state = WorkItemState::Pending;
        self.attempts = 0;
        self.scheduled_at = None;
        self.outcome = None;
        self.updated_at = now;
        Ok(())
    }

    fn illegal(&self, op: &str) -> DomainError {
        DomainError::invariant(format!(
            "cannot {op} work item {} in state {}",
            self.id,
            self.state.as_str()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::SkipReason;

    fn row() -> PaymentRow {
        PaymentRow {
            payment_date: NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            raw_identifier: "30-12345678-9".to_string(),
            memo: "invoice 12".to_string(),
            amount: 1000.0,
            source: serde_json::json!({"row": 1}),
        }
    }

    fn item() -> WorkItem {
        WorkItem::new(BatchId::new(), 1, row())
    }

    #[test]
    fn validate_requires_identifier_or_amount() {
        let mut r = row();
        assert!(r.validate().is_ok());

        r.raw_identifier = "  ".to_string();
        assert!(r.validate().is_ok(), "nonzero amount alone is enough");

        r.amount = 0.0;
        assert!(matches!(r.validate(), Err(DomainError::Validation(_))));

        r.amount = f64::NAN;
        r.raw_identifier = "20111222".to_string();
        assert!(r.validate().is_err());
    }

    #[test]
    fn processing_increments_attempts() {
        let mut it = item();
        let now = Utc::now();
        it.mark_processing(now).unwrap();
        assert_eq!(it.state, WorkItemState::Processing);
        assert_eq!(it.attempts, 1);

        assert!(it.mark_processing(now).is_err(), "already processing");
    }

    #[test]
    fn failure_below_budget_reschedules_with_exponential_backoff() {
        let mut it = item().with_max_attempts(5);
        it.attempts = 3;
        let now = Utc::now();

        it.mark_processing(now).unwrap();
        assert_eq!(it.attempts, 4);

        let applied = it.apply_outcome(ItemOutcome::unexpected("boom"), now).unwrap();
        let expected = now + Duration::minutes(16);
        assert_eq!(applied, Applied::Rescheduled { at: expected });
        assert_eq!(it.state, WorkItemState::Pending);
        assert_eq!(it.scheduled_at, Some(expected));
        assert!(!it.is_runnable(now));
        assert!(it.is_runnable(expected));
    }

    #[test]
    fn failure_at_budget_is_terminal() {
        let mut it = item().with_max_attempts(5);
        it.attempts = 4;
        let now = Utc::now();

        it.mark_processing(now).unwrap();
        assert_eq!(it.attempts, 5);

        let applied = it.apply_outcome(ItemOutcome::unexpected("boom"), now).unwrap();
        assert_eq!(applied, Applied::Failed);
        assert_eq!(it.state, WorkItemState::Failed);
        assert!(it.is_terminal());
        assert!(!it.is_runnable(now + Duration::days(365)));
    }

    #[test]
    fn skipped_is_terminal_regardless_of_attempts() {
        let mut it = item();
        let now = Utc::now();
        it.mark_processing(now).unwrap();
        let applied = it.apply_outcome(ItemOutcome::no_identifier(), now).unwrap();
        assert_eq!(applied, Applied::Skipped);
        assert!(it.is_terminal());
        assert!(!it.is_runnable(now));
        assert_eq!(it.error_message.as_deref(), Some("no valid identifier"));
        assert_eq!(it.outcome, Some(OutcomeCode::NoIdentifier));
    }

    #[test]
    fn done_keeps_party_and_receipt() {
        let mut it = item();
        let now = Utc::now();
        it.mark_processing(now).unwrap();
        let party = PartyRef {
            id: 42,
            name: "ACME".to_string(),
        };
        let outcome = ItemOutcome::from_receipt_state(party, 1000.0, 900, "posted", false, None);
        assert_eq!(it.apply_outcome(outcome, now).unwrap(), Applied::Done);
        assert_eq!(it.party_id, Some(42));
        assert_eq!(it.party_name.as_deref(), Some("ACME"));
        assert_eq!(it.remote_receipt_id, Some(900));
        assert_eq!(it.detected_debt, Some(1000.0));
    }

    #[test]
    fn release_does_not_count_the_attempt() {
        let mut it = item();
        let now = Utc::now();
        it.mark_processing(now).unwrap();
        it.release(now).unwrap();
        assert_eq!(it.state, WorkItemState::Pending);
        assert_eq!(it.attempts, 0);
    }

    #[test]
    fn reclaim_keeps_the_attempt_and_exhaust_closes_spent_items() {
        let mut it = item().with_max_attempts(1);
        let now = Utc::now();
        it.mark_processing(now).unwrap();
        it.reclaim(now).unwrap();
        assert_eq!(it.state, WorkItemState::Pending);
        assert_eq!(it.attempts, 1);

        assert!(it.mark_processing(now).is_err());
        assert_eq!(it.exhaust(now).unwrap(), Applied::Failed);
        assert!(it.is_terminal());
    }

    #[test]
    fn requeue_resets_failed_items() {
        let mut it = item().with_max_attempts(1);
        let now = Utc::now();
        it.mark_processing(now).unwrap();
        it.apply_outcome(ItemOutcome::unexpected("boom"), now).unwrap();
        assert_eq!(it.state, WorkItemState::Failed);

        it.requeue(now).unwrap();
        assert_eq!(it.state, WorkItemState::Pending);
        assert_eq!(it.attempts, 0);
        assert!(it.is_runnable(now));
    }

    #[test]
    fn failed_below_budget_is_still_runnable() {
        let mut it = item().with_max_attempts(3);
        it.state = WorkItemState::Failed;
        it.attempts = 1;
        assert!(!it.is_terminal());
        assert!(it.is_runnable(Utc::now()));
    }

    #[test]
    fn skip_reason_round_trips_through_json() {
        let json = serde_json::to_string(&SkipReason::PartyNotFound).unwrap();
        assert_eq!(json, "\"party_not_found\"");
    }

    proptest::proptest! {
        /// Property: attempts never exceed max_attempts while pending/processing,
        /// whatever mix of outcomes is applied.
        #[test]
        fn attempts_stay_within_budget(
            max in 1u32..8,
            failures in proptest::collection::vec(proptest::bool::ANY, 1..20)
        ) {
            let mut it = item().with_max_attempts(max);
            let mut now = Utc::now();
            for fail in failures {
                if it.is_terminal() {
                    break;
                }
                it.mark_processing(now).unwrap();
                proptest::prop_assert!(it.attempts <= it.max_attempts);
                let outcome = if fail {
                    ItemOutcome::unexpected("x")
                } else {
                    ItemOutcome::no_identifier()
                };
                it.apply_outcome(outcome, now).unwrap();
                if matches!(it.state, WorkItemState::Pending) {
                    proptest::prop_assert!(it.attempts < it.max_attempts);
                    now = it.scheduled_at.unwrap();
                }
            }
        }
    }
}
