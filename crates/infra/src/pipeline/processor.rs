//! The per-item reconciliation algorithm.
//!
//! 1. normalize the identifier (blank -> skipped)
//! 2. read the pass's identity resolution (no party -> skipped)
//! 3. fetch the party's outstanding receivable debt
//! 4. tolerance match (mismatch -> skipped)
//! 5. adopt an existing receipt carrying the idempotency key, or
//! 6. create the receipt and try to finalize it
//! 7. classify from the receipt state read back from the remote side
//!
//! Every remote call goes through `FlowControl`. An open circuit is not an
//! outcome: it is returned as `Processed::CircuitOpen` and the caller gives the
//! item back untouched.

use std::time::{Duration, Instant};

use tracing::debug;

use remitsync_reconciliation::{IdempotencyKey, ItemOutcome, PartyRef, WorkItem};
use remitsync_remote::{
    FlowControl, GuardedError, LedgerApi, Lookup, ReceiptDraft, ReceiptRef, Resolution,
    ScopeContext,
};

/// Receipt states the remote side reports for a settled receipt.
const SETTLED_STATES: [&str; 2] = ["posted", "in_process"];

/// Absorbs float noise in `|amount - debt| <= tolerance`.
const TOLERANCE_EPSILON: f64 = 1e-9;

/// Result of one processing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Finished {
        outcome: ItemOutcome,
        elapsed: Duration,
    },
    /// The breaker rejected a call; nothing about the item was concluded.
    CircuitOpen { retry_in: Duration },
}

/// Why a step stopped early.
enum Halt {
    Outcome(ItemOutcome),
    CircuitOpen(Duration),
}

impl Halt {
    fn from_guarded(err: GuardedError, party: Option<&PartyRef>, debt: Option<f64>) -> Self {
        match err {
            GuardedError::CircuitOpen { retry_in } => Halt::CircuitOpen(retry_in),
            GuardedError::Remote(e) => {
                Halt::Outcome(ItemOutcome::unexpected(e).with_context(party.cloned(), debt))
            }
        }
    }
}

/// Per-pass item processor. Built once per pass, after scope and identity
/// resolution, and used for every item of the slice.
pub struct ItemProcessor<'a> {
    api: &'a dyn LedgerApi,
    flow: &'a FlowControl,
    scope: &'a ScopeContext,
    resolution: &'a Resolution,
    tolerance: f64,
    payment_method_line_id: Option<i64>,
}

impl<'a> ItemProcessor<'a> {
    pub fn new(
        api: &'a dyn LedgerApi,
        flow: &'a FlowControl,
        scope: &'a ScopeContext,
        resolution: &'a Resolution,
        tolerance: f64,
    ) -> Self {
        Self {
            api,
            flow,
            scope,
            resolution,
            tolerance,
            payment_method_line_id: None,
        }
    }

    pub fn with_payment_method(mut self, payment_method_line_id: Option<i64>) -> Self {
        self.payment_method_line_id = payment_method_line_id;
        self
    }

    pub async fn process(&self, item: &WorkItem) -> Processed {
        let started = Instant::now();
        let result = self.run(item).await;
        let elapsed = started.elapsed();

        match result {
            Ok(outcome) | Err(Halt::Outcome(outcome)) => {
                debug!(
                    item_id = %item.id,
                    row = item.row_number,
                    outcome = outcome.code.as_str(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "item processed"
                );
                Processed::Finished { outcome, elapsed }
            }
            Err(Halt::CircuitOpen(retry_in)) => Processed::CircuitOpen { retry_in },
        }
    }

    async fn run(&self, item: &WorkItem) -> Result<ItemOutcome, Halt> {
        let payment = &item.payment;

        let Some(identifier) = payment.identifier() else {
            return Ok(ItemOutcome::no_identifier());
        };

        let record = match self.resolution.get(&identifier) {
            Lookup::Found(record) => record,
            Lookup::NotFound => return Ok(ItemOutcome::party_not_found(identifier.digits())),
            Lookup::Unresolved => {
                return Ok(ItemOutcome::unexpected(format!(
                    "identifier {} was not resolved in this pass",
                    identifier.digits()
                )));
            }
        };
        let party = PartyRef {
            id: record.id,
            name: record.name.clone(),
        };
        let scope_id = self.scope.target_scope;

        let debt = self
            .flow
            .call("receivable_debt", || self.api.receivable_debt(party.id, scope_id))
            .await
            .map_err(|e| Halt::from_guarded(e, Some(&party), None))?;

        if (payment.amount - debt).abs() > self.tolerance + TOLERANCE_EPSILON {
            return Ok(ItemOutcome::mismatch(party, payment.amount, debt));
        }

        let key = IdempotencyKey::derive(
            scope_id,
            party.id,
            payment.amount,
            payment.payment_date,
            &payment.memo,
        );
        let existing = self
            .flow
            .call("find_receipt", || self.api.find_receipt(&key, scope_id))
            .await
            .map_err(|e| Halt::from_guarded(e, Some(&party), Some(debt)))?;

        let (receipt_id, adopted, state, finalize_error) = match existing {
            Some(ReceiptRef { id, state }) if SETTLED_STATES.contains(&state.as_str()) => {
                (id, true, state, None)
            }
            Some(ReceiptRef { id, .. }) => {
                debug!(item_id = %item.id, receipt_id = id, "adopting unsettled receipt");
                let (state, finalize_error) = self.finalize(id, &party, debt).await?;
                (id, true, state, finalize_error)
            }
            None => {
                let draft = ReceiptDraft {
                    scope_id,
                    journal_id: self.scope.journal_id,
                    party_id: party.id,
                    amount: (payment.amount * 100.0).round() / 100.0,
                    date: payment.payment_date,
                    memo: payment.memo.clone(),
                    payment_method_line_id: self.payment_method_line_id,
                    idempotency_key: key.clone(),
                };
                let id = self
                    .flow
                    .call("create_receipt", || self.api.create_receipt(&draft))
                    .await
                    .map_err(|e| Halt::from_guarded(e, Some(&party), Some(debt)))?;
                let (state, finalize_error) = self.finalize(id, &party, debt).await?;
                (id, false, state, finalize_error)
            }
        };

        Ok(ItemOutcome::from_receipt_state(
            party,
            debt,
            receipt_id,
            &state,
            adopted,
            finalize_error.as_deref(),
        ))
    }

    /// Try to finalize, then read the authoritative state back. A rejected
    /// finalize is recorded, not raised.
    async fn finalize(
        &self,
        receipt_id: i64,
        party: &PartyRef,
        debt: f64,
    ) -> Result<(String, Option<String>), Halt> {
        let scope_id = self.scope.target_scope;
        let finalize_error = match self
            .flow
            .call("finalize_receipt", || self.api.finalize_receipt(receipt_id, scope_id))
            .await
        {
            Ok(()) => None,
            Err(GuardedError::CircuitOpen { retry_in }) => return Err(Halt::CircuitOpen(retry_in)),
            Err(GuardedError::Remote(e)) => {
                debug!(receipt_id, error = %e, "finalize rejected");
                Some(e.to_string())
            }
        };

        let state = self
            .flow
            .call("receipt_state", || self.api.receipt_state(receipt_id, scope_id))
            .await
            .map_err(|e| match Halt::from_guarded(e, Some(party), Some(debt)) {
                Halt::Outcome(outcome) => Halt::Outcome(ItemOutcome {
                    receipt_id: Some(receipt_id),
                    ..outcome
                }),
                halt => halt,
            })?;

        Ok((state, finalize_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryLedger, LedgerCall};
    use chrono::NaiveDate;
    use remitsync_core::BatchId;
    use remitsync_reconciliation::{Disposition, OutcomeCode, PaymentRow, SkipReason};
    use remitsync_remote::{
        CircuitBreakerConfig, IdentityResolver, RateLimiter, RemoteError, RetryConfig,
    };

    const SCOPE: i64 = 1;

    fn flow() -> FlowControl {
        FlowControl::new(
            RateLimiter::new(1_000, Duration::from_secs(1)),
            CircuitBreakerConfig::default(),
            RetryConfig::default(),
        )
    }

    fn scope() -> ScopeContext {
        ScopeContext {
            journal_id: 7,
            target_scope: SCOPE,
            visible_scopes: vec![SCOPE],
        }
    }

    fn item(identifier: &str, amount: f64) -> WorkItem {
        WorkItem::new(
            BatchId::new(),
            1,
            PaymentRow {
                payment_date: NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
                raw_identifier: identifier.to_string(),
                memo: "transfer".to_string(),
                amount,
                source: serde_json::Value::Null,
            },
        )
    }

    async fn process(ledger: &InMemoryLedger, flow: &FlowControl, it: &WorkItem) -> Processed {
        let scope = scope();
        let ids: Vec<_> = it.payment.identifier().into_iter().collect();
        let resolution = IdentityResolver::new(ledger, flow)
            .resolve(&ids, &scope)
            .await
            .unwrap();
        ItemProcessor::new(ledger, flow, &scope, &resolution, 0.01)
            .process(it)
            .await
    }

    fn outcome(p: Processed) -> ItemOutcome {
        match p {
            Processed::Finished { outcome, .. } => outcome,
            other => panic!("expected an outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn matching_debt_creates_and_posts_a_receipt() {
        let ledger = InMemoryLedger::new();
        let party = ledger.add_party("ACME", Some(SCOPE), &["30-12345678-9"]);
        ledger.set_debt(party, SCOPE, 1000.0);
        let flow = flow();

        let out = outcome(process(&ledger, &flow, &item("30-12345678-9", 1000.0)).await);
        assert_eq!(out.disposition, Disposition::Done);
        assert_eq!(out.code, OutcomeCode::Approved);
        assert_eq!(ledger.receipts().len(), 1);
    }

    #[tokio::test]
    async fn amount_within_tolerance_matches() {
        let ledger = InMemoryLedger::new();
        let party = ledger.add_party("ACME", Some(SCOPE), &["20111222"]);
        ledger.set_debt(party, SCOPE, 100.00);
        let flow = flow();

        let out = outcome(process(&ledger, &flow, &item("20111222", 100.01)).await);
        assert_eq!(out.disposition, Disposition::Done);

        let out = outcome(process(&ledger, &flow, &item("20111222", 100.02)).await);
        assert_eq!(out.disposition, Disposition::Skipped(SkipReason::Mismatch));
    }

    #[tokio::test]
    async fn second_run_adopts_the_existing_receipt() {
        let ledger = InMemoryLedger::new();
        let party = ledger.add_party("ACME", None, &["20111222"]);
        ledger.set_debt(party, SCOPE, 250.0);
        let flow = flow();
        let it = item("20111222", 250.0);

        let first = outcome(process(&ledger, &flow, &it).await);
        // Debt is still reported: the receipt is not reconciled against it yet.
        let second = outcome(process(&ledger, &flow, &it).await);

        assert_eq!(ledger.receipts().len(), 1);
        assert_eq!(ledger.call_count(LedgerCall::CreateReceipt), 1);
        assert_eq!(first.receipt_id, second.receipt_id);
        assert!(second.message.starts_with("existing receipt adopted"));
    }

    #[tokio::test]
    async fn finalize_failure_is_tolerated_and_state_reread() {
        let ledger = InMemoryLedger::new();
        let party = ledger.add_party("ACME", None, &["20111222"]);
        ledger.set_debt(party, SCOPE, 10.0);
        ledger.fail_next(LedgerCall::FinalizeReceipt, RemoteError::Fault("period locked".into()));
        let flow = flow();

        let out = outcome(process(&ledger, &flow, &item("20111222", 10.0)).await);
        assert_eq!(out.disposition, Disposition::Failed);
        assert_eq!(out.code, OutcomeCode::Draft);
        assert!(out.message.contains("period locked"));
        assert!(out.receipt_id.is_some());
        assert_eq!(ledger.call_count(LedgerCall::ReceiptState), 1);
    }

    #[tokio::test]
    async fn unsettled_adopted_receipt_gets_another_finalize() {
        let ledger = InMemoryLedger::new();
        let party = ledger.add_party("ACME", None, &["20111222"]);
        ledger.set_debt(party, SCOPE, 10.0);
        ledger.fail_next(LedgerCall::FinalizeReceipt, RemoteError::Fault("busy".into()));
        let flow = flow();
        let it = item("20111222", 10.0);

        let first = outcome(process(&ledger, &flow, &it).await);
        assert_eq!(first.code, OutcomeCode::Draft);

        let second = outcome(process(&ledger, &flow, &it).await);
        assert_eq!(second.code, OutcomeCode::Approved);
        assert_eq!(ledger.call_count(LedgerCall::CreateReceipt), 1);
        assert_eq!(ledger.call_count(LedgerCall::FinalizeReceipt), 2);
    }

    #[tokio::test]
    async fn debt_lookup_error_is_an_unexpected_failure_with_party_context() {
        let ledger = InMemoryLedger::new();
        ledger.add_party("ACME", None, &["20111222"]);
        ledger.fail_next(LedgerCall::ReceivableDebt, RemoteError::Fault("no access".into()));
        let flow = flow();

        let out = outcome(process(&ledger, &flow, &item("20111222", 10.0)).await);
        assert_eq!(out.disposition, Disposition::Failed);
        assert_eq!(out.code, OutcomeCode::Error);
        assert!(out.party.is_some());
    }

    #[tokio::test]
    async fn open_circuit_is_not_an_outcome() {
        let ledger = InMemoryLedger::new();
        ledger.add_party("ACME", None, &["20111222"]);
        let flow = flow();
        let scope = scope();
        let it = item("20111222", 10.0);
        let resolution = IdentityResolver::new(&ledger, &flow)
            .resolve(&[it.payment.identifier().unwrap()], &scope)
            .await
            .unwrap();

        for _ in 0..flow.breaker().config().failure_threshold {
            flow.breaker().on_failure();
        }
        let processed = ItemProcessor::new(&ledger, &flow, &scope, &resolution, 0.01)
            .process(&it)
            .await;
        assert!(matches!(processed, Processed::CircuitOpen { .. }));
        assert_eq!(ledger.call_count(LedgerCall::ReceivableDebt), 0);
    }

    #[tokio::test]
    async fn identifier_outside_the_resolution_is_retried() {
        let ledger = InMemoryLedger::new();
        let flow = flow();
        let scope = scope();
        let resolution = Resolution::default();

        let out = outcome(
            ItemProcessor::new(&ledger, &flow, &scope, &resolution, 0.01)
                .process(&item("20111222", 10.0))
                .await,
        );
        assert_eq!(out.disposition, Disposition::Failed);
    }
}
