//! Scripted in-memory `LedgerApi`.
//!
//! Holds parties, debts and receipts in memory, records every call, and can be
//! told to fail upcoming calls. Used by the pipeline tests and for local runs
//! without a remote ledger.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use remitsync_reconciliation::IdempotencyKey;
use remitsync_remote::{
    LedgerApi, MatchMode, PartyRecord, ReceiptDraft, ReceiptRef, RemoteError,
};

/// The ledger operations, for call counting and failure injection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LedgerCall {
    Authenticate,
    JournalScope,
    ListScopes,
    SearchParties,
    BackingIdentities,
    ReceivableDebt,
    FindReceipt,
    CreateReceipt,
    FinalizeReceipt,
    ReceiptState,
}

/// A receipt held by the in-memory ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReceipt {
    pub id: i64,
    pub state: String,
    pub draft: ReceiptDraft,
}

#[derive(Debug)]
struct State {
    next_id: i64,
    journals: HashMap<i64, i64>,
    scopes: Vec<i64>,
    parties: Vec<PartyRecord>,
    debts: HashMap<(i64, i64), f64>,
    receipts: Vec<StoredReceipt>,
    calls: Vec<LedgerCall>,
    failures: HashMap<LedgerCall, VecDeque<RemoteError>>,
    /// Failure returned by every call until cleared.
    outage: Option<RemoteError>,
}

#[derive(Debug)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// A ledger with journal 7 owned by scope 1, the only visible scope.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 100,
                journals: HashMap::from([(7, 1)]),
                scopes: vec![1],
                parties: Vec::new(),
                debts: HashMap::new(),
                receipts: Vec::new(),
                calls: Vec::new(),
                failures: HashMap::new(),
                outage: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_journal(&self, journal_id: i64, scope_id: i64) {
        let mut state = self.lock();
        state.journals.insert(journal_id, scope_id);
        if !state.scopes.contains(&scope_id) {
            state.scopes.push(scope_id);
        }
    }

    /// Register a party; returns its id.
    pub fn add_party(&self, name: &str, scope_id: Option<i64>, identity_values: &[&str]) -> i64 {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.parties.push(PartyRecord {
            id,
            name: name.to_string(),
            scope_id,
            identity_values: identity_values.iter().map(|v| v.to_string()).collect(),
            backing_id: None,
        });
        id
    }

    /// Make `backing_id` the commercial entity behind `party_id`. Searches
    /// then also match the party on the backing entity's identity values.
    pub fn set_backing(&self, party_id: i64, backing_id: i64) {
        let mut state = self.lock();
        if let Some(party) = state.parties.iter_mut().find(|p| p.id == party_id) {
            party.backing_id = Some(backing_id);
        }
    }

    pub fn set_debt(&self, party_id: i64, scope_id: i64, amount: f64) {
        self.lock().debts.insert((party_id, scope_id), amount);
    }

    /// Fail the next call of `call` with `error`. Queued failures are consumed
    /// in order.
    pub fn fail_next(&self, call: LedgerCall, error: RemoteError) {
        self.lock().failures.entry(call).or_default().push_back(error);
    }

    /// Fail every call with `error` until `restore` is called.
    pub fn outage(&self, error: RemoteError) {
        self.lock().outage = Some(error);
    }

    pub fn restore(&self) {
        self.lock().outage = None;
    }

    pub fn receipts(&self) -> Vec<StoredReceipt> {
        self.lock().receipts.clone()
    }

    pub fn calls(&self) -> Vec<LedgerCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, call: LedgerCall) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }

    /// Record the call, then surface an injected failure if one is due.
    fn enter(&self, call: LedgerCall) -> Result<MutexGuard<'_, State>, RemoteError> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(err) = state.outage.clone() {
            return Err(err);
        }
        if let Some(err) = state.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }
}

#[async_trait]
impl LedgerApi for InMemoryLedger {
    async fn authenticate(&self) -> Result<i64, RemoteError> {
        self.enter(LedgerCall::Authenticate)?;
        Ok(2)
    }

    async fn journal_scope(&self, journal_id: i64) -> Result<i64, RemoteError> {
        let state = self.enter(LedgerCall::JournalScope)?;
        state
            .journals
            .get(&journal_id)
            .copied()
            .ok_or_else(|| RemoteError::NotFound(format!("journal {journal_id}")))
    }

    async fn list_scopes(&self) -> Result<Vec<i64>, RemoteError> {
        Ok(self.enter(LedgerCall::ListScopes)?.scopes.clone())
    }

    async fn search_parties(
        &self,
        variants: &[String],
        mode: MatchMode,
        scopes: &[i64],
    ) -> Result<Vec<PartyRecord>, RemoteError> {
        let state = self.enter(LedgerCall::SearchParties)?;
        let matches = |p: &PartyRecord| variants.iter().any(|v| p.matches(v, mode));
        Ok(state
            .parties
            .iter()
            .filter(|p| p.scope_id.is_none_or(|s| scopes.contains(&s)))
            .filter(|p| {
                matches(p)
                    || p.backing_id.is_some_and(|b| {
                        state.parties.iter().any(|backing| backing.id == b && matches(backing))
                    })
            })
            .cloned()
            .collect())
    }

    async fn backing_identities(
        &self,
        entity_ids: &[i64],
        _scopes: &[i64],
    ) -> Result<Vec<(i64, String)>, RemoteError> {
        let state = self.enter(LedgerCall::BackingIdentities)?;
        Ok(state
            .parties
            .iter()
            .filter(|p| entity_ids.contains(&p.id))
            .filter_map(|p| Some((p.id, p.identity_values.first()?.clone())))
            .collect())
    }

    async fn receivable_debt(&self, party_id: i64, scope_id: i64) -> Result<f64, RemoteError> {
        let state = self.enter(LedgerCall::ReceivableDebt)?;
        Ok(state.debts.get(&(party_id, scope_id)).copied().unwrap_or(0.0))
    }

    async fn find_receipt(
        &self,
        key: &IdempotencyKey,
        scope_id: i64,
    ) -> Result<Option<ReceiptRef>, RemoteError> {
        let state = self.enter(LedgerCall::FindReceipt)?;
        Ok(state
            .receipts
            .iter()
            .find(|r| r.draft.scope_id == scope_id && r.draft.idempotency_key == *key)
            .map(|r| ReceiptRef {
                id: r.id,
                state: r.state.clone(),
            }))
    }

    async fn create_receipt(&self, draft: &ReceiptDraft) -> Result<i64, RemoteError> {
        let mut state = self.enter(LedgerCall::CreateReceipt)?;
        state.next_id += 1;
        let id = state.next_id;
        state.receipts.push(StoredReceipt {
            id,
            state: "draft".to_string(),
            draft: draft.clone(),
        });
        Ok(id)
    }

    async fn finalize_receipt(&self, receipt_id: i64, scope_id: i64) -> Result<(), RemoteError> {
        let mut state = self.enter(LedgerCall::FinalizeReceipt)?;
        let receipt = state
            .receipts
            .iter_mut()
            .find(|r| r.id == receipt_id && r.draft.scope_id == scope_id)
            .ok_or_else(|| RemoteError::NotFound(format!("receipt {receipt_id}")))?;
        receipt.state = "posted".to_string();
        Ok(())
    }

    async fn receipt_state(&self, receipt_id: i64, scope_id: i64) -> Result<String, RemoteError> {
        let state = self.enter(LedgerCall::ReceiptState)?;
        state
            .receipts
            .iter()
            .find(|r| r.id == receipt_id && r.draft.scope_id == scope_id)
            .map(|r| r.state.clone())
            .ok_or_else(|| RemoteError::NotFound(format!("receipt {receipt_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let ledger = InMemoryLedger::new();
        ledger.fail_next(LedgerCall::ListScopes, RemoteError::Throttled);

        assert_eq!(ledger.list_scopes().await, Err(RemoteError::Throttled));
        assert_eq!(ledger.list_scopes().await, Ok(vec![1]));
        assert_eq!(ledger.call_count(LedgerCall::ListScopes), 2);
    }

    #[tokio::test]
    async fn search_honours_scopes() {
        let ledger = InMemoryLedger::new();
        ledger.add_party("shared", None, &["20111222"]);
        ledger.add_party("other scope", Some(9), &["20111222"]);

        let found = ledger
            .search_parties(&["20111222".to_string()], MatchMode::Exact, &[1])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "shared");
    }
}
