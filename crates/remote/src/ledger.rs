//! The remote ledger boundary.
//!
//! `LedgerApi` lists exactly the operations the pipeline needs. Implementations
//! report raw `RemoteError`s; rate limiting, breaking and throttle retries are
//! applied by `FlowControl` at the call site, never inside an implementation.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use remitsync_reconciliation::IdempotencyKey;

use crate::error::RemoteError;

/// How identity values are compared to a search variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    /// Case-insensitive substring.
    Partial,
}

/// A party record as read back from the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRecord {
    pub id: i64,
    pub name: String,
    /// Owning scope; `None` for parties shared by every scope.
    pub scope_id: Option<i64>,
    /// Values of the identity fields the search ran against (own tax id,
    /// internal reference, backing entity's tax id). Blank values omitted.
    pub identity_values: Vec<String>,
    /// Backing commercial entity, when it is another record. Its tax id is
    /// not part of the search result; see `LedgerApi::backing_identities`.
    #[serde(default)]
    pub backing_id: Option<i64>,
}

impl PartyRecord {
    pub fn matches(&self, variant: &str, mode: MatchMode) -> bool {
        if variant.is_empty() {
            return false;
        }
        match mode {
            MatchMode::Exact => self.identity_values.iter().any(|v| v == variant),
            MatchMode::Partial => {
                let needle = variant.to_lowercase();
                self.identity_values
                    .iter()
                    .any(|v| v.to_lowercase().contains(&needle))
            }
        }
    }
}

/// Remote scope context of one processing pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeContext {
    pub journal_id: i64,
    /// Scope owning the target journal; receipts and debt live here.
    pub target_scope: i64,
    /// Every scope visible to the session, for cross-scope identity search.
    pub visible_scopes: Vec<i64>,
}

/// A receipt to create on the remote side (inbound, customer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptDraft {
    pub scope_id: i64,
    pub journal_id: i64,
    pub party_id: i64,
    /// Rounded to cents.
    pub amount: f64,
    pub date: NaiveDate,
    pub memo: String,
    pub payment_method_line_id: Option<i64>,
    pub idempotency_key: IdempotencyKey,
}

/// An existing remote receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRef {
    pub id: i64,
    pub state: String,
}

#[async_trait]
pub trait LedgerApi: Send + Sync {
    /// Open a session. Failure is fatal for the whole pass.
    async fn authenticate(&self) -> Result<i64, RemoteError>;

    /// Scope owning the given journal; `NotFound` when the journal is unreadable.
    async fn journal_scope(&self, journal_id: i64) -> Result<i64, RemoteError>;

    async fn list_scopes(&self) -> Result<Vec<i64>, RemoteError>;

    /// One lookup across every variant, in remote result order.
    async fn search_parties(
        &self,
        variants: &[String],
        mode: MatchMode,
        scopes: &[i64],
    ) -> Result<Vec<PartyRecord>, RemoteError>;

    /// Tax ids of the given backing entities as `(id, value)` pairs. Entities
    /// without a tax id are left out.
    async fn backing_identities(
        &self,
        entity_ids: &[i64],
        scopes: &[i64],
    ) -> Result<Vec<(i64, String)>, RemoteError>;

    /// Sum of residual amounts of posted, unreconciled receivable entries.
    async fn receivable_debt(&self, party_id: i64, scope_id: i64) -> Result<f64, RemoteError>;

    async fn find_receipt(
        &self,
        key: &IdempotencyKey,
        scope_id: i64,
    ) -> Result<Option<ReceiptRef>, RemoteError>;

    async fn create_receipt(&self, draft: &ReceiptDraft) -> Result<i64, RemoteError>;

    async fn finalize_receipt(&self, receipt_id: i64, scope_id: i64) -> Result<(), RemoteError>;

    /// Authoritative state of a receipt (`draft`, `posted`, `in_process`, ...).
    async fn receipt_state(&self, receipt_id: i64, scope_id: i64) -> Result<String, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn party() -> PartyRecord {
        PartyRecord {
            id: 1,
            name: "ACME".to_string(),
            scope_id: None,
            identity_values: vec!["30-12345678-9".to_string(), "C-001".to_string()],
            backing_id: None,
        }
    }

    #[test]
    fn exact_match_compares_whole_values() {
        assert!(party().matches("30-12345678-9", MatchMode::Exact));
        assert!(!party().matches("12345678", MatchMode::Exact));
        assert!(!party().matches("", MatchMode::Exact));
    }

    #[test]
    fn partial_match_is_a_case_insensitive_substring() {
        assert!(party().matches("12345678", MatchMode::Partial));
        assert!(party().matches("c-00", MatchMode::Partial));
        assert!(!party().matches("99", MatchMode::Partial));
    }
}
