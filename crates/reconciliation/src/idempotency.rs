//! Idempotency keys for remote receipt creation.
//!
//! The key is stamped on every receipt the pipeline creates. Before creating a
//! receipt the processor looks it up, so a retried item adopts the receipt an
//! earlier attempt already created instead of creating a second one.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Memo characters kept in the key.
const MEMO_MAX_CHARS: usize = 40;
const KEY_PREFIX: &str = "rsync1";

/// Deterministic fingerprint of one logical payment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive the key from (target scope, party, amount in cents, ISO date, memo).
    pub fn derive(scope_id: i64, party_id: i64, amount: f64, date: NaiveDate, memo: &str) -> Self {
        Self(format!(
            "{KEY_PREFIX}:{scope_id}:{party_id}:{}:{}:{}",
            format_cents(amount),
            date.format("%Y-%m-%d"),
            normalize_memo(memo),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

fn format_cents(amount: f64) -> String {
    let cents = (amount * 100.0).round() as i64;
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Collapse whitespace runs, trim, and keep the first `MEMO_MAX_CHARS` chars.
fn normalize_memo(memo: &str) -> String {
    memo.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MEMO_MAX_CHARS)
        .collect()
}
