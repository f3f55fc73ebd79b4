//! Result of processing a single work item.

use serde::{Deserialize, Serialize};

/// Longest diagnostic message kept on an item.
pub const MAX_MESSAGE_LEN: usize = 500;

/// A resolved remote party, as attached to an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyRef {
    pub id: i64,
    pub name: String,
}

/// Why an item was skipped. Skips are business decisions and never retried.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoIdentifier,
    PartyNotFound,
    Mismatch,
}

/// Machine-readable audit code kept on the item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeCode {
    /// Receipt posted.
    Approved,
    /// Receipt accepted and in process on the remote side.
    InProcess,
    /// Receipt exists but could not be finalized.
    Draft,
    PartyNotFound,
    NoIdentifier,
    Mismatch,
    Error,
}

impl OutcomeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeCode::Approved => "approved",
            OutcomeCode::InProcess => "in_process",
            OutcomeCode::Draft => "draft",
            OutcomeCode::PartyNotFound => "party_not_found",
            OutcomeCode::NoIdentifier => "no_identifier",
            OutcomeCode::Mismatch => "mismatch",
            OutcomeCode::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "approved" => OutcomeCode::Approved,
            "in_process" => OutcomeCode::InProcess,
            "draft" => OutcomeCode::Draft,
            "party_not_found" => OutcomeCode::PartyNotFound,
            "no_identifier" => OutcomeCode::NoIdentifier,
            "mismatch" => OutcomeCode::Mismatch,
            "error" => OutcomeCode::Error,
            _ => return None,
        })
    }
}

/// Coarse classification the work queue acts on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    Done,
    Skipped(SkipReason),
    Failed,
}

/// Everything the item processor concluded about one item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub disposition: Disposition,
    pub code: OutcomeCode,
    pub message: String,
    pub party: Option<PartyRef>,
    pub detected_debt: Option<f64>,
    pub receipt_id: Option<i64>,
}

impl ItemOutcome {
    fn skipped(reason: SkipReason, code: OutcomeCode, message: String) -> Self {
        Self {
            disposition: Disposition::Skipped(reason),
            code,
            message,
            party: None,
            detected_debt: None,
            receipt_id: None,
        }
    }

    pub fn no_identifier() -> Self {
        Self::skipped(
            SkipReason::NoIdentifier,
            OutcomeCode::NoIdentifier,
            "no valid identifier".to_string(),
        )
    }

    pub fn party_not_found(digits: &str) -> Self {
        Self::skipped(
            SkipReason::PartyNotFound,
            OutcomeCode::PartyNotFound,
            format!("party not found for identifier {digits}"),
        )
    }

    pub fn mismatch(party: PartyRef, amount: f64, debt: f64) -> Self {
        Self {
            party: Some(party),
            detected_debt: Some(debt),
            ..Self::skipped(
                SkipReason::Mismatch,
                OutcomeCode::Mismatch,
                format!("mismatch: amount {amount:.2} vs debt {debt:.2}"),
            )
        }
    }

    /// Classify a receipt from its authoritative remote state.
    ///
    /// `posted` and `in_process` are done; anything else is a failure carrying
    /// the read-back state and the finalize error, if any.
    pub fn from_receipt_state(
        party: PartyRef,
        debt: f64,
        receipt_id: i64,
        remote_state: &str,
        adopted: bool,
        finalize_error: Option<&str>,
    ) -> Self {
        let origin = if adopted { "existing receipt adopted" } else { "receipt created" };
        let (disposition, code, message) = match remote_state {
            "posted" => (
                Disposition::Done,
                OutcomeCode::Approved,
                format!("{origin} (state: posted)"),
            ),
            "in_process" => (
                Disposition::Done,
                OutcomeCode::InProcess,
                format!("{origin} (state: in_process)"),
            ),
            other => {
                let mut message = format!("{origin} but not posted (state: {other})");
                if let Some(err) = finalize_error {
                    message.push_str("; finalize error: ");
                    message.push_str(err);
                }
                (Disposition::Failed, OutcomeCode::Draft, message)
            }
        };

        Self {
            disposition,
            code,
            message: truncate(&message),
            party: Some(party),
            detected_debt: Some(debt),
            receipt_id: Some(receipt_id),
        }
    }

    /// Any unexpected error while processing the item.
    pub fn unexpected(error: impl core::fmt::Display) -> Self {
        Self {
            disposition: Disposition::Failed,
            code: OutcomeCode::Error,
            message: truncate(&format!("unexpected error: {error}")),
            party: None,
            detected_debt: None,
            receipt_id: None,
        }
    }

    /// Keep whatever was learned before the error happened.
    pub fn with_context(mut self, party: Option<PartyRef>, debt: Option<f64>) -> Self {
        self.party = self.party.or(party);
        self.detected_debt = self.detected_debt.or(debt);
        self
    }
}

/// Truncate on a char boundary to `MAX_MESSAGE_LEN` chars.
pub fn truncate(message: &str) -> String {
    match message.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
