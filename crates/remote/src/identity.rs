//! Batched identifier -> party resolution.
//!
//! All identifiers of a pass are resolved together: one exact lookup across
//! every search variant, then one partial lookup for the identifiers the exact
//! lookup left unmatched. The result is a per-pass cache the item processor
//! reads from.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use remitsync_core::TaxIdentifier;

use crate::error::GuardedError;
use crate::flow::FlowControl;
use crate::ledger::{LedgerApi, MatchMode, PartyRecord, ScopeContext};

/// What the cache knows about one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Found(&'a PartyRecord),
    NotFound,
    /// Not part of the resolved set (resolution was skipped or failed).
    Unresolved,
}

/// Resolution results keyed by the identifier's digits.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    parties: HashMap<String, Option<PartyRecord>>,
}

impl Resolution {
    pub fn get(&self, identifier: &TaxIdentifier) -> Lookup<'_> {
        match self.parties.get(identifier.digits()) {
            Some(Some(party)) => Lookup::Found(party),
            Some(None) => Lookup::NotFound,
            None => Lookup::Unresolved,
        }
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    pub fn found(&self) -> usize {
        self.parties.values().filter(|p| p.is_some()).count()
    }
}

pub struct IdentityResolver<'a> {
    api: &'a dyn LedgerApi,
    flow: &'a FlowControl,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(api: &'a dyn LedgerApi, flow: &'a FlowControl) -> Self {
        Self { api, flow }
    }

    /// Resolve every distinct identifier in `identifiers`.
    pub async fn resolve(
        &self,
        identifiers: &[TaxIdentifier],
        scope: &ScopeContext,
    ) -> Result<Resolution, GuardedError> {
        let mut seen = HashSet::new();
        let distinct: Vec<&TaxIdentifier> = identifiers
            .iter()
            .filter(|id| seen.insert(id.digits().to_string()))
            .collect();

        let mut resolution = Resolution::default();
        if distinct.is_empty() {
            return Ok(resolution);
        }

        let exact = self.search(&distinct, MatchMode::Exact, scope).await?;
        let mut unmatched = Vec::new();
        for id in &distinct {
            match pick(id, &exact, MatchMode::Exact, scope.target_scope) {
                Some(party) => {
                    resolution.parties.insert(id.digits().to_string(), Some(party));
                }
                None => unmatched.push(*id),
            }
        }

        if !unmatched.is_empty() {
            let partial = self.search(&unmatched, MatchMode::Partial, scope).await?;
            for id in unmatched {
                let party = pick(id, &partial, MatchMode::Partial, scope.target_scope);
                resolution.parties.insert(id.digits().to_string(), party);
            }
        }

        debug!(
            identifiers = resolution.len(),
            found = resolution.found(),
            "identifiers resolved"
        );
        Ok(resolution)
    }

    async fn search(
        &self,
        ids: &[&TaxIdentifier],
        mode: MatchMode,
        scope: &ScopeContext,
    ) -> Result<Vec<PartyRecord>, GuardedError> {
        let mut seen = HashSet::new();
        let variants: Vec<String> = ids
            .iter()
            .flat_map(|id| id.variants())
            .filter(|v| seen.insert(v.clone()))
            .collect();

        let mut records = self
            .flow
            .call("search_parties", || {
                self.api
                    .search_parties(&variants, mode, &scope.visible_scopes)
            })
            .await?;

        // Backing entities' tax ids come from a separate remote read, which
        // takes its own limiter slot.
        let mut backing: Vec<i64> = records.iter().filter_map(|r| r.backing_id).collect();
        backing.sort_unstable();
        backing.dedup();
        if backing.is_empty() {
            return Ok(records);
        }
        let values = self
            .flow
            .call("backing_identities", || {
                self.api
                    .backing_identities(&backing, &scope.visible_scopes)
            })
            .await?;
        for record in &mut records {
            let Some(backing_id) = record.backing_id else {
                continue;
            };
            for (_, value) in values.iter().filter(|(id, _)| *id == backing_id) {
                if !record.identity_values.contains(value) {
                    record.identity_values.push(value.clone());
                }
            }
        }
        Ok(records)
    }
}

/// Disambiguate the records matching `id`: one owned by the target scope,
/// else the first owned by no scope, else the first in result order.
fn pick(
    id: &TaxIdentifier,
    records: &[PartyRecord],
    mode: MatchMode,
    target_scope: i64,
) -> Option<PartyRecord> {
    let variants = id.variants();
    let matching: Vec<&PartyRecord> = records
        .iter()
        .filter(|r| variants.iter().any(|v| r.matches(v, mode)))
        .collect();

    matching
        .iter()
        .find(|r| r.scope_id == Some(target_scope))
        .or_else(|| matching.iter().find(|r| r.scope_id.is_none()))
        .or_else(|| matching.first())
        .map(|r| (*r).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, scope_id: Option<i64>, values: &[&str]) -> PartyRecord {
        PartyRecord {
            id,
            name: format!("party {id}"),
            scope_id,
            identity_values: values.iter().map(|v| v.to_string()).collect(),
            backing_id: None,
        }
    }

    fn cuit() -> TaxIdentifier {
        TaxIdentifier::parse("30-12345678-9").unwrap()
    }

    #[test]
    fn prefers_the_target_scope() {
        let records = vec![
            record(1, Some(9), &["30123456789"]),
            record(2, None, &["30-12345678-9"]),
            record(3, Some(4), &["30123456789"]),
        ];
        let chosen = pick(&cuit(), &records, MatchMode::Exact, 4).unwrap();
        assert_eq!(chosen.id, 3);
    }

    #[test]
    fn falls_back_to_shared_then_first() {
        let records = vec![
            record(1, Some(9), &["30123456789"]),
            record(2, None, &["30-12345678-9"]),
        ];
        assert_eq!(pick(&cuit(), &records, MatchMode::Exact, 4).unwrap().id, 2);

        let records = vec![
            record(1, Some(9), &["30123456789"]),
            record(5, Some(8), &["30123456789"]),
        ];
        assert_eq!(pick(&cuit(), &records, MatchMode::Exact, 4).unwrap().id, 1);
    }

    #[test]
    fn records_for_other_identifiers_are_ignored() {
        let records = vec![record(1, Some(4), &["20111222"])];
        assert!(pick(&cuit(), &records, MatchMode::Exact, 4).is_none());
    }

    #[test]
    fn unresolved_is_distinct_from_not_found() {
        let mut res = Resolution::default();
        res.parties.insert("20111222".to_string(), None);
        let known = TaxIdentifier::parse("20111222").unwrap();
        assert_eq!(res.get(&known), Lookup::NotFound);
        assert_eq!(res.get(&cuit()), Lookup::Unresolved);
    }
}
