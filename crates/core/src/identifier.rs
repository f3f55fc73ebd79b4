//! Tax/ID number value object.
//!
//! Source files carry the payer's identifier in whatever shape the spreadsheet
//! produced: grouped with dashes or dots, as a plain number, or even in
//! scientific notation. `TaxIdentifier` keeps the raw text for display and a
//! digits-only canonical form for matching.

use serde::{Deserialize, Serialize};

/// Length of a full tax identifier (`XX-XXXXXXXX-X`).
const FULL_ID_LEN: usize = 11;
/// Length of a short personal identifier (`XX.XXX.XXX`).
const SHORT_ID_LEN: usize = 8;

/// A payer identifier with its canonical digits-only form.
///
/// Equality is by value: two identifiers typed differently but normalizing to
/// the same digits are still different values (the raw text differs), so match
/// on [`TaxIdentifier::digits`] when grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaxIdentifier {
    raw: String,
    digits: String,
}

impl TaxIdentifier {
    /// Parse a raw identifier. Returns `None` when nothing usable remains after
    /// normalization.
    pub fn parse(raw: &str) -> Option<Self> {
        let digits = normalize_digits(raw);
        if digits.is_empty() {
            return None;
        }
        Some(Self {
            raw: raw.trim().to_string(),
            digits,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn digits(&self) -> &str {
        &self.digits
    }

    /// Search variants, in a stable order: digits, locale grouping, raw text.
    pub fn variants(&self) -> Vec<String> {
        let d = &self.digits;
        let mut out = vec![d.clone()];

        if d.len() == FULL_ID_LEN {
            out.push(format!("{}-{}-{}", &d[..2], &d[2..10], &d[10..]));
        }
        if d.len() == SHORT_ID_LEN {
            out.push(format!("{}.{}.{}", &d[..2], &d[2..5], &d[5..]));
        }
        if !self.raw.is_empty() && !out.contains(&self.raw) {
            out.push(self.raw.clone());
        }
        out
    }
}

impl core::fmt::Display for TaxIdentifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.digits)
    }
}

/// Reduce a raw identifier to ASCII digits.
///
/// Handles spreadsheet artifacts: scientific notation (`2.0111222E+7`) and
/// integral numbers rendered with a zero fraction (`20111222.0`).
pub fn normalize_digits(raw: &str) -> String {
    let s = raw.trim();
    if s.is_empty() {
        return String::new();
    }

    if s.contains(['e', 'E']) {
        if let Ok(num) = s.replace(',', ".").parse::<f64>() {
            if num.is_finite() {
                return format!("{:.0}", num.abs().round());
            }
        }
    }

    if let Some((int, frac)) = s.split_once('.') {
        let int_is_digits = !int.is_empty() && int.bytes().all(|b| b.is_ascii_digit());
        let frac_is_zero = !frac.is_empty() && frac.bytes().all(|b| b == b'0');
        // Dots in shorter numbers are grouping: `20.000` is twenty thousand.
        let is_float = frac == "0" || int.len() >= SHORT_ID_LEN;
        if int_is_digits && frac_is_zero && is_float {
            return int.to_string();
        }
    }

    s.chars().filter(|c| c.is_ascii_digit()).collect()
}
