//! Double-entry journal types.
//!
//! Amounts are integer minor units. Every entry must balance per currency
//! before it reaches a tenant ledger; the applier enforces at-most-once
//! application by entry id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::{ensure_id, ensure_positive_safe_int};

/// One side of a journal entry. Exactly one of `debit`/`credit` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerLine {
    /// Account the amount posts to.
    pub account: String,
    /// ISO-4217-style currency code.
    pub currency: String,
    /// Debit amount in minor units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debit: Option<u64>,
    /// Credit amount in minor units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit: Option<u64>,
}

impl LedgerLine {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_id("account", &self.account)?;
        ensure_id("currency", &self.currency)?;
        match (self.debit, self.credit) {
            (Some(amount), None) => ensure_positive_safe_int("debit", amount),
            (None, Some(amount)) => ensure_positive_safe_int("credit", amount),
            _ => Err(CoreError::validation(
                "line must carry exactly one of debit or credit",
            )),
        }
    }
}

/// A balanced journal entry, applied at most once per tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Entry identifier, unique within the tenant ledger.
    pub entry_id: String,
    /// ISO-8601 posting time.
    pub at: String,
    /// Optional narration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    /// Journal lines; debits and credits must balance per currency.
    pub lines: Vec<LedgerLine>,
}

impl LedgerEntry {
    /// Validate line shapes and the per-currency balance invariant.
    pub fn validate(&self) -> Result<(), CoreError> {
        ensure_id("entryId", &self.entry_id)?;
        if self.at.trim().is_empty() {
            return Err(CoreError::validation("at must be non-empty"));
        }
        if self.lines.is_empty() {
            return Err(CoreError::validation("lines must be non-empty"));
        }
        for line in &self.lines {
            line.validate()?;
        }
        self.check_balanced()
    }

    /// Σ(debits) == Σ(credits) for every currency in the entry.
    pub fn check_balanced(&self) -> Result<(), CoreError> {
        let mut net: BTreeMap<&str, i128> = BTreeMap::new();
        for line in &self.lines {
            let delta = line.debit.map(|d| d as i128).unwrap_or_default()
                - line.credit.map(|c| c as i128).unwrap_or_default();
            *net.entry(line.currency.as_str()).or_default() += delta;
        }
        for (currency, residue) in net {
            if residue != 0 {
                return Err(CoreError::LedgerUnbalanced {
                    entry_id: self.entry_id.clone(),
                    currency: currency.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(account: &str, currency: &str, debit: Option<u64>, credit: Option<u64>) -> LedgerLine {
        LedgerLine {
            account: account.into(),
            currency: currency.into(),
            debit,
            credit,
        }
    }

    #[test]
    fn balanced_entry_validates() {
        let entry = LedgerEntry {
            entry_id: "e1".into(),
            at: "2026-08-01T00:00:00.000Z".into(),
            memo: None,
            lines: vec![
                line("operator:o1:payable", "USD", Some(500), None),
                line("platform:escrow", "USD", None, Some(500)),
            ],
        };
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn unbalanced_currency_is_rejected() {
        let entry = LedgerEntry {
            entry_id: "e2".into(),
            at: "2026-08-01T00:00:00.000Z".into(),
            memo: None,
            lines: vec![
                line("a", "USD", Some(500), None),
                line("b", "USD", None, Some(400)),
                line("c", "EUR", Some(100), None),
                line("d", "EUR", None, Some(100)),
            ],
        };
        let err = entry.validate().unwrap_err();
        assert_eq!(err.code(), "LEDGER_UNBALANCED");
        assert_eq!(err.details()["currency"], "USD");
    }

    #[test]
    fn line_requires_exactly_one_side() {
        let both = line("a", "USD", Some(1), Some(1));
        assert!(both.validate().is_err());
        let neither = line("a", "USD", None, None);
        assert!(neither.validate().is_err());
    }
}
