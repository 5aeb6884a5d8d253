//! Double-entry ledger application.

use proxy_canonical::canonically_equal;
use proxy_types::{CoreError, LedgerEntryOp};

use crate::state::WorldState;
use crate::KernelError;

/// Apply a journal entry to the tenant ledger.
///
/// Entries are applied at most once: a replay with the identical canonical
/// form is a no-op, a reused id with different content is a conflict. The
/// per-currency balance invariant has already been checked by validation;
/// it is re-checked here so the ledger can never be unbalanced by a caller
/// that skipped validation.
pub fn apply_entry(state: &mut WorldState, op: &LedgerEntryOp) -> Result<(), KernelError> {
    let ledger = state.ledgers.entry(op.tenant_id.clone()).or_default();

    if let Some(existing) = ledger.entries.get(&op.entry.entry_id) {
        let existing = serde_json::to_value(existing).map_err(proxy_canonical::CanonicalError::from)?;
        let incoming = serde_json::to_value(&op.entry).map_err(proxy_canonical::CanonicalError::from)?;
        if canonically_equal(&existing, &incoming)? {
            return Ok(());
        }
        return Err(CoreError::LedgerEntryConflict {
            entry_id: op.entry.entry_id.clone(),
        }
        .into());
    }

    op.entry.check_balanced()?;

    for line in &op.entry.lines {
        let cell = ledger
            .balances
            .entry(line.account.clone())
            .or_default()
            .entry(line.currency.clone())
            .or_default();
        cell.debits += line.debit.unwrap_or(0);
        cell.credits += line.credit.unwrap_or(0);
    }
    ledger
        .entries
        .insert(op.entry.entry_id.clone(), op.entry.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_types::{LedgerEntry, LedgerLine};

    fn entry(id: &str, amount: u64) -> LedgerEntryOp {
        LedgerEntryOp {
            tenant_id: "default".into(),
            entry: LedgerEntry {
                entry_id: id.into(),
                at: "2026-08-01T00:00:00.000Z".into(),
                memo: None,
                lines: vec![
                    LedgerLine {
                        account: "operator:o1".into(),
                        currency: "USD".into(),
                        debit: Some(amount),
                        credit: None,
                    },
                    LedgerLine {
                        account: "platform:escrow".into(),
                        currency: "USD".into(),
                        debit: None,
                        credit: Some(amount),
                    },
                ],
            },
        }
    }

    #[test]
    fn entry_updates_running_balances() {
        let mut state = WorldState::new();
        apply_entry(&mut state, &entry("e1", 500)).unwrap();
        apply_entry(&mut state, &entry("e2", 250)).unwrap();

        let ledger = &state.ledgers["default"];
        assert_eq!(ledger.entries.len(), 2);
        assert_eq!(ledger.balances["operator:o1"]["USD"].debits, 750);
        assert_eq!(ledger.balances["platform:escrow"]["USD"].credits, 750);

        // Ledger-wide invariant: Σ debits == Σ credits per currency.
        let (mut debits, mut credits) = (0, 0);
        for by_currency in ledger.balances.values() {
            let cell = &by_currency["USD"];
            debits += cell.debits;
            credits += cell.credits;
        }
        assert_eq!(debits, credits);
    }

    #[test]
    fn replayed_entry_is_a_no_op() {
        let mut state = WorldState::new();
        apply_entry(&mut state, &entry("e1", 500)).unwrap();
        apply_entry(&mut state, &entry("e1", 500)).unwrap();

        let ledger = &state.ledgers["default"];
        assert_eq!(ledger.entries.len(), 1);
        assert_eq!(ledger.balances["operator:o1"]["USD"].debits, 500);
    }

    #[test]
    fn reused_id_with_different_content_conflicts() {
        let mut state = WorldState::new();
        apply_entry(&mut state, &entry("e1", 500)).unwrap();
        let err = apply_entry(&mut state, &entry("e1", 400)).unwrap_err();
        assert_eq!(err.code(), "LEDGER_ENTRY_CONFLICT");
        assert_eq!(err.status_code(), Some(409));
    }
}
