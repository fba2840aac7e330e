//! Consistency audit over the cached counters and the ledger.
//!
//! Every mutation commits its entry and its counter updates in one batch, so
//! a divergence here means storage was edited out of band or a bug slipped
//! through. The report only describes; it never repairs.

use crate::state::LedgerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceDivergence {
    pub account_id: String,
    pub cached_balance: u64,
    pub projected_balance: i128,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FundingMismatch {
    pub project_id: String,
    pub tokens_funded: u64,
    pub supporters_total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscrowMismatch {
    pub account_id: String,
    pub reserved_tokens: u64,
    pub open_escrow: u64,
    pub token_balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub checked_at: DateTime<Utc>,
    pub entry_count: usize,
    pub chain_valid: bool,
    pub balance_divergences: Vec<BalanceDivergence>,
    pub funding_mismatches: Vec<FundingMismatch>,
    pub escrow_mismatches: Vec<EscrowMismatch>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.chain_valid
            && self.balance_divergences.is_empty()
            && self.funding_mismatches.is_empty()
            && self.escrow_mismatches.is_empty()
    }
}

pub fn reconcile(state: &LedgerState, checked_at: DateTime<Utc>) -> ReconciliationReport {
    let projected = state.ledger().projected_balances();

    // Accounts known to the mirror plus any id the ledger moved tokens to.
    let ids: BTreeSet<&str> = state
        .accounts()
        .map(|account| account.id.as_str())
        .chain(projected.keys().map(String::as_str))
        .collect();

    let balance_divergences = ids
        .into_iter()
        .filter_map(|id| {
            let cached = state.account(id).map(|a| a.token_balance).unwrap_or(0);
            let derived = projected.get(id).copied().unwrap_or(0);
            (i128::from(cached) != derived).then(|| BalanceDivergence {
                account_id: id.to_string(),
                cached_balance: cached,
                projected_balance: derived,
            })
        })
        .collect();

    let mut funding_mismatches: Vec<FundingMismatch> = state
        .projects()
        .filter(|project| project.tokens_funded != project.supporters_total())
        .map(|project| FundingMismatch {
            project_id: project.id.clone(),
            tokens_funded: project.tokens_funded,
            supporters_total: project.supporters_total(),
        })
        .collect();
    funding_mismatches.sort_by(|a, b| a.project_id.cmp(&b.project_id));

    let mut open_escrow: BTreeMap<&str, u64> = BTreeMap::new();
    for conversion in state.conversions() {
        if conversion.status.holds_escrow() {
            *open_escrow.entry(conversion.owner_id.as_str()).or_default() +=
                conversion.escrowed_tokens;
        }
    }

    let mut escrow_mismatches: Vec<EscrowMismatch> = state
        .accounts()
        .filter_map(|account| {
            let held = open_escrow.get(account.id.as_str()).copied().unwrap_or(0);
            (account.reserved_tokens != held || account.reserved_tokens > account.token_balance)
                .then(|| EscrowMismatch {
                    account_id: account.id.clone(),
                    reserved_tokens: account.reserved_tokens,
                    open_escrow: held,
                    token_balance: account.token_balance,
                })
        })
        .collect();
    escrow_mismatches.sort_by(|a, b| a.account_id.cmp(&b.account_id));

    ReconciliationReport {
        checked_at,
        entry_count: state.ledger().len(),
        chain_valid: state.ledger().verify_chain(),
        balance_divergences,
        funding_mismatches,
        escrow_mismatches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Direction, EntryDraft, TransactionType};
    use crate::state::UnitOfWork;
    use crate::types::{Account, UserType};

    fn account(id: &str, balance: u64) -> Account {
        let now = Utc::now();
        Account {
            id: id.to_string(),
            user_type: UserType::Citizen,
            city: "lagos".into(),
            is_approved: true,
            token_balance: balance,
            reserved_tokens: 0,
            daily_issuance_limit: None,
            deleted: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn state_with(balance: u64, issued: u64) -> LedgerState {
        let mut state = LedgerState::new();
        let batch = {
            let mut uow = UnitOfWork::new(&state, Utc::now());
            uow.put_account(account("alice", balance));
            uow.append_entry(EntryDraft {
                transaction_type: TransactionType::Issue,
                direction: Direction::Credit,
                from_user: Some("gov".into()),
                to_user: "alice".into(),
                amount: issued,
                related_project: None,
                reference: None,
                token_type: None,
                category: None,
                city: "lagos".into(),
            })
            .unwrap();
            uow.into_parts().0
        };
        state.apply(batch).unwrap();
        state
    }

    #[test]
    fn consistent_state_reports_clean() {
        let report = reconcile(&state_with(10, 10), Utc::now());
        assert!(report.is_consistent());
        assert_eq!(report.entry_count, 1);
    }

    #[test]
    fn cached_balance_drift_is_flagged() {
        let report = reconcile(&state_with(12, 10), Utc::now());
        assert!(!report.is_consistent());
        assert_eq!(
            report.balance_divergences,
            vec![BalanceDivergence {
                account_id: "alice".into(),
                cached_balance: 12,
                projected_balance: 10,
            }]
        );
    }

    #[test]
    fn stray_reservation_is_flagged() {
        let mut state = state_with(10, 10);
        if let Some(alice) = state.accounts.get_mut("alice") {
            alice.reserved_tokens = 4;
        }
        let report = reconcile(&state, Utc::now());
        assert_eq!(report.escrow_mismatches.len(), 1);
        assert_eq!(report.escrow_mismatches[0].open_escrow, 0);
    }
}
