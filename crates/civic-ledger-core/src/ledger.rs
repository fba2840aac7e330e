use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Kind of token movement recorded by an entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Issue,
    Transfer,
    Spend,
    Reward,
    Penalty,
    Refund,
    /// Project tokens burned at fiat payout.
    Conversion,
}

impl TransactionType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Transfer => "transfer",
            Self::Spend => "spend",
            Self::Reward => "reward",
            Self::Penalty => "penalty",
            Self::Refund => "refund",
            Self::Conversion => "conversion",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "issue" => Some(Self::Issue),
            "transfer" => Some(Self::Transfer),
            "spend" => Some(Self::Spend),
            "reward" => Some(Self::Reward),
            "penalty" => Some(Self::Penalty),
            "refund" => Some(Self::Refund),
            "conversion" => Some(Self::Conversion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "credit" => Some(Self::Credit),
            "debit" => Some(Self::Debit),
            _ => None,
        }
    }
}

/// Entries written by this engine are always `Completed`: the entry and the
/// balance update commit in one batch. The other states exist for rows
/// imported from older deployments and are ignored by the projection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl EntryStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Unsealed description of a token movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDraft {
    pub transaction_type: TransactionType,
    pub direction: Direction,
    pub from_user: Option<String>,
    pub to_user: String,
    pub amount: u64,
    pub related_project: Option<String>,
    /// Claim, request or conversion that caused the movement.
    pub reference: Option<String>,
    pub token_type: Option<String>,
    pub category: Option<String>,
    pub city: String,
}

/// Hash-chained, immutable token movement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub index: u64,
    pub transaction_type: TransactionType,
    pub direction: Direction,
    pub from_user: Option<String>,
    pub to_user: String,
    pub amount: u64,
    pub related_project: Option<String>,
    pub reference: Option<String>,
    pub token_type: Option<String>,
    pub category: Option<String>,
    pub city: String,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl LedgerEntry {
    pub fn is_completed(&self) -> bool {
        self.status == EntryStatus::Completed
    }

    pub fn references(&self, account_id: &str) -> bool {
        self.to_user == account_id || self.from_user.as_deref() == Some(account_id)
    }

    /// Signed balance deltas this entry applies.
    ///
    /// Credits mint to `to_user`; the issuer in `from_user` is not debited.
    /// Debits take from `from_user` and pay `to_user`, unless both are the
    /// same account, in which case the tokens are burned.
    pub fn balance_effects(&self) -> Vec<(&str, i128)> {
        if !self.is_completed() {
            return Vec::new();
        }
        let amount = i128::from(self.amount);
        match self.direction {
            Direction::Credit => vec![(self.to_user.as_str(), amount)],
            Direction::Debit => match self.from_user.as_deref() {
                Some(from) if from == self.to_user => vec![(from, -amount)],
                Some(from) => vec![(from, -amount), (self.to_user.as_str(), amount)],
                None => vec![(self.to_user.as_str(), -amount)],
            },
        }
    }
}

/// Append-only ledger with hash-chain proofs.
///
/// There is no mutation API: corrections are new entries.
#[derive(Debug, Default, Clone)]
pub struct AppendOnlyLedger {
    entries: Vec<LedgerEntry>,
}

impl AppendOnlyLedger {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild a ledger from persisted entries and verify hash-chain integrity.
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Result<Self, LedgerError> {
        let ledger = Self { entries };

        for (expected_index, entry) in ledger.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(LedgerError::Storage(format!(
                    "ledger index gap detected at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !ledger.verify_chain() {
            return Err(LedgerError::Storage(
                "persisted ledger hash-chain verification failed".to_string(),
            ));
        }

        Ok(ledger)
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.entries.last().map(|entry| entry.entry_hash.as_str())
    }

    pub fn find_entry(&self, entry_id: &str) -> Option<&LedgerEntry> {
        self.entries.iter().find(|entry| entry.entry_id == entry_id)
    }

    /// Sum of completed `issue` entries authored by `issuer` in `[start, end)`.
    pub fn issued_between(&self, issuer: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
        self.entries
            .iter()
            .filter(|entry| {
                entry.is_completed()
                    && entry.transaction_type == TransactionType::Issue
                    && entry.from_user.as_deref() == Some(issuer)
                    && entry.created_at >= start
                    && entry.created_at < end
            })
            .map(|entry| entry.amount)
            .sum()
    }

    /// Balance of every referenced account, derived from completed entries.
    pub fn projected_balances(&self) -> HashMap<String, i128> {
        let mut balances: HashMap<String, i128> = HashMap::new();
        for entry in &self.entries {
            for (account, delta) in entry.balance_effects() {
                *balances.entry(account.to_string()).or_default() += delta;
            }
        }
        balances
    }

    pub fn projected_balance(&self, account_id: &str) -> i128 {
        self.entries
            .iter()
            .flat_map(|entry| entry.balance_effects())
            .filter(|(account, _)| *account == account_id)
            .map(|(_, delta)| delta)
            .sum()
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            if entry.previous_hash != previous_hash {
                return false;
            }
            if entry.entry_hash != compute_entry_hash(entry) {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }

    /// Commit a sealed entry after external durability succeeded.
    pub fn commit_entry(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let expected_index = self.entries.len() as u64;
        if entry.index != expected_index {
            return Err(LedgerError::Storage(format!(
                "commit index mismatch: expected {}, got {}",
                expected_index, entry.index
            )));
        }

        if entry.previous_hash.as_deref() != self.last_hash() {
            return Err(LedgerError::Storage(
                "commit previous hash mismatch".to_string(),
            ));
        }

        if entry.entry_hash != compute_entry_hash(&entry) {
            return Err(LedgerError::Storage(
                "commit hash mismatch for ledger entry".to_string(),
            ));
        }

        self.entries.push(entry);
        Ok(())
    }
}

/// Seal a draft into the entry that follows `previous_hash` at `index`.
pub fn seal_entry(
    index: u64,
    previous_hash: Option<String>,
    draft: EntryDraft,
    created_at: DateTime<Utc>,
) -> Result<LedgerEntry, LedgerError> {
    if draft.amount == 0 {
        return Err(LedgerError::Validation(
            "ledger entry amount must be positive".to_string(),
        ));
    }

    let mut entry = LedgerEntry {
        entry_id: Uuid::new_v4().to_string(),
        index,
        transaction_type: draft.transaction_type,
        direction: draft.direction,
        from_user: draft.from_user,
        to_user: draft.to_user,
        amount: draft.amount,
        related_project: draft.related_project,
        reference: draft.reference,
        token_type: draft.token_type,
        category: draft.category,
        city: draft.city,
        status: EntryStatus::Completed,
        created_at,
        previous_hash,
        entry_hash: String::new(),
    };
    entry.entry_hash = compute_entry_hash(&entry);
    Ok(entry)
}

fn compute_entry_hash(entry: &LedgerEntry) -> String {
    let material = serde_json::json!({
        "entry_id": entry.entry_id,
        "index": entry.index,
        "transaction_type": entry.transaction_type,
        "direction": entry.direction,
        "from_user": entry.from_user,
        "to_user": entry.to_user,
        "amount": entry.amount,
        "related_project": entry.related_project,
        "reference": entry.reference,
        "token_type": entry.token_type,
        "category": entry.category,
        "city": entry.city,
        "status": entry.status,
        "created_at": entry.created_at,
        "previous_hash": entry.previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
