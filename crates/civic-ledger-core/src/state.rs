//! Authoritative ledger state and the unit of work that stages one operation.
//!
//! An operation reads through a [`UnitOfWork`], stages every record it
//! changes plus at most a few ledger entries, and hands the resulting
//! [`CommitBatch`] to the repository. Only after the repository accepted the
//! batch is it applied to [`LedgerState`], so a failed commit leaves no trace.

use crate::allocation::AllocationLimit;
use crate::conversion::ConversionRequest;
use crate::error::{LedgerError, StorageError};
use crate::ledger::{seal_entry, AppendOnlyLedger, EntryDraft, LedgerEntry, TransactionType};
use crate::notify::{NotificationEvent, NotificationIntent};
use crate::project::Project;
use crate::requests::{FundRequest, TokenClaim, TokenRequest};
use crate::types::Account;
use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Optimistically versioned record.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync {
    /// Table name used by SQL repositories.
    const TABLE: &'static str;

    fn record_id(&self) -> &str;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

macro_rules! impl_record {
    ($ty:ty, $table:literal) => {
        impl Record for $ty {
            const TABLE: &'static str = $table;

            fn record_id(&self) -> &str {
                &self.id
            }

            fn version(&self) -> u64 {
                self.version
            }

            fn set_version(&mut self, version: u64) {
                self.version = version;
            }
        }
    };
}

impl_record!(Account, "civic_accounts");
impl_record!(Project, "civic_projects");
impl_record!(AllocationLimit, "civic_allocation_limits");
impl_record!(ConversionRequest, "civic_conversions");
impl_record!(TokenClaim, "civic_token_claims");
impl_record!(TokenRequest, "civic_token_requests");
impl_record!(FundRequest, "civic_fund_requests");

/// Stored outcome of a mutating call, keyed by actor-scoped idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub operation: String,
    pub fingerprint: String,
    pub response: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Everything a repository persists, in load order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub accounts: Vec<Account>,
    pub projects: Vec<Project>,
    pub allocations: Vec<AllocationLimit>,
    pub conversions: Vec<ConversionRequest>,
    pub claims: Vec<TokenClaim>,
    pub token_requests: Vec<TokenRequest>,
    pub fund_requests: Vec<FundRequest>,
    pub entries: Vec<LedgerEntry>,
    pub idempotency: Vec<IdempotencyRecord>,
}

/// All writes of one operation. Persisted atomically or not at all.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub accounts: Vec<Account>,
    pub projects: Vec<Project>,
    pub allocations: Vec<AllocationLimit>,
    pub conversions: Vec<ConversionRequest>,
    pub claims: Vec<TokenClaim>,
    pub token_requests: Vec<TokenRequest>,
    pub fund_requests: Vec<FundRequest>,
    pub entries: Vec<LedgerEntry>,
    pub idempotency: Option<IdempotencyRecord>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.projects.is_empty()
            && self.allocations.is_empty()
            && self.conversions.is_empty()
            && self.claims.is_empty()
            && self.token_requests.is_empty()
            && self.fund_requests.is_empty()
            && self.entries.is_empty()
            && self.idempotency.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    pub(crate) accounts: HashMap<String, Account>,
    pub(crate) projects: HashMap<String, Project>,
    pub(crate) allocations: HashMap<String, AllocationLimit>,
    pub(crate) conversions: HashMap<String, ConversionRequest>,
    pub(crate) claims: HashMap<String, TokenClaim>,
    pub(crate) token_requests: HashMap<String, TokenRequest>,
    pub(crate) fund_requests: HashMap<String, FundRequest>,
    pub(crate) ledger: AppendOnlyLedger,
    pub(crate) idempotency: HashMap<String, IdempotencyRecord>,
}

fn index_by_id<R: Record>(records: Vec<R>) -> HashMap<String, R> {
    records
        .into_iter()
        .map(|record| (record.record_id().to_string(), record))
        .collect()
}

fn check_versions<R: Record>(current: &HashMap<String, R>, staged: &[R]) -> Result<(), StorageError> {
    for record in staged {
        let expected = current
            .get(record.record_id())
            .map(|existing| existing.version())
            .unwrap_or(0);
        if record.version() != expected + 1 {
            return Err(StorageError::Conflict(format!(
                "{} '{}' is at version {}, batch was staged against {}",
                R::TABLE,
                record.record_id(),
                expected,
                record.version().saturating_sub(1)
            )));
        }
    }
    Ok(())
}

fn upsert_all<R: Record>(target: &mut HashMap<String, R>, staged: Vec<R>) {
    for record in staged {
        target.insert(record.record_id().to_string(), record);
    }
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        Ok(Self {
            accounts: index_by_id(snapshot.accounts),
            projects: index_by_id(snapshot.projects),
            allocations: index_by_id(snapshot.allocations),
            conversions: index_by_id(snapshot.conversions),
            claims: index_by_id(snapshot.claims),
            token_requests: index_by_id(snapshot.token_requests),
            fund_requests: index_by_id(snapshot.fund_requests),
            ledger: AppendOnlyLedger::from_entries(snapshot.entries)?,
            idempotency: snapshot
                .idempotency
                .into_iter()
                .map(|record| (record.key.clone(), record))
                .collect(),
        })
    }

    pub fn to_snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            accounts: self.accounts.values().cloned().collect(),
            projects: self.projects.values().cloned().collect(),
            allocations: self.allocations.values().cloned().collect(),
            conversions: self.conversions.values().cloned().collect(),
            claims: self.claims.values().cloned().collect(),
            token_requests: self.token_requests.values().cloned().collect(),
            fund_requests: self.fund_requests.values().cloned().collect(),
            entries: self.ledger.entries().to_vec(),
            idempotency: self.idempotency.values().cloned().collect(),
        }
    }

    pub fn ledger(&self) -> &AppendOnlyLedger {
        &self.ledger
    }

    pub fn account(&self, id: &str) -> Option<&Account> {
        self.accounts.get(id)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.get(id)
    }

    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn allocations(&self) -> impl Iterator<Item = &AllocationLimit> {
        self.allocations.values()
    }

    pub fn conversion(&self, id: &str) -> Option<&ConversionRequest> {
        self.conversions.get(id)
    }

    pub fn conversions(&self) -> impl Iterator<Item = &ConversionRequest> {
        self.conversions.values()
    }

    pub fn claim(&self, id: &str) -> Option<&TokenClaim> {
        self.claims.get(id)
    }

    pub fn token_request(&self, id: &str) -> Option<&TokenRequest> {
        self.token_requests.get(id)
    }

    pub fn fund_request(&self, id: &str) -> Option<&FundRequest> {
        self.fund_requests.get(id)
    }

    pub fn idempotency(&self, scoped_key: &str) -> Option<&IdempotencyRecord> {
        self.idempotency.get(scoped_key)
    }

    /// Drop replay records older than `cutoff`; returns how many went.
    pub fn prune_idempotency(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.idempotency.len();
        self.idempotency
            .retain(|_, record| record.recorded_at >= cutoff);
        before - self.idempotency.len()
    }

    /// Reject a batch staged against stale versions.
    pub fn check_batch(&self, batch: &CommitBatch) -> Result<(), StorageError> {
        check_versions(&self.accounts, &batch.accounts)?;
        check_versions(&self.projects, &batch.projects)?;
        check_versions(&self.allocations, &batch.allocations)?;
        check_versions(&self.conversions, &batch.conversions)?;
        check_versions(&self.claims, &batch.claims)?;
        check_versions(&self.token_requests, &batch.token_requests)?;
        check_versions(&self.fund_requests, &batch.fund_requests)?;

        let mut expected_index = self.ledger.len() as u64;
        let mut expected_previous = self.ledger.last_hash().map(str::to_string);
        for entry in &batch.entries {
            if entry.index != expected_index || entry.previous_hash != expected_previous {
                return Err(StorageError::Conflict(format!(
                    "ledger head moved: entry staged at index {}, head is {}",
                    entry.index, expected_index
                )));
            }
            expected_index += 1;
            expected_previous = Some(entry.entry_hash.clone());
        }

        if let Some(record) = &batch.idempotency {
            if self.idempotency.contains_key(&record.key) {
                return Err(StorageError::Conflict(format!(
                    "idempotency key '{}' recorded concurrently",
                    record.key
                )));
            }
        }
        Ok(())
    }

    /// Apply a batch the repository already accepted.
    pub fn apply(&mut self, batch: CommitBatch) -> Result<(), LedgerError> {
        for entry in batch.entries {
            self.ledger.commit_entry(entry)?;
        }
        upsert_all(&mut self.accounts, batch.accounts);
        upsert_all(&mut self.projects, batch.projects);
        upsert_all(&mut self.allocations, batch.allocations);
        upsert_all(&mut self.conversions, batch.conversions);
        upsert_all(&mut self.claims, batch.claims);
        upsert_all(&mut self.token_requests, batch.token_requests);
        upsert_all(&mut self.fund_requests, batch.fund_requests);
        if let Some(record) = batch.idempotency {
            self.idempotency.insert(record.key.clone(), record);
        }
        Ok(())
    }
}

fn stage<R: Record>(current: Option<&R>, staged: &mut BTreeMap<String, R>, mut record: R) {
    let base = current.map(|existing| existing.version()).unwrap_or(0);
    record.set_version(base + 1);
    staged.insert(record.record_id().to_string(), record);
}

fn read<R: Record>(current: &HashMap<String, R>, staged: &BTreeMap<String, R>, id: &str) -> Option<R> {
    staged.get(id).or_else(|| current.get(id)).cloned()
}

/// Staging area for one operation over a consistent view of the state.
pub struct UnitOfWork<'a> {
    state: &'a LedgerState,
    now: DateTime<Utc>,
    accounts: BTreeMap<String, Account>,
    projects: BTreeMap<String, Project>,
    allocations: BTreeMap<String, AllocationLimit>,
    conversions: BTreeMap<String, ConversionRequest>,
    claims: BTreeMap<String, TokenClaim>,
    token_requests: BTreeMap<String, TokenRequest>,
    fund_requests: BTreeMap<String, FundRequest>,
    entries: Vec<LedgerEntry>,
    notifications: Vec<NotificationIntent>,
}

impl<'a> UnitOfWork<'a> {
    pub fn new(state: &'a LedgerState, now: DateTime<Utc>) -> Self {
        Self {
            state,
            // Postgres keeps microseconds; entry hashes must survive a reload.
            now: now.trunc_subsecs(6),
            accounts: BTreeMap::new(),
            projects: BTreeMap::new(),
            allocations: BTreeMap::new(),
            conversions: BTreeMap::new(),
            claims: BTreeMap::new(),
            token_requests: BTreeMap::new(),
            fund_requests: BTreeMap::new(),
            entries: Vec::new(),
            notifications: Vec::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn account(&self, id: &str) -> Option<Account> {
        read(&self.state.accounts, &self.accounts, id)
    }

    pub fn require_account(&self, id: &str) -> Result<Account, LedgerError> {
        self.account(id)
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }

    pub fn put_account(&mut self, mut account: Account) {
        account.updated_at = self.now;
        stage(self.state.accounts.get(&account.id), &mut self.accounts, account);
    }

    pub fn project(&self, id: &str) -> Option<Project> {
        read(&self.state.projects, &self.projects, id)
    }

    pub fn require_project(&self, id: &str) -> Result<Project, LedgerError> {
        self.project(id)
            .ok_or_else(|| LedgerError::ProjectNotFound(id.to_string()))
    }

    pub fn put_project(&mut self, mut project: Project) {
        project.updated_at = self.now;
        stage(self.state.projects.get(&project.id), &mut self.projects, project);
    }

    /// The active allocation for a project, staged changes included.
    pub fn active_allocation(&self, project_id: &str) -> Option<AllocationLimit> {
        if let Some(staged) = self
            .allocations
            .values()
            .find(|limit| limit.project_id == project_id && limit.is_active())
        {
            return Some(staged.clone());
        }
        self.state
            .allocations
            .values()
            .filter(|limit| !self.allocations.contains_key(&limit.id))
            .find(|limit| limit.project_id == project_id && limit.is_active())
            .cloned()
    }

    pub fn put_allocation(&mut self, mut limit: AllocationLimit) {
        limit.updated_at = self.now;
        stage(self.state.allocations.get(&limit.id), &mut self.allocations, limit);
    }

    pub fn conversion(&self, id: &str) -> Option<ConversionRequest> {
        read(&self.state.conversions, &self.conversions, id)
    }

    pub fn require_conversion(&self, id: &str) -> Result<ConversionRequest, LedgerError> {
        self.conversion(id)
            .ok_or_else(|| LedgerError::ConversionNotFound(id.to_string()))
    }

    pub fn put_conversion(&mut self, mut conversion: ConversionRequest) {
        conversion.updated_at = self.now;
        stage(
            self.state.conversions.get(&conversion.id),
            &mut self.conversions,
            conversion,
        );
    }

    pub fn claim(&self, id: &str) -> Option<TokenClaim> {
        read(&self.state.claims, &self.claims, id)
    }

    pub fn put_claim(&mut self, mut claim: TokenClaim) {
        claim.updated_at = self.now;
        stage(self.state.claims.get(&claim.id), &mut self.claims, claim);
    }

    pub fn token_request(&self, id: &str) -> Option<TokenRequest> {
        read(&self.state.token_requests, &self.token_requests, id)
    }

    pub fn put_token_request(&mut self, mut request: TokenRequest) {
        request.updated_at = self.now;
        stage(
            self.state.token_requests.get(&request.id),
            &mut self.token_requests,
            request,
        );
    }

    pub fn fund_request(&self, id: &str) -> Option<FundRequest> {
        read(&self.state.fund_requests, &self.fund_requests, id)
    }

    pub fn put_fund_request(&mut self, mut request: FundRequest) {
        request.updated_at = self.now;
        stage(
            self.state.fund_requests.get(&request.id),
            &mut self.fund_requests,
            request,
        );
    }

    /// Issued amount by `issuer` in `[start, end)`, staged entries included.
    pub fn issued_between(&self, issuer: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
        let staged: u64 = self
            .entries
            .iter()
            .filter(|entry| {
                entry.transaction_type == TransactionType::Issue
                    && entry.from_user.as_deref() == Some(issuer)
                    && entry.created_at >= start
                    && entry.created_at < end
            })
            .map(|entry| entry.amount)
            .sum();
        self.state.ledger.issued_between(issuer, start, end) + staged
    }

    /// Seal the next entry on top of the ledger head and any staged entries.
    pub fn append_entry(&mut self, draft: EntryDraft) -> Result<LedgerEntry, LedgerError> {
        let index = (self.state.ledger.len() + self.entries.len()) as u64;
        let previous_hash = self
            .entries
            .last()
            .map(|entry| entry.entry_hash.clone())
            .or_else(|| self.state.ledger.last_hash().map(str::to_string));
        let entry = seal_entry(index, previous_hash, draft, self.now)?;
        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn notify(&mut self, recipient_id: impl Into<String>, event: NotificationEvent) {
        self.notifications.push(NotificationIntent {
            recipient_id: recipient_id.into(),
            event,
            emitted_at: self.now,
        });
    }

    pub fn into_parts(self) -> (CommitBatch, Vec<NotificationIntent>) {
        let batch = CommitBatch {
            accounts: self.accounts.into_values().collect(),
            projects: self.projects.into_values().collect(),
            allocations: self.allocations.into_values().collect(),
            conversions: self.conversions.into_values().collect(),
            claims: self.claims.into_values().collect(),
            token_requests: self.token_requests.into_values().collect(),
            fund_requests: self.fund_requests.into_values().collect(),
            entries: self.entries,
            idempotency: None,
        };
        (batch, self.notifications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Direction;
    use crate::types::UserType;

    fn account(id: &str) -> Account {
        let now = Utc::now();
        Account {
            id: id.to_string(),
            user_type: UserType::Citizen,
            city: "lagos".into(),
            is_approved: true,
            token_balance: 0,
            reserved_tokens: 0,
            daily_issuance_limit: None,
            deleted: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn issue(to: &str, amount: u64) -> EntryDraft {
        EntryDraft {
            transaction_type: TransactionType::Issue,
            direction: Direction::Credit,
            from_user: Some("gov".into()),
            to_user: to.to_string(),
            amount,
            related_project: None,
            reference: None,
            token_type: None,
            category: None,
            city: "lagos".into(),
        }
    }

    #[test]
    fn staged_writes_are_invisible_until_applied() {
        let mut state = LedgerState::new();
        let batch = {
            let mut uow = UnitOfWork::new(&state, Utc::now());
            let mut alice = account("alice");
            alice.token_balance = 5;
            uow.put_account(alice);
            uow.append_entry(issue("alice", 5)).unwrap();
            assert_eq!(uow.require_account("alice").unwrap().token_balance, 5);
            uow.into_parts().0
        };
        assert!(state.account("alice").is_none());

        state.check_batch(&batch).unwrap();
        state.apply(batch).unwrap();
        assert_eq!(state.account("alice").map(|a| a.version), Some(1));
        assert_eq!(state.ledger().len(), 1);
    }

    #[test]
    fn stale_batch_is_a_conflict() {
        let mut state = LedgerState::new();
        let first = {
            let mut uow = UnitOfWork::new(&state, Utc::now());
            uow.put_account(account("alice"));
            uow.into_parts().0
        };
        let second = first.clone();
        state.check_batch(&first).unwrap();
        state.apply(first).unwrap();

        assert!(matches!(
            state.check_batch(&second),
            Err(StorageError::Conflict(_))
        ));
    }

    #[test]
    fn staged_entries_chain_onto_each_other() {
        let state = LedgerState::new();
        let mut uow = UnitOfWork::new(&state, Utc::now());
        let first = uow.append_entry(issue("a", 1)).unwrap();
        let second = uow.append_entry(issue("b", 2)).unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.previous_hash.as_deref(), Some(first.entry_hash.as_str()));
        assert_eq!(uow.issued_between("gov", Utc::now() - chrono::Duration::hours(1), Utc::now() + chrono::Duration::hours(1)), 3);
    }
}
