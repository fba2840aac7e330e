use crate::clock::{local_day_window, Clock, SystemClock};
use crate::conversion::ConversionRequest;
use crate::documents::DocumentPolicy;
use crate::error::{ErrorCategory, LedgerError, StorageError};
use crate::ledger::{LedgerEntry, TransactionType};
use crate::notify::{NoopNotificationSink, NotificationIntent, NotificationSink};
use crate::policy::{ConversionEscrow, SpendCapPolicy};
use crate::project::ProjectSummary;
use crate::reconcile::{reconcile, ReconciliationReport};
use crate::requests::{FundRequest, RequestKind, TokenClaim, TokenRequest};
use crate::state::{CommitBatch, IdempotencyRecord, LedgerState, UnitOfWork};
use crate::storage::{self, LedgerRepository, LedgerStorageConfig};
use crate::types::{Account, Actor, CallContext};
use chrono::{Duration, FixedOffset};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

mod conversion;
mod issuance;
mod registry;
mod requests;
mod support;

pub use issuance::IssueCommand;
pub use registry::ProjectApproval;
pub use support::SupportReceipt;

/// Civic ledger runtime configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// No default: the deployment must choose how spend caps resolve.
    pub spend_cap_policy: SpendCapPolicy,
    /// Payment minor units per token for claims.
    pub claim_token_rate: u64,
    /// Fiat minor units paid out per converted token.
    pub fiat_minor_per_token: u64,
    /// Offset that defines the "local day" of the daily issuance cap.
    pub issuance_utc_offset_seconds: i32,
    pub conversion_escrow: ConversionEscrow,
    pub max_commit_retries: u32,
    /// How long a keyed response stays replayable. A retry after this window
    /// runs as a fresh call. `None` keeps records forever.
    pub idempotency_retention: Option<Duration>,
    pub documents: DocumentPolicy,
    pub ledger_storage: LedgerStorageConfig,
}

impl LedgerConfig {
    pub fn new(spend_cap_policy: SpendCapPolicy) -> Self {
        Self {
            spend_cap_policy,
            claim_token_rate: 100,
            fiat_minor_per_token: 100,
            issuance_utc_offset_seconds: 0,
            conversion_escrow: ConversionEscrow::default(),
            max_commit_retries: 3,
            idempotency_retention: Some(Duration::days(30)),
            documents: DocumentPolicy::default(),
            ledger_storage: LedgerStorageConfig::Memory,
        }
    }

    pub fn issuance_offset(&self) -> Result<FixedOffset, LedgerError> {
        FixedOffset::east_opt(self.issuance_utc_offset_seconds).ok_or_else(|| {
            LedgerError::Validation(format!(
                "issuance utc offset {}s is out of range",
                self.issuance_utc_offset_seconds
            ))
        })
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.claim_token_rate == 0 {
            return Err(LedgerError::Validation(
                "claim token rate must be positive".to_string(),
            ));
        }
        if self.fiat_minor_per_token == 0 {
            return Err(LedgerError::Validation(
                "fiat rate per token must be positive".to_string(),
            ));
        }
        match self.spend_cap_policy {
            SpendCapPolicy::FlatCap { per_citizen: 0 }
            | SpendCapPolicy::AllocationOrFlat {
                fallback_per_citizen: 0,
            } => {
                return Err(LedgerError::Validation(
                    "flat per-citizen cap must be positive".to_string(),
                ))
            }
            _ => {}
        }
        if matches!(self.idempotency_retention, Some(window) if window <= Duration::zero()) {
            return Err(LedgerError::Validation(
                "idempotency retention must be positive".to_string(),
            ));
        }
        self.issuance_offset().map(|_| ())
    }
}

/// Filter for the read-side ledger listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerQuery {
    /// Entries where this account is sender or recipient.
    pub account: Option<String>,
    pub transaction_type: Option<TransactionType>,
    pub project: Option<String>,
    pub newest_first: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Token ledger engine.
///
/// All mutations of one instance run inside a single critical section over
/// the authoritative state. Each operation stages its writes in a
/// [`UnitOfWork`], the repository persists the batch atomically, and only
/// then is the batch applied in memory. A repository version conflict
/// (another replica won the race) reloads state and re-runs the operation.
pub struct CivicLedger {
    state: AsyncMutex<LedgerState>,
    repository: Arc<dyn LedgerRepository>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    config: LedgerConfig,
}

impl CivicLedger {
    /// Bootstrap with the configured storage backend and no notifications.
    pub async fn bootstrap(config: LedgerConfig) -> Result<Self, LedgerError> {
        let repository = storage::bootstrap(config.ledger_storage.clone()).await?;
        Self::with_parts(
            config,
            repository,
            Arc::new(NoopNotificationSink),
            Arc::new(SystemClock),
        )
        .await
    }

    pub async fn with_parts(
        config: LedgerConfig,
        repository: Arc<dyn LedgerRepository>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        let offset = config.issuance_offset()?;
        let state = LedgerState::from_snapshot(repository.load().await?)?;

        info!(
            backend = repository.backend_label(),
            policy = config.spend_cap_policy.label(),
            entries = state.ledger().len(),
            notifier = notifier.name(),
            "Civic ledger bootstrapped"
        );

        Ok(Self {
            state: AsyncMutex::new(state),
            repository,
            notifier,
            clock,
            offset,
            config,
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn ledger_backend(&self) -> &'static str {
        self.repository.backend_label()
    }

    /// Run one mutating operation under the caller's idempotency key.
    async fn execute<T, F>(
        &self,
        ctx: &CallContext,
        operation: &'static str,
        command: serde_json::Value,
        run: F,
    ) -> Result<T, LedgerError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut UnitOfWork<'_>) -> Result<T, LedgerError>,
    {
        let fingerprint = fingerprint(operation, &command)?;
        self.commit_unit(operation, &ctx.actor.id, Some((ctx, fingerprint)), run)
            .await
    }

    /// Run a mutation that has no caller key, such as the account mirror.
    async fn execute_unkeyed<T, F>(
        &self,
        operation: &'static str,
        caller: &str,
        run: F,
    ) -> Result<T, LedgerError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut UnitOfWork<'_>) -> Result<T, LedgerError>,
    {
        self.commit_unit(operation, caller, None, run).await
    }

    async fn commit_unit<T, F>(
        &self,
        operation: &'static str,
        caller: &str,
        keyed: Option<(&CallContext, String)>,
        mut run: F,
    ) -> Result<T, LedgerError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut UnitOfWork<'_>) -> Result<T, LedgerError>,
    {
        let scoped_key = keyed.as_ref().map(|(ctx, _)| ctx.scoped_key());
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let mut state = self.state.lock().await;

            if let (Some((ctx, fingerprint)), Some(key)) = (&keyed, &scoped_key) {
                if let Some(record) = state.idempotency(key) {
                    if record.operation != operation || &record.fingerprint != fingerprint {
                        return Err(LedgerError::IdempotencyKeyReused {
                            key: ctx.idempotency_key.to_string(),
                            operation: record.operation.clone(),
                        });
                    }
                    info!(operation, caller, key = %ctx.idempotency_key, "Replayed idempotent call");
                    return Ok(serde_json::from_value(record.response.clone())?);
                }
            }

            let now = self.clock.now();
            let mut uow = UnitOfWork::new(&state, now);
            let output = match run(&mut uow) {
                Ok(output) => output,
                Err(err) => {
                    if err.category() == ErrorCategory::StatePrecondition {
                        warn!(operation, caller, code = err.code(), reason = %err, "Operation rejected");
                    }
                    return Err(err);
                }
            };
            let (mut batch, notifications) = uow.into_parts();

            if let (Some((_, fingerprint)), Some(key)) = (&keyed, &scoped_key) {
                batch.idempotency = Some(IdempotencyRecord {
                    key: key.clone(),
                    operation: operation.to_string(),
                    fingerprint: fingerprint.clone(),
                    response: serde_json::to_value(&output)?,
                    recorded_at: now,
                });
            }

            match self.repository.commit(&batch).await {
                Ok(()) => {
                    self.settle_committed(&mut state, batch, operation, caller)
                        .await?;
                    drop(state);
                    self.dispatch(notifications).await;
                    return Ok(output);
                }
                Err(StorageError::Conflict(reason)) => {
                    warn!(operation, caller, attempt, reason = %reason, "Commit conflict, reloading ledger state");
                    *state = LedgerState::from_snapshot(self.repository.load().await?)?;
                    if attempt > self.config.max_commit_retries {
                        return Err(LedgerError::Conflict { attempts: attempt });
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Bring in-memory state level with a batch the repository already
    /// stored. A batch that no longer applies means local state drifted, so
    /// the repository copy wins.
    async fn settle_committed(
        &self,
        state: &mut LedgerState,
        batch: CommitBatch,
        operation: &'static str,
        caller: &str,
    ) -> Result<(), LedgerError> {
        if let Err(err) = state.apply(batch) {
            warn!(operation, caller, error = %err, "Committed batch did not apply locally, reloading ledger state");
            *state = LedgerState::from_snapshot(self.repository.load().await?)?;
        }
        Ok(())
    }

    /// Deliver after commit. Failures never reach the caller.
    async fn dispatch(&self, intents: Vec<NotificationIntent>) {
        for intent in intents {
            if let Err(err) = self.notifier.deliver(&intent).await {
                warn!(
                    sink = self.notifier.name(),
                    recipient = %intent.recipient_id,
                    error = %err,
                    "Notification delivery failed"
                );
            }
        }
    }

    pub async fn account(&self, account_id: &str) -> Result<Account, LedgerError> {
        let state = self.state.lock().await;
        state
            .account(account_id)
            .cloned()
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
    }

    pub async fn balance(&self, account_id: &str) -> Result<u64, LedgerError> {
        Ok(self.account(account_id).await?.token_balance)
    }

    pub async fn project(&self, project_id: &str) -> Result<ProjectSummary, LedgerError> {
        let state = self.state.lock().await;
        state
            .project(project_id)
            .map(|project| project.summary())
            .ok_or_else(|| LedgerError::ProjectNotFound(project_id.to_string()))
    }

    pub async fn projects(&self, city: Option<&str>) -> Vec<ProjectSummary> {
        let state = self.state.lock().await;
        let mut projects: Vec<ProjectSummary> = state
            .projects()
            .filter(|project| city.map_or(true, |city| project.city == city))
            .map(|project| project.summary())
            .collect();
        projects.sort_by(|a, b| a.project.created_at.cmp(&b.project.created_at));
        projects
    }

    pub async fn conversion(&self, conversion_id: &str) -> Result<ConversionRequest, LedgerError> {
        let state = self.state.lock().await;
        state
            .conversion(conversion_id)
            .cloned()
            .ok_or_else(|| LedgerError::ConversionNotFound(conversion_id.to_string()))
    }

    pub async fn claim(&self, claim_id: &str) -> Result<TokenClaim, LedgerError> {
        let state = self.state.lock().await;
        state
            .claim(claim_id)
            .cloned()
            .ok_or_else(|| request_not_found(RequestKind::Claim, claim_id))
    }

    pub async fn token_request(&self, request_id: &str) -> Result<TokenRequest, LedgerError> {
        let state = self.state.lock().await;
        state
            .token_request(request_id)
            .cloned()
            .ok_or_else(|| request_not_found(RequestKind::TokenRequest, request_id))
    }

    pub async fn fund_request(&self, request_id: &str) -> Result<FundRequest, LedgerError> {
        let state = self.state.lock().await;
        state
            .fund_request(request_id)
            .cloned()
            .ok_or_else(|| request_not_found(RequestKind::FundRequest, request_id))
    }

    pub async fn ledger_entries(&self, query: &LedgerQuery) -> Vec<LedgerEntry> {
        let state = self.state.lock().await;
        let matching = state.ledger().entries().iter().filter(|entry| {
            query
                .account
                .as_deref()
                .map_or(true, |account| entry.references(account))
                && query
                    .transaction_type
                    .map_or(true, |kind| entry.transaction_type == kind)
                && query
                    .project
                    .as_deref()
                    .map_or(true, |project| entry.related_project.as_deref() == Some(project))
        });

        let limit = query.limit.unwrap_or(usize::MAX);
        if query.newest_first {
            matching.rev().skip(query.offset).take(limit).cloned().collect()
        } else {
            matching.skip(query.offset).take(limit).cloned().collect()
        }
    }

    /// Tokens the government has issued in the current local day.
    pub async fn issued_today(&self, government_id: &str) -> u64 {
        let (start, end) = local_day_window(self.clock.now(), self.offset);
        let state = self.state.lock().await;
        state.ledger().issued_between(government_id, start, end)
    }

    /// Forget replay records older than the retention window.
    pub async fn prune_idempotency_keys(&self) -> Result<u64, LedgerError> {
        let Some(window) = self.config.idempotency_retention else {
            return Ok(0);
        };
        let cutoff = self.clock.now() - window;

        let mut state = self.state.lock().await;
        let pruned = self.repository.prune_idempotency(cutoff).await?;
        state.prune_idempotency(cutoff);
        drop(state);

        if pruned > 0 {
            info!(pruned, cutoff = %cutoff, "Pruned idempotency records");
        }
        Ok(pruned)
    }

    pub async fn reconcile(&self) -> ReconciliationReport {
        let state = self.state.lock().await;
        let report = reconcile(&state, self.clock.now());
        if !report.is_consistent() {
            warn!(
                chain_valid = report.chain_valid,
                balance_divergences = report.balance_divergences.len(),
                funding_mismatches = report.funding_mismatches.len(),
                escrow_mismatches = report.escrow_mismatches.len(),
                "Ledger reconciliation found divergence"
            );
        }
        report
    }

    pub async fn verify_ledger_chain(&self) -> bool {
        self.state.lock().await.ledger().verify_chain()
    }
}

fn fingerprint(operation: &str, command: &serde_json::Value) -> Result<String, LedgerError> {
    let material = serde_json::json!({
        "operation": operation,
        "command": command,
    });
    let bytes = serde_json::to_vec(&material)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn request_not_found(kind: RequestKind, id: &str) -> LedgerError {
    LedgerError::RequestNotFound {
        kind: kind.name(),
        id: id.to_string(),
    }
}

/// The caller's own account: present, not soft-deleted, and stored with the
/// role the caller claims.
fn acting_account(uow: &UnitOfWork<'_>, actor: &Actor) -> Result<Account, LedgerError> {
    let account = uow.require_account(&actor.id)?;
    if !account.is_active() {
        return Err(LedgerError::Unauthorized(format!(
            "account '{}' is deleted",
            actor.id
        )));
    }
    if account.user_type != actor.user_type {
        return Err(LedgerError::Unauthorized(format!(
            "account '{}' is registered as a {}, not a {}",
            actor.id,
            account.user_type.name(),
            actor.user_type.name()
        )));
    }
    Ok(account)
}

fn require_text(value: &str, what: &str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::Validation(format!("{what} is required")));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::ledger::{Direction, EntryDraft};
    use crate::storage::MemoryRepository;
    use crate::types::{AccountProfile, Actor, IdempotencyKey, UserType};
    use chrono::Utc;

    #[tokio::test]
    async fn retry_with_same_key_replays_without_second_mutation() {
        let h = harness(SpendCapPolicy::RequireAllocation).await;
        h.citizen("alice", 0).await;
        let ctx = CallContext::new(h.gov.clone(), IdempotencyKey::new("issue-1").unwrap());

        let first = h
            .ledger
            .issue_tokens(&ctx, IssueCommand::new("alice", 10))
            .await
            .unwrap();
        let second = h
            .ledger
            .issue_tokens(&ctx, IssueCommand::new("alice", 10))
            .await
            .unwrap();

        assert_eq!(first.entry_id, second.entry_id);
        assert_eq!(h.ledger.balance("alice").await.unwrap(), 10);
        assert_eq!(h.ledger.ledger_entries(&LedgerQuery::default()).await.len(), 1);
    }

    #[tokio::test]
    async fn reused_key_with_different_command_is_refused() {
        let h = harness(SpendCapPolicy::RequireAllocation).await;
        h.citizen("alice", 0).await;
        let ctx = CallContext::new(h.gov.clone(), IdempotencyKey::new("issue-1").unwrap());

        h.ledger
            .issue_tokens(&ctx, IssueCommand::new("alice", 10))
            .await
            .unwrap();
        let err = h
            .ledger
            .issue_tokens(&ctx, IssueCommand::new("alice", 11))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IDEMPOTENCY_KEY_REUSED");
    }

    #[tokio::test]
    async fn failed_call_does_not_burn_the_key() {
        let h = harness(SpendCapPolicy::RequireAllocation).await;
        h.citizen("alice", 0).await;
        let ctx = CallContext::new(h.gov.clone(), IdempotencyKey::new("issue-1").unwrap());

        assert!(h
            .ledger
            .issue_tokens(&ctx, IssueCommand::new("alice", 5_000))
            .await
            .is_err());
        h.ledger
            .issue_tokens(&ctx, IssueCommand::new("alice", 5_000 / 10))
            .await
            .unwrap();
        assert_eq!(h.ledger.balance("alice").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn ledger_query_filters_and_pages() {
        let h = harness(SpendCapPolicy::RequireAllocation).await;
        h.citizen("alice", 3).await;
        h.citizen("bob", 4).await;
        h.citizen("carol", 5).await;

        let newest = h
            .ledger
            .ledger_entries(&LedgerQuery {
                newest_first: true,
                limit: Some(2),
                ..LedgerQuery::default()
            })
            .await;
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].to_user, "carol");

        let bob = h
            .ledger
            .ledger_entries(&LedgerQuery {
                account: Some("bob".into()),
                ..LedgerQuery::default()
            })
            .await;
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].amount, 4);
    }

    #[tokio::test]
    async fn invalid_configuration_is_refused() {
        let mut config = LedgerConfig::new(SpendCapPolicy::FlatCap { per_citizen: 0 });
        assert!(config.validate().is_err());
        config.spend_cap_policy = SpendCapPolicy::legacy_flat();
        config.idempotency_retention = Some(Duration::zero());
        assert!(config.validate().is_err());
        config.idempotency_retention = None;
        config.issuance_utc_offset_seconds = 90_000;
        assert!(CivicLedger::bootstrap(config).await.is_err());
    }

    #[tokio::test]
    async fn expired_keys_are_pruned_and_run_fresh() {
        let h = harness(SpendCapPolicy::RequireAllocation).await;
        h.citizen("alice", 0).await;
        let ctx = CallContext::new(h.gov.clone(), IdempotencyKey::new("issue-1").unwrap());
        let recent = CallContext::new(h.gov.clone(), IdempotencyKey::new("issue-2").unwrap());

        h.ledger
            .issue_tokens(&ctx, IssueCommand::new("alice", 10))
            .await
            .unwrap();
        h.clock.advance(Duration::days(29));
        h.ledger
            .issue_tokens(&recent, IssueCommand::new("alice", 1))
            .await
            .unwrap();
        h.clock.advance(Duration::days(2));

        assert_eq!(h.ledger.prune_idempotency_keys().await.unwrap(), 1);

        // The recent key still replays; the expired one now runs as new.
        h.ledger
            .issue_tokens(&recent, IssueCommand::new("alice", 1))
            .await
            .unwrap();
        h.ledger
            .issue_tokens(&ctx, IssueCommand::new("alice", 12))
            .await
            .unwrap();
        assert_eq!(h.ledger.balance("alice").await.unwrap(), 23);
    }

    #[tokio::test]
    async fn committed_batch_that_no_longer_applies_reloads_state() {
        let repository = Arc::new(MemoryRepository::new());
        let ledger = CivicLedger::with_parts(
            LedgerConfig::new(SpendCapPolicy::RequireAllocation),
            repository.clone(),
            Arc::new(NoopNotificationSink),
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        ledger
            .upsert_account(
                AccountProfile::new("gov", UserType::Government, CITY).with_daily_issuance_limit(100),
            )
            .await
            .unwrap();
        ledger
            .upsert_account(AccountProfile::new("alice", UserType::Citizen, CITY))
            .await
            .unwrap();
        ledger
            .issue_tokens(
                &CallContext::once(Actor::government("gov", CITY)),
                IssueCommand::new("alice", 4),
            )
            .await
            .unwrap();

        let stored = LedgerState::from_snapshot(repository.load().await.unwrap()).unwrap();
        let batch = {
            let mut uow = UnitOfWork::new(&stored, Utc::now());
            uow.append_entry(EntryDraft {
                transaction_type: TransactionType::Issue,
                direction: Direction::Credit,
                from_user: Some("gov".into()),
                to_user: "alice".into(),
                amount: 3,
                related_project: None,
                reference: None,
                token_type: None,
                category: None,
                city: CITY.into(),
            })
            .unwrap();
            let mut alice = uow.require_account("alice").unwrap();
            alice.token_balance += 3;
            uow.put_account(alice);
            uow.into_parts().0
        };
        repository.commit(&batch).await.unwrap();

        // A local view that missed the first issuance cannot take the batch.
        let mut drifted = LedgerState::new();
        ledger
            .settle_committed(&mut drifted, batch, "issue_tokens", "gov")
            .await
            .unwrap();
        assert_eq!(drifted.ledger().len(), 2);
        assert_eq!(drifted.account("alice").map(|a| a.token_balance), Some(7));
    }

    #[tokio::test]
    async fn notifications_follow_commit() {
        let h = harness(SpendCapPolicy::RequireAllocation).await;
        h.citizen("alice", 7).await;
        let seen = h.sink.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].recipient_id, "alice");
    }
}
