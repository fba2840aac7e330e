//! End-to-end flows over the public engine API.

use chrono::{TimeZone, Utc};
use civic_ledger_core::{
    AccountProfile, Actor, BankDetails, CallContext, CivicLedger, ConversionDraft,
    ConversionEscrow, ConversionStatus, IdempotencyKey, IssueCommand, LedgerConfig, LedgerError,
    LedgerQuery, ManualClock, MemoryRepository, NewProject, NoopNotificationSink,
    PayoutConfirmation, SpendCapPolicy, TransactionType, UserType,
};
use std::sync::Arc;

const CITY: &str = "lagos";

fn gov() -> Actor {
    Actor::government("gov", CITY)
}

async fn engine_on(config: LedgerConfig, repository: Arc<MemoryRepository>) -> CivicLedger {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap(),
    ));
    CivicLedger::with_parts(config, repository, Arc::new(NoopNotificationSink), clock)
        .await
        .unwrap()
}

async fn engine(config: LedgerConfig) -> CivicLedger {
    let ledger = engine_on(config, Arc::new(MemoryRepository::new())).await;
    ledger
        .upsert_account(
            AccountProfile::new("gov", UserType::Government, CITY).with_daily_issuance_limit(1_000),
        )
        .await
        .unwrap();
    ledger
}

async fn citizen(ledger: &CivicLedger, id: &str, tokens: u64) -> Actor {
    ledger
        .upsert_account(AccountProfile::new(id, UserType::Citizen, CITY))
        .await
        .unwrap();
    if tokens > 0 {
        ledger
            .issue_tokens(&CallContext::once(gov()), IssueCommand::new(id, tokens))
            .await
            .unwrap();
    }
    Actor::citizen(id, CITY)
}

async fn project(
    ledger: &CivicLedger,
    owner_id: &str,
    goal: u64,
    citizen_limit: u64,
    project_limit: u64,
) -> (Actor, String) {
    ledger
        .upsert_account(AccountProfile::new(owner_id, UserType::SocialProject, CITY))
        .await
        .unwrap();
    let owner = Actor::project_owner(owner_id, CITY);
    let registered = ledger
        .register_project(
            &CallContext::once(owner.clone()),
            NewProject {
                registration_id: format!("reg-{owner_id}"),
                title: "Street lighting".into(),
                funding_goal: goal,
            },
        )
        .await
        .unwrap();
    ledger
        .approve_project(
            &CallContext::once(gov()),
            &registered.id,
            citizen_limit,
            project_limit,
        )
        .await
        .unwrap();
    (owner, registered.id)
}

fn bank() -> BankDetails {
    BankDetails {
        account_holder: "Lagos Lights".into(),
        bank_name: "First Civic".into(),
        account_number: "0099881".into(),
        routing_code: None,
    }
}

fn payout(transaction_id: &str) -> PayoutConfirmation {
    PayoutConfirmation {
        transaction_id: transaction_id.into(),
        payment_method: "bank_transfer".into(),
        transfer_document: None,
    }
}

#[tokio::test]
async fn support_within_caps_then_per_citizen_refusal() {
    let ledger = engine(LedgerConfig::new(SpendCapPolicy::RequireAllocation)).await;
    let alice = citizen(&ledger, "alice", 10).await;
    let (_, project_id) = project(&ledger, "lights", 500, 5, 100).await;

    ledger
        .support_project(&CallContext::once(alice.clone()), &project_id, 5)
        .await
        .unwrap();
    assert_eq!(ledger.balance("alice").await.unwrap(), 5);
    assert_eq!(ledger.project(&project_id).await.unwrap().project.tokens_funded, 5);

    let spends = ledger
        .ledger_entries(&LedgerQuery {
            transaction_type: Some(TransactionType::Spend),
            ..LedgerQuery::default()
        })
        .await;
    assert_eq!(spends.len(), 1);
    assert_eq!(spends[0].amount, 5);

    let err = ledger
        .support_project(&CallContext::once(alice), &project_id, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::PerCitizenLimitExceeded { spent: 5, requested: 1, limit: 5 }));
    assert_eq!(ledger.balance("alice").await.unwrap(), 5);
}

#[tokio::test]
async fn daily_issuance_cap_is_inclusive() {
    let ledger = engine(LedgerConfig::new(SpendCapPolicy::RequireAllocation)).await;
    citizen(&ledger, "alice", 950).await;

    let err = ledger
        .issue_tokens(&CallContext::once(gov()), IssueCommand::new("alice", 100))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::LimitExceeded { issued_today: 950, .. }));

    ledger
        .issue_tokens(&CallContext::once(gov()), IssueCommand::new("alice", 50))
        .await
        .unwrap();
    assert_eq!(ledger.issued_today("gov").await, 1_000);
}

#[tokio::test]
async fn funding_goal_is_never_overshot() {
    let ledger = engine(LedgerConfig::new(SpendCapPolicy::RequireAllocation)).await;
    let alice = citizen(&ledger, "alice", 98).await;
    let bob = citizen(&ledger, "bob", 10).await;
    let (_, project_id) = project(&ledger, "lights", 100, 100, 100).await;
    ledger
        .support_project(&CallContext::once(alice), &project_id, 98)
        .await
        .unwrap();

    let err = ledger
        .support_project(&CallContext::once(bob.clone()), &project_id, 5)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ProjectLimitExceeded { remaining: 2, .. }));
    assert!(err.to_string().contains("only 2 tokens needed"));

    let receipt = ledger
        .support_project(&CallContext::once(bob), &project_id, 2)
        .await
        .unwrap();
    assert_eq!(receipt.project.project.tokens_funded, 100);
    assert!(receipt.project.is_fully_funded);
    assert_eq!(ledger.balance("bob").await.unwrap(), 8);
}

#[tokio::test]
async fn payout_rechecks_balance_without_escrow() {
    let mut config = LedgerConfig::new(SpendCapPolicy::RequireAllocation);
    config.conversion_escrow = ConversionEscrow::RecheckOnly;
    let ledger = engine(config).await;
    let (owner, project_id) = project(&ledger, "lights", 100, 100, 100).await;
    let alice = citizen(&ledger, "alice", 20).await;
    ledger
        .support_project(&CallContext::once(alice), &project_id, 20)
        .await
        .unwrap();
    assert_eq!(ledger.balance("lights").await.unwrap(), 20);

    let request = |amount| ConversionDraft {
        project_id: project_id.clone(),
        token_amount: amount,
        bank_details: bank(),
    };
    let big = ledger
        .request_conversion(&CallContext::once(owner.clone()), request(20))
        .await
        .unwrap();
    let small = ledger
        .request_conversion(&CallContext::once(owner), request(10))
        .await
        .unwrap();
    for id in [&big.id, &small.id] {
        ledger
            .approve_conversion(&CallContext::once(gov()), id, None)
            .await
            .unwrap();
    }

    ledger
        .mark_conversion_paid(&CallContext::once(gov()), &small.id, payout("tx-small"))
        .await
        .unwrap();
    assert_eq!(ledger.balance("lights").await.unwrap(), 10);

    let err = ledger
        .mark_conversion_paid(&CallContext::once(gov()), &big.id, payout("tx-big"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_TOKENS_AT_PAYOUT");
    let stored = ledger.conversion(&big.id).await.unwrap();
    assert_eq!(stored.status, ConversionStatus::ApprovedByGovernment);
    assert!(stored.ledger_entry_id.is_none());
    assert_eq!(ledger.balance("lights").await.unwrap(), 10);
    assert!(ledger.reconcile().await.is_consistent());
}

#[tokio::test]
async fn reserved_tokens_cannot_be_requested_twice() {
    let ledger = engine(LedgerConfig::new(SpendCapPolicy::RequireAllocation)).await;
    let (owner, project_id) = project(&ledger, "lights", 100, 100, 100).await;
    let alice = citizen(&ledger, "alice", 20).await;
    ledger
        .support_project(&CallContext::once(alice), &project_id, 20)
        .await
        .unwrap();

    ledger
        .request_conversion(
            &CallContext::once(owner.clone()),
            ConversionDraft {
                project_id: project_id.clone(),
                token_amount: 20,
                bank_details: bank(),
            },
        )
        .await
        .unwrap();
    let err = ledger
        .request_conversion(
            &CallContext::once(owner),
            ConversionDraft {
                project_id,
                token_amount: 10,
                bank_details: bank(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
}

#[tokio::test]
async fn owners_cannot_support_their_own_project() {
    let ledger = engine(LedgerConfig::new(SpendCapPolicy::RequireAllocation)).await;
    let alice = citizen(&ledger, "alice", 10).await;

    // A citizen account claiming the owner role cannot register a project.
    let err = ledger
        .register_project(
            &CallContext::once(Actor::project_owner("alice", CITY)),
            NewProject {
                registration_id: "reg-alice".into(),
                title: "Own pocket".into(),
                funding_goal: 100,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");

    // An owner account claiming the citizen role cannot spend.
    let (_, water) = project(&ledger, "water", 100, 5, 100).await;
    let err = ledger
        .support_project(&CallContext::once(Actor::citizen("water", CITY)), &water, 1)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");

    // An owner later mirrored as a citizen still cannot fund its own project.
    let (_, lights) = project(&ledger, "lights", 100, 5, 100).await;
    citizen(&ledger, "lights", 10).await;
    let err = ledger
        .support_project(&CallContext::once(Actor::citizen("lights", CITY)), &lights, 5)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");
    assert_eq!(ledger.balance("lights").await.unwrap(), 10);
    assert_eq!(ledger.project(&lights).await.unwrap().project.tokens_funded, 0);

    ledger
        .support_project(&CallContext::once(alice), &lights, 5)
        .await
        .unwrap();
    assert_eq!(ledger.balance("lights").await.unwrap(), 15);
    let report = ledger.reconcile().await;
    assert!(report.is_consistent(), "{report:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_support_respects_citizen_cap() {
    let ledger = Arc::new(engine(LedgerConfig::new(SpendCapPolicy::RequireAllocation)).await);
    let alice = citizen(&ledger, "alice", 10).await;
    let (_, project_id) = project(&ledger, "lights", 100, 5, 100).await;

    let spawn_support = |key: &str| {
        let ledger = ledger.clone();
        let project_id = project_id.clone();
        let ctx = CallContext::new(alice.clone(), IdempotencyKey::new(key).unwrap());
        tokio::spawn(async move { ledger.support_project(&ctx, &project_id, 3).await })
    };
    let (first, second) = tokio::join!(spawn_support("a"), spawn_support("b"));
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    let failure = outcomes.iter().find_map(|outcome| outcome.as_ref().err()).unwrap();
    assert_eq!(failure.code(), "PER_CITIZEN_LIMIT_EXCEEDED");
    assert_eq!(ledger.balance("alice").await.unwrap(), 7);
    assert_eq!(ledger.project(&project_id).await.unwrap().project.tokens_funded, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_spends_never_overdraw() {
    let ledger = Arc::new(engine(LedgerConfig::new(SpendCapPolicy::RequireAllocation)).await);
    let alice = citizen(&ledger, "alice", 6).await;
    let (_, first_project) = project(&ledger, "lights", 100, 10, 100).await;
    let (_, second_project) = project(&ledger, "water", 100, 10, 100).await;

    let handles: Vec<_> = [first_project, second_project]
        .into_iter()
        .map(|project_id| {
            let ledger = ledger.clone();
            let ctx = CallContext::once(alice.clone());
            tokio::spawn(async move { ledger.support_project(&ctx, &project_id, 4).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(ledger.balance("alice").await.unwrap(), 2);
    assert!(ledger.reconcile().await.is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_supporters_never_exceed_project_limit() {
    let ledger = Arc::new(engine(LedgerConfig::new(SpendCapPolicy::RequireAllocation)).await);
    let (_, project_id) = project(&ledger, "lights", 100, 5, 12).await;
    let mut supporters = Vec::new();
    for index in 0..6 {
        supporters.push(citizen(&ledger, &format!("citizen-{index}"), 10).await);
    }

    let handles: Vec<_> = supporters
        .into_iter()
        .map(|supporter| {
            let ledger = ledger.clone();
            let project_id = project_id.clone();
            tokio::spawn(async move {
                ledger
                    .support_project(&CallContext::once(supporter), &project_id, 3)
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut refused = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(err) => refused.push(err.code()),
        }
    }
    assert_eq!(succeeded, 4);
    assert_eq!(refused, vec!["PROJECT_LIMIT_EXCEEDED"; 2]);
    assert_eq!(ledger.project(&project_id).await.unwrap().project.tokens_funded, 12);
    assert!(ledger.reconcile().await.is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_issuance_never_exceeds_daily_limit() {
    let ledger = Arc::new(engine(LedgerConfig::new(SpendCapPolicy::RequireAllocation)).await);
    let mut recipients = Vec::new();
    for index in 0..8 {
        let id = format!("citizen-{index}");
        citizen(&ledger, &id, 0).await;
        recipients.push(id);
    }

    let handles: Vec<_> = recipients
        .into_iter()
        .map(|recipient| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .issue_tokens(&CallContext::once(gov()), IssueCommand::new(recipient, 150))
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut refused = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(err) => refused.push(err.code()),
        }
    }
    assert_eq!(succeeded, 6);
    assert_eq!(refused, vec!["LIMIT_EXCEEDED"; 2]);
    assert_eq!(ledger.issued_today("gov").await, 900);
    let issued: u64 = ledger
        .ledger_entries(&LedgerQuery {
            transaction_type: Some(TransactionType::Issue),
            ..LedgerQuery::default()
        })
        .await
        .iter()
        .map(|entry| entry.amount)
        .sum();
    assert!(issued <= 1_000);
}

#[tokio::test]
async fn replicas_on_one_repository_retry_on_conflict() {
    let repository = Arc::new(MemoryRepository::new());
    let config = LedgerConfig::new(SpendCapPolicy::RequireAllocation);
    let first = engine_on(config.clone(), repository.clone()).await;
    first
        .upsert_account(
            AccountProfile::new("gov", UserType::Government, CITY).with_daily_issuance_limit(1_000),
        )
        .await
        .unwrap();
    citizen(&first, "alice", 0).await;
    let second = engine_on(config.clone(), repository.clone()).await;

    first
        .issue_tokens(&CallContext::once(gov()), IssueCommand::new("alice", 10))
        .await
        .unwrap();
    // The second replica still holds the pre-issuance view and must reload.
    second
        .issue_tokens(&CallContext::once(gov()), IssueCommand::new("alice", 15))
        .await
        .unwrap();
    assert_eq!(second.balance("alice").await.unwrap(), 25);
    assert_eq!(second.issued_today("gov").await, 25);

    let fresh = engine_on(config, repository).await;
    assert_eq!(fresh.balance("alice").await.unwrap(), 25);
    assert!(fresh.verify_ledger_chain().await);
    assert_eq!(fresh.ledger_entries(&LedgerQuery::default()).await.len(), 2);
}

#[tokio::test]
async fn idempotent_payout_burns_once() {
    let ledger = engine(LedgerConfig::new(SpendCapPolicy::RequireAllocation)).await;
    let (owner, project_id) = project(&ledger, "lights", 100, 100, 100).await;
    let alice = citizen(&ledger, "alice", 30).await;
    ledger
        .support_project(&CallContext::once(alice), &project_id, 30)
        .await
        .unwrap();
    let conversion = ledger
        .request_conversion(
            &CallContext::once(owner),
            ConversionDraft {
                project_id,
                token_amount: 30,
                bank_details: bank(),
            },
        )
        .await
        .unwrap();
    ledger
        .approve_conversion(&CallContext::once(gov()), &conversion.id, Some("ok".into()))
        .await
        .unwrap();

    let ctx = CallContext::new(gov(), IdempotencyKey::new("payout-1").unwrap());
    let paid = ledger
        .mark_conversion_paid(&ctx, &conversion.id, payout("tx-1"))
        .await
        .unwrap();
    let replayed = ledger
        .mark_conversion_paid(&ctx, &conversion.id, payout("tx-1"))
        .await
        .unwrap();
    assert_eq!(paid, replayed);
    assert_eq!(ledger.balance("lights").await.unwrap(), 0);

    let err = ledger
        .mark_conversion_paid(&CallContext::once(gov()), &conversion.id, payout("tx-2"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");
    let burns = ledger
        .ledger_entries(&LedgerQuery {
            transaction_type: Some(TransactionType::Conversion),
            ..LedgerQuery::default()
        })
        .await;
    assert_eq!(burns.len(), 1);
    assert!(ledger.reconcile().await.is_consistent());
}
