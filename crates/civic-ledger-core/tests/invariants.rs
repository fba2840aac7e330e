//! Property tests: random interleavings of ledger operations never break
//! balance, cap or issuance invariants.

use chrono::{Duration, TimeZone, Utc};
use civic_ledger_core::{
    AccountProfile, Actor, BankDetails, CallContext, CivicLedger, ConversionDraft,
    ConversionEscrow, IssueCommand, LedgerConfig, LedgerQuery, ManualClock, MemoryRepository,
    NewProject, NoopNotificationSink, PayoutConfirmation, SpendCapPolicy, TransactionType,
    UserType,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

const CITY: &str = "lagos";
const DAILY_LIMIT: u64 = 600;
const CITIZENS: [&str; 3] = ["alice", "bob", "carol"];
const OWNERS: [&str; 2] = ["lights", "water"];

#[derive(Debug, Clone)]
enum Op {
    Issue { citizen: usize, amount: u64 },
    Support { citizen: usize, project: usize, tokens: u64 },
    RequestConversion { project: usize, tokens: u64 },
    Approve { conversion: usize },
    Pay { conversion: usize },
    Reject { conversion: usize },
    Cancel { conversion: usize },
    AdvanceHours(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..CITIZENS.len(), 1u64..250).prop_map(|(citizen, amount)| Op::Issue { citizen, amount }),
        4 => (0..CITIZENS.len(), 0..OWNERS.len(), 1u64..12)
            .prop_map(|(citizen, project, tokens)| Op::Support { citizen, project, tokens }),
        2 => (0..OWNERS.len(), 1u64..30).prop_map(|(project, tokens)| Op::RequestConversion { project, tokens }),
        2 => (0usize..8).prop_map(|conversion| Op::Approve { conversion }),
        2 => (0usize..8).prop_map(|conversion| Op::Pay { conversion }),
        1 => (0usize..8).prop_map(|conversion| Op::Reject { conversion }),
        1 => (0usize..8).prop_map(|conversion| Op::Cancel { conversion }),
        1 => (1i64..20).prop_map(Op::AdvanceHours),
    ]
}

fn gov() -> Actor {
    Actor::government("gov", CITY)
}

fn bank() -> BankDetails {
    BankDetails {
        account_holder: "Project Trust".into(),
        bank_name: "First Civic".into(),
        account_number: "0011223".into(),
        routing_code: None,
    }
}

struct World {
    ledger: CivicLedger,
    clock: Arc<ManualClock>,
    projects: Vec<String>,
    conversions: Vec<String>,
}

async fn world(escrow: ConversionEscrow) -> World {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap(),
    ));
    let mut config = LedgerConfig::new(SpendCapPolicy::RequireAllocation);
    config.conversion_escrow = escrow;
    let ledger = CivicLedger::with_parts(
        config,
        Arc::new(MemoryRepository::new()),
        Arc::new(NoopNotificationSink),
        clock.clone(),
    )
    .await
    .unwrap();

    ledger
        .upsert_account(
            AccountProfile::new("gov", UserType::Government, CITY)
                .with_daily_issuance_limit(DAILY_LIMIT),
        )
        .await
        .unwrap();
    for citizen in CITIZENS {
        ledger
            .upsert_account(AccountProfile::new(citizen, UserType::Citizen, CITY))
            .await
            .unwrap();
    }

    let mut projects = Vec::new();
    for (index, owner) in OWNERS.iter().enumerate() {
        ledger
            .upsert_account(AccountProfile::new(*owner, UserType::SocialProject, CITY))
            .await
            .unwrap();
        let project = ledger
            .register_project(
                &CallContext::once(Actor::project_owner(*owner, CITY)),
                NewProject {
                    registration_id: format!("reg-{owner}"),
                    title: format!("{owner} project"),
                    funding_goal: 60,
                },
            )
            .await
            .unwrap();
        let citizen_limit = 8 + 6 * index as u64;
        ledger
            .approve_project(&CallContext::once(gov()), &project.id, citizen_limit, 40)
            .await
            .unwrap();
        projects.push(project.id);
    }

    World {
        ledger,
        clock,
        projects,
        conversions: Vec::new(),
    }
}

fn pick(ids: &[String], index: usize) -> Option<&String> {
    (!ids.is_empty()).then(|| &ids[index % ids.len()])
}

async fn apply(world: &mut World, op: &Op) {
    let ledger = &world.ledger;
    match op {
        Op::Issue { citizen, amount } => {
            let _ = ledger
                .issue_tokens(
                    &CallContext::once(gov()),
                    IssueCommand::new(CITIZENS[*citizen], *amount),
                )
                .await;
        }
        Op::Support {
            citizen,
            project,
            tokens,
        } => {
            let _ = ledger
                .support_project(
                    &CallContext::once(Actor::citizen(CITIZENS[*citizen], CITY)),
                    &world.projects[*project],
                    *tokens,
                )
                .await;
        }
        Op::RequestConversion { project, tokens } => {
            let outcome = ledger
                .request_conversion(
                    &CallContext::once(Actor::project_owner(OWNERS[*project], CITY)),
                    ConversionDraft {
                        project_id: world.projects[*project].clone(),
                        token_amount: *tokens,
                        bank_details: bank(),
                    },
                )
                .await;
            if let Ok(conversion) = outcome {
                world.conversions.push(conversion.id);
            }
        }
        Op::Approve { conversion } => {
            if let Some(id) = pick(&world.conversions, *conversion) {
                let _ = ledger
                    .approve_conversion(&CallContext::once(gov()), id, None)
                    .await;
            }
        }
        Op::Pay { conversion } => {
            if let Some(id) = pick(&world.conversions, *conversion) {
                let _ = ledger
                    .mark_conversion_paid(
                        &CallContext::once(gov()),
                        id,
                        PayoutConfirmation {
                            transaction_id: format!("tx-{id}"),
                            payment_method: "bank_transfer".into(),
                            transfer_document: None,
                        },
                    )
                    .await;
            }
        }
        Op::Reject { conversion } => {
            if let Some(id) = pick(&world.conversions, *conversion) {
                let _ = ledger
                    .reject_conversion(&CallContext::once(gov()), id, "incomplete paperwork")
                    .await;
            }
        }
        Op::Cancel { conversion } => {
            if let Some(id) = pick(&world.conversions, *conversion) {
                let _ = ledger
                    .cancel_conversion(&CallContext::once(gov()), id, "withdrawn")
                    .await;
            }
        }
        Op::AdvanceHours(hours) => world.clock.advance(Duration::hours(*hours)),
    }
}

async fn assert_caps(world: &World) {
    for project_id in &world.projects {
        let summary = world.ledger.project(project_id).await.unwrap();
        let limit = world.ledger.allocation_limits(project_id).await.unwrap();
        assert!(summary.project.tokens_funded <= limit.project_token_limit);
        assert!(summary.project.tokens_funded <= summary.project.funding_goal);
        for citizen in CITIZENS {
            assert!(summary.project.spent_by(citizen) <= limit.citizen_token_limit);
        }
    }
}

async fn assert_daily_cap(world: &World) {
    let issues = world
        .ledger
        .ledger_entries(&LedgerQuery {
            transaction_type: Some(TransactionType::Issue),
            ..LedgerQuery::default()
        })
        .await;
    let mut per_day: BTreeMap<_, u64> = BTreeMap::new();
    for entry in issues {
        *per_day.entry(entry.created_at.date_naive()).or_default() += entry.amount;
    }
    assert!(per_day.values().all(|total| *total <= DAILY_LIMIT));
}

fn run(escrow: ConversionEscrow, ops: Vec<Op>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    rt.block_on(async move {
        let mut world = world(escrow).await;
        for op in &ops {
            apply(&mut world, op).await;
            let report = world.ledger.reconcile().await;
            assert!(report.is_consistent(), "after {op:?}: {report:?}");
        }
        assert_caps(&world).await;
        assert_daily_cap(&world).await;

        for id in &world.conversions {
            let conversion = world.ledger.conversion(id).await.unwrap();
            let burns = world
                .ledger
                .ledger_entries(&LedgerQuery {
                    transaction_type: Some(TransactionType::Conversion),
                    ..LedgerQuery::default()
                })
                .await
                .into_iter()
                .filter(|entry| entry.reference.as_deref() == Some(id.as_str()))
                .count();
            assert_eq!(burns, usize::from(conversion.ledger_entry_id.is_some()));
        }
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn invariants_hold_with_escrow(ops in prop::collection::vec(op_strategy(), 1..40)) {
        run(ConversionEscrow::Reserve, ops);
    }

    #[test]
    fn invariants_hold_with_payout_recheck(ops in prop::collection::vec(op_strategy(), 1..40)) {
        run(ConversionEscrow::RecheckOnly, ops);
    }
}
