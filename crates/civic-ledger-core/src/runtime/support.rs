use super::{acting_account, CivicLedger};
use crate::error::LedgerError;
use crate::ledger::{Direction, EntryDraft, LedgerEntry, TransactionType};
use crate::notify::NotificationEvent;
use crate::policy::check_support;
use crate::project::ProjectSummary;
use crate::types::{CallContext, UserType};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Outcome of a successful support call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportReceipt {
    pub entry: LedgerEntry,
    pub project: ProjectSummary,
}

impl CivicLedger {
    /// Spend a citizen's tokens on a project, crediting the project owner.
    ///
    /// Every check runs against state read inside the critical section, and
    /// the entry, both balances and the funding counters commit together.
    pub async fn support_project(
        &self,
        ctx: &CallContext,
        project_id: &str,
        tokens: u64,
    ) -> Result<SupportReceipt, LedgerError> {
        if tokens == 0 {
            return Err(LedgerError::Validation(
                "tokens to spend must be positive".to_string(),
            ));
        }
        ctx.actor.require(UserType::Citizen)?;

        let policy = self.config.spend_cap_policy;
        let command = serde_json::json!({ "project_id": project_id, "tokens": tokens });
        let receipt = self
            .execute(ctx, "support_project", command, |uow| {
                let mut citizen = acting_account(uow, &ctx.actor)?;
                let available = citizen.available_tokens();
                if available < tokens {
                    return Err(LedgerError::InsufficientBalance {
                        available,
                        requested: tokens,
                    });
                }

                let mut project = uow.require_project(project_id)?;
                ctx.actor.require_city(&project.city)?;
                if project.owner_id == citizen.id {
                    return Err(LedgerError::Unauthorized(format!(
                        "account '{}' owns project '{}' and cannot support it",
                        citizen.id, project.id
                    )));
                }
                let allocation = uow.active_allocation(&project.id);
                check_support(
                    policy,
                    available,
                    &project,
                    allocation.as_ref(),
                    &citizen.id,
                    tokens,
                )?;

                let mut owner = uow.require_account(&project.owner_id)?;
                let entry = uow.append_entry(EntryDraft {
                    transaction_type: TransactionType::Spend,
                    direction: Direction::Debit,
                    from_user: Some(citizen.id.clone()),
                    to_user: owner.id.clone(),
                    amount: tokens,
                    related_project: Some(project.id.clone()),
                    reference: None,
                    token_type: None,
                    category: None,
                    city: project.city.clone(),
                })?;

                let was_funded = project.is_fully_funded();
                citizen.token_balance -= tokens;
                owner.token_balance += tokens;
                project.record_support(&citizen.id, tokens);

                uow.notify(
                    owner.id.clone(),
                    NotificationEvent::ProjectSupported {
                        citizen_id: citizen.id.clone(),
                        project_id: project.id.clone(),
                        tokens,
                        entry_id: entry.entry_id.clone(),
                    },
                );
                if !was_funded && project.is_fully_funded() {
                    uow.notify(
                        owner.id.clone(),
                        NotificationEvent::ProjectFullyFunded {
                            project_id: project.id.clone(),
                            owner_id: owner.id.clone(),
                        },
                    );
                }

                uow.put_account(citizen);
                uow.put_account(owner);
                uow.put_project(project);
                Ok(SupportReceipt {
                    entry,
                    project: uow.require_project(project_id)?.summary(),
                })
            })
            .await?;

        info!(
            citizen = %ctx.actor.id,
            project = %project_id,
            tokens,
            funded = receipt.project.project.tokens_funded,
            percentage = receipt.project.funding_percentage,
            "Project supported"
        );
        Ok(receipt)
    }
}
