use super::{acting_account, CivicLedger};
use crate::clock::local_day_window;
use crate::error::LedgerError;
use crate::ledger::{Direction, EntryDraft, LedgerEntry, TransactionType};
use crate::notify::NotificationEvent;
use crate::state::UnitOfWork;
use crate::types::{Actor, CallContext, UserType};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Government instruction to mint tokens to a citizen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCommand {
    pub recipient_id: String,
    pub amount: u64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl IssueCommand {
    pub fn new(recipient_id: impl Into<String>, amount: u64) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            amount,
            token_type: None,
            category: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Issuance shared by direct issuance and request approvals.
///
/// The daily window aggregates committed entries plus anything this unit of
/// work already staged, so two approvals in one batch cannot jointly exceed
/// the cap.
pub(super) fn issue_in(
    uow: &mut UnitOfWork<'_>,
    offset: FixedOffset,
    government: &Actor,
    command: &IssueCommand,
    reference: Option<String>,
) -> Result<LedgerEntry, LedgerError> {
    let issuer = acting_account(uow, government)?;
    let limit = issuer.daily_issuance_limit.ok_or_else(|| {
        LedgerError::Unauthorized(format!(
            "government '{}' has no daily issuance limit",
            issuer.id
        ))
    })?;

    let mut recipient = match uow.account(&command.recipient_id) {
        Some(account) if account.user_type != UserType::Citizen => {
            return Err(LedgerError::InvalidRecipient {
                recipient: command.recipient_id.clone(),
                reason: format!("recipient is a {}, not a citizen", account.user_type.name()),
            })
        }
        Some(account) if !account.is_active() => {
            return Err(LedgerError::InvalidRecipient {
                recipient: command.recipient_id.clone(),
                reason: "recipient account is deleted".to_string(),
            })
        }
        Some(account) => account,
        None => {
            return Err(LedgerError::InvalidRecipient {
                recipient: command.recipient_id.clone(),
                reason: "recipient account not found".to_string(),
            })
        }
    };
    government.require_city(&recipient.city)?;

    let (day_start, day_end) = local_day_window(uow.now(), offset);
    let issued_today = uow.issued_between(&government.id, day_start, day_end);
    if issued_today.saturating_add(command.amount) > limit {
        return Err(LedgerError::LimitExceeded {
            issued_today,
            requested: command.amount,
            limit,
        });
    }

    let entry = uow.append_entry(EntryDraft {
        transaction_type: TransactionType::Issue,
        direction: Direction::Credit,
        from_user: Some(government.id.clone()),
        to_user: recipient.id.clone(),
        amount: command.amount,
        related_project: None,
        reference,
        token_type: command.token_type.clone(),
        category: command.category.clone(),
        city: recipient.city.clone(),
    })?;

    recipient.token_balance += command.amount;
    let recipient_id = recipient.id.clone();
    uow.put_account(recipient);
    uow.notify(
        recipient_id.clone(),
        NotificationEvent::TokensIssued {
            government_id: government.id.clone(),
            recipient_id,
            amount: command.amount,
            entry_id: entry.entry_id.clone(),
        },
    );
    Ok(entry)
}

impl CivicLedger {
    /// Mint tokens from an approved government to a citizen of its city.
    pub async fn issue_tokens(
        &self,
        ctx: &CallContext,
        command: IssueCommand,
    ) -> Result<LedgerEntry, LedgerError> {
        if command.amount == 0 {
            return Err(LedgerError::Validation(
                "issued amount must be positive".to_string(),
            ));
        }
        ctx.actor.require_approved_government()?;

        let offset = self.offset;
        let entry = self
            .execute(
                ctx,
                "issue_tokens",
                serde_json::to_value(&command)?,
                |uow| issue_in(uow, offset, &ctx.actor, &command, None),
            )
            .await?;

        info!(
            government = %ctx.actor.id,
            recipient = %entry.to_user,
            amount = entry.amount,
            entry = %entry.entry_id,
            "Tokens issued"
        );
        Ok(entry)
    }
}
