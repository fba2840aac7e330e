use super::{acting_account, require_text, CivicLedger};
use crate::conversion::{ConversionDraft, ConversionRequest, PaymentDetails, PayoutConfirmation};
use crate::error::LedgerError;
use crate::flow::ConversionStatus;
use crate::ledger::{Direction, EntryDraft, TransactionType};
use crate::notify::NotificationEvent;
use crate::policy::ConversionEscrow;
use crate::state::UnitOfWork;
use crate::types::{CallContext, UserType};
use tracing::info;
use uuid::Uuid;

fn notify_status(uow: &mut UnitOfWork<'_>, conversion: &ConversionRequest) {
    uow.notify(
        conversion.owner_id.clone(),
        NotificationEvent::ConversionStatusChanged {
            conversion_id: conversion.id.clone(),
            owner_id: conversion.owner_id.clone(),
            status: conversion.status.name().to_string(),
        },
    );
}

/// Hand any escrowed tokens back to the owner's available balance.
fn release_escrow(uow: &mut UnitOfWork<'_>, conversion: &ConversionRequest) -> Result<(), LedgerError> {
    if conversion.escrowed_tokens == 0 {
        return Ok(());
    }
    let mut owner = uow.require_account(&conversion.owner_id)?;
    owner.reserved_tokens = owner.reserved_tokens.saturating_sub(conversion.escrowed_tokens);
    uow.put_account(owner);
    Ok(())
}

impl CivicLedger {
    /// Open a conversion for tokens the project owner currently holds.
    pub async fn request_conversion(
        &self,
        ctx: &CallContext,
        draft: ConversionDraft,
    ) -> Result<ConversionRequest, LedgerError> {
        draft.validate()?;
        ctx.actor.require(UserType::SocialProject)?;
        let fiat_amount_minor = draft
            .token_amount
            .checked_mul(self.config.fiat_minor_per_token)
            .ok_or_else(|| LedgerError::Validation("fiat amount overflows".to_string()))?;

        let escrow = self.config.conversion_escrow;
        let conversion = self
            .execute(ctx, "request_conversion", serde_json::to_value(&draft)?, |uow| {
                let mut owner = acting_account(uow, &ctx.actor)?;
                let project = uow.require_project(&draft.project_id)?;
                if project.owner_id != owner.id {
                    return Err(LedgerError::Unauthorized(format!(
                        "project '{}' is not owned by '{}'",
                        project.id, owner.id
                    )));
                }

                let available = owner.available_tokens();
                if available < draft.token_amount {
                    return Err(LedgerError::InsufficientBalance {
                        available,
                        requested: draft.token_amount,
                    });
                }

                let escrowed_tokens = match escrow {
                    ConversionEscrow::Reserve => draft.token_amount,
                    ConversionEscrow::RecheckOnly => 0,
                };
                owner.reserved_tokens += escrowed_tokens;

                let now = uow.now();
                let conversion = ConversionRequest {
                    id: Uuid::new_v4().to_string(),
                    project_id: project.id.clone(),
                    owner_id: owner.id.clone(),
                    city: project.city.clone(),
                    token_amount: draft.token_amount,
                    fiat_amount_minor,
                    escrowed_tokens,
                    status: ConversionStatus::Pending,
                    bank_details: draft.bank_details.clone(),
                    payment_details: None,
                    approval_notes: None,
                    rejection_reason: None,
                    reviewed_by: None,
                    ledger_entry_id: None,
                    version: 0,
                    created_at: now,
                    updated_at: now,
                };
                if escrowed_tokens > 0 {
                    uow.put_account(owner);
                }
                uow.put_conversion(conversion.clone());
                uow.notify(
                    conversion.owner_id.clone(),
                    NotificationEvent::ConversionRequested {
                        conversion_id: conversion.id.clone(),
                        owner_id: conversion.owner_id.clone(),
                        token_amount: conversion.token_amount,
                    },
                );
                uow.require_conversion(&conversion.id)
            })
            .await?;

        info!(
            conversion = %conversion.id,
            owner = %conversion.owner_id,
            tokens = conversion.token_amount,
            escrowed = conversion.escrowed_tokens,
            "Conversion requested"
        );
        Ok(conversion)
    }

    pub async fn approve_conversion(
        &self,
        ctx: &CallContext,
        conversion_id: &str,
        notes: Option<String>,
    ) -> Result<ConversionRequest, LedgerError> {
        ctx.actor.require_approved_government()?;

        let command = serde_json::json!({ "conversion_id": conversion_id, "notes": notes });
        let conversion = self
            .execute(ctx, "approve_conversion", command, |uow| {
                let mut conversion = uow.require_conversion(conversion_id)?;
                ctx.actor.require_city(&conversion.city)?;
                conversion.status = conversion
                    .status
                    .transition(ConversionStatus::ApprovedByGovernment)?;
                conversion.reviewed_by = Some(ctx.actor.id.clone());
                conversion.approval_notes = notes.clone();
                notify_status(uow, &conversion);
                uow.put_conversion(conversion);
                uow.require_conversion(conversion_id)
            })
            .await?;

        info!(conversion = %conversion_id, government = %ctx.actor.id, "Conversion approved");
        Ok(conversion)
    }

    pub async fn reject_conversion(
        &self,
        ctx: &CallContext,
        conversion_id: &str,
        reason: &str,
    ) -> Result<ConversionRequest, LedgerError> {
        require_text(reason, "rejection reason")?;
        ctx.actor.require_approved_government()?;

        let command = serde_json::json!({ "conversion_id": conversion_id, "reason": reason });
        let conversion = self
            .execute(ctx, "reject_conversion", command, |uow| {
                let mut conversion = uow.require_conversion(conversion_id)?;
                ctx.actor.require_city(&conversion.city)?;
                conversion.status = conversion.status.transition(ConversionStatus::Rejected)?;
                conversion.reviewed_by = Some(ctx.actor.id.clone());
                conversion.rejection_reason = Some(reason.to_string());
                release_escrow(uow, &conversion)?;
                notify_status(uow, &conversion);
                uow.put_conversion(conversion);
                uow.require_conversion(conversion_id)
            })
            .await?;

        info!(conversion = %conversion_id, government = %ctx.actor.id, reason = reason, "Conversion rejected");
        Ok(conversion)
    }

    /// Withdraw an approved conversion before payout. Allowed for the owning
    /// project or a government of its city.
    pub async fn cancel_conversion(
        &self,
        ctx: &CallContext,
        conversion_id: &str,
        reason: &str,
    ) -> Result<ConversionRequest, LedgerError> {
        require_text(reason, "cancellation reason")?;

        let command = serde_json::json!({ "conversion_id": conversion_id, "reason": reason });
        let conversion = self
            .execute(ctx, "cancel_conversion", command, |uow| {
                let mut conversion = uow.require_conversion(conversion_id)?;
                let is_owner = ctx.actor.user_type == UserType::SocialProject
                    && ctx.actor.id == conversion.owner_id;
                if !is_owner {
                    ctx.actor.require_approved_government()?;
                    ctx.actor.require_city(&conversion.city)?;
                }
                conversion.status = conversion.status.transition(ConversionStatus::Cancelled)?;
                conversion.rejection_reason = Some(reason.to_string());
                release_escrow(uow, &conversion)?;
                notify_status(uow, &conversion);
                uow.put_conversion(conversion);
                uow.require_conversion(conversion_id)
            })
            .await?;

        info!(conversion = %conversion_id, actor = %ctx.actor.id, "Conversion cancelled");
        Ok(conversion)
    }

    /// Confirm the fiat transfer and burn the owner's tokens.
    ///
    /// This is the only step that moves tokens; the balance is re-checked
    /// here in every escrow mode and a shortfall leaves the request
    /// `approved_by_government`.
    pub async fn mark_conversion_paid(
        &self,
        ctx: &CallContext,
        conversion_id: &str,
        confirmation: PayoutConfirmation,
    ) -> Result<ConversionRequest, LedgerError> {
        confirmation.validate()?;
        if let Some(document) = &confirmation.transfer_document {
            self.config.documents.validate(document)?;
        }
        ctx.actor.require_approved_government()?;

        let command = serde_json::json!({
            "conversion_id": conversion_id,
            "confirmation": confirmation,
        });
        let conversion = self
            .execute(ctx, "mark_conversion_paid", command, |uow| {
                let mut conversion = uow.require_conversion(conversion_id)?;
                ctx.actor.require_city(&conversion.city)?;
                let next = conversion.status.transition(ConversionStatus::Paid)?;

                let mut owner = uow.require_account(&conversion.owner_id)?;
                // Tokens reserved for other open conversions are off limits.
                let held_elsewhere = owner.reserved_tokens.saturating_sub(conversion.escrowed_tokens);
                let payable = owner.token_balance.saturating_sub(held_elsewhere);
                if payable < conversion.token_amount {
                    return Err(LedgerError::InsufficientTokensAtPayout {
                        balance: payable,
                        required: conversion.token_amount,
                    });
                }

                let entry = uow.append_entry(EntryDraft {
                    transaction_type: TransactionType::Conversion,
                    direction: Direction::Debit,
                    from_user: Some(owner.id.clone()),
                    to_user: owner.id.clone(),
                    amount: conversion.token_amount,
                    related_project: Some(conversion.project_id.clone()),
                    reference: Some(conversion.id.clone()),
                    token_type: None,
                    category: None,
                    city: conversion.city.clone(),
                })?;

                owner.token_balance -= conversion.token_amount;
                owner.reserved_tokens = owner.reserved_tokens.saturating_sub(conversion.escrowed_tokens);
                conversion.status = next;
                conversion.ledger_entry_id = Some(entry.entry_id.clone());
                conversion.payment_details = Some(PaymentDetails {
                    transaction_id: confirmation.transaction_id.clone(),
                    payment_method: confirmation.payment_method.clone(),
                    paid_by: ctx.actor.id.clone(),
                    paid_at: uow.now(),
                    transfer_document: confirmation.transfer_document.clone(),
                });

                notify_status(uow, &conversion);
                uow.put_account(owner);
                uow.put_conversion(conversion);
                uow.require_conversion(conversion_id)
            })
            .await?;

        info!(
            conversion = %conversion_id,
            government = %ctx.actor.id,
            tokens = conversion.token_amount,
            fiat_minor = conversion.fiat_amount_minor,
            transaction = %confirmation.transaction_id,
            "Conversion paid"
        );
        Ok(conversion)
    }
}
