use super::issuance::{issue_in, IssueCommand};
use super::{acting_account, request_not_found, CivicLedger};
use crate::error::LedgerError;
use crate::notify::NotificationEvent;
use crate::requests::{
    claim_tokens, granted_amount, ClaimSubmission, FundRequest, FundRequestSubmission,
    RequestKind, ReviewDecision, ReviewState, TokenClaim, TokenRequest, TokenRequestSubmission,
};
use crate::state::UnitOfWork;
use crate::types::{Actor, CallContext, UserType};
use tracing::info;
use uuid::Uuid;

fn notify_reviewed(
    uow: &mut UnitOfWork<'_>,
    kind: RequestKind,
    request_id: &str,
    requester_id: &str,
    review: &ReviewState,
) {
    uow.notify(
        requester_id.to_string(),
        NotificationEvent::RequestReviewed {
            kind: kind.name().to_string(),
            request_id: request_id.to_string(),
            requester_id: requester_id.to_string(),
            status: review.status.name().to_string(),
        },
    );
}

/// Government reviewer check shared by every review step.
fn require_reviewer(actor: &Actor, request_city: &str) -> Result<(), LedgerError> {
    actor.require_approved_government()?;
    actor.require_city(request_city)
}

impl CivicLedger {
    /// File a payment-backed claim. Tokens are derived here, never taken
    /// from the caller.
    pub async fn submit_claim(
        &self,
        ctx: &CallContext,
        submission: ClaimSubmission,
    ) -> Result<TokenClaim, LedgerError> {
        ctx.actor.require(UserType::Citizen)?;
        self.config
            .documents
            .validate_all(&submission.proof_documents, true)?;
        let token_rate = self.config.claim_token_rate;
        let calculated_tokens = claim_tokens(submission.payment_amount_minor, token_rate)?;
        if calculated_tokens == 0 {
            return Err(LedgerError::Validation(format!(
                "payment amount {} is worth less than one token at rate {}",
                submission.payment_amount_minor, token_rate
            )));
        }

        let claim = self
            .execute(ctx, "submit_claim", serde_json::to_value(&submission)?, |uow| {
                let citizen = acting_account(uow, &ctx.actor)?;
                let now = uow.now();
                let claim = TokenClaim {
                    id: Uuid::new_v4().to_string(),
                    citizen_id: citizen.id,
                    city: citizen.city,
                    payment_amount_minor: submission.payment_amount_minor,
                    token_rate,
                    calculated_tokens,
                    proof_documents: submission.proof_documents.clone(),
                    review: ReviewState::default(),
                    version: 0,
                    created_at: now,
                    updated_at: now,
                };
                let id = claim.id.clone();
                uow.put_claim(claim);
                uow.claim(&id).ok_or_else(|| request_not_found(RequestKind::Claim, &id))
            })
            .await?;

        info!(claim = %claim.id, citizen = %claim.citizen_id, tokens = claim.calculated_tokens, "Token claim submitted");
        Ok(claim)
    }

    pub async fn submit_token_request(
        &self,
        ctx: &CallContext,
        submission: TokenRequestSubmission,
    ) -> Result<TokenRequest, LedgerError> {
        submission.validate()?;
        ctx.actor.require(UserType::Citizen)?;
        self.config
            .documents
            .validate_all(&submission.proof_documents, false)?;

        let request = self
            .execute(ctx, "submit_token_request", serde_json::to_value(&submission)?, |uow| {
                let citizen = acting_account(uow, &ctx.actor)?;
                let now = uow.now();
                let request = TokenRequest {
                    id: Uuid::new_v4().to_string(),
                    citizen_id: citizen.id,
                    city: citizen.city,
                    requested_tokens: submission.requested_tokens,
                    reason: submission.reason.clone(),
                    proof_documents: submission.proof_documents.clone(),
                    approved_tokens: None,
                    review: ReviewState::default(),
                    version: 0,
                    created_at: now,
                    updated_at: now,
                };
                let id = request.id.clone();
                uow.put_token_request(request);
                uow.token_request(&id)
                    .ok_or_else(|| request_not_found(RequestKind::TokenRequest, &id))
            })
            .await?;

        info!(request = %request.id, citizen = %request.citizen_id, tokens = request.requested_tokens, "Token request submitted");
        Ok(request)
    }

    pub async fn submit_fund_request(
        &self,
        ctx: &CallContext,
        submission: FundRequestSubmission,
    ) -> Result<FundRequest, LedgerError> {
        submission.validate()?;
        ctx.actor.require(UserType::SocialProject)?;
        self.config
            .documents
            .validate_all(&submission.proof_documents, false)?;

        let request = self
            .execute(ctx, "submit_fund_request", serde_json::to_value(&submission)?, |uow| {
                let owner = acting_account(uow, &ctx.actor)?;
                let project = uow.require_project(&submission.project_id)?;
                if project.owner_id != owner.id {
                    return Err(LedgerError::Unauthorized(format!(
                        "project '{}' is not owned by '{}'",
                        project.id, owner.id
                    )));
                }
                let now = uow.now();
                let request = FundRequest {
                    id: Uuid::new_v4().to_string(),
                    project_id: project.id,
                    owner_id: owner.id,
                    city: project.city,
                    requested_fiat_minor: submission.requested_fiat_minor,
                    purpose: submission.purpose.clone(),
                    proof_documents: submission.proof_documents.clone(),
                    approved_fiat_minor: None,
                    review: ReviewState::default(),
                    version: 0,
                    created_at: now,
                    updated_at: now,
                };
                let id = request.id.clone();
                uow.put_fund_request(request);
                uow.fund_request(&id)
                    .ok_or_else(|| request_not_found(RequestKind::FundRequest, &id))
            })
            .await?;

        info!(request = %request.id, project = %request.project_id, fiat_minor = request.requested_fiat_minor, "Fund request submitted");
        Ok(request)
    }

    /// Move a pending request of any kind to `under_review`.
    pub async fn begin_review(
        &self,
        ctx: &CallContext,
        kind: RequestKind,
        request_id: &str,
    ) -> Result<ReviewState, LedgerError> {
        ctx.actor.require_approved_government()?;

        let command = serde_json::json!({ "kind": kind, "request_id": request_id });
        let review = self
            .execute(ctx, "begin_review", command, |uow| {
                let not_found = || request_not_found(kind, request_id);
                match kind {
                    RequestKind::Claim => {
                        let mut claim = uow.claim(request_id).ok_or_else(not_found)?;
                        require_reviewer(&ctx.actor, &claim.city)?;
                        claim.review.ensure_open(kind, request_id)?;
                        claim.review.begin_review(&ctx.actor.id)?;
                        let review = claim.review.clone();
                        uow.put_claim(claim);
                        Ok(review)
                    }
                    RequestKind::TokenRequest => {
                        let mut request = uow.token_request(request_id).ok_or_else(not_found)?;
                        require_reviewer(&ctx.actor, &request.city)?;
                        request.review.ensure_open(kind, request_id)?;
                        request.review.begin_review(&ctx.actor.id)?;
                        let review = request.review.clone();
                        uow.put_token_request(request);
                        Ok(review)
                    }
                    RequestKind::FundRequest => {
                        let mut request = uow.fund_request(request_id).ok_or_else(not_found)?;
                        require_reviewer(&ctx.actor, &request.city)?;
                        request.review.ensure_open(kind, request_id)?;
                        request.review.begin_review(&ctx.actor.id)?;
                        let review = request.review.clone();
                        uow.put_fund_request(request);
                        Ok(review)
                    }
                }
            })
            .await?;

        info!(kind = kind.name(), request = %request_id, government = %ctx.actor.id, "Review started");
        Ok(review)
    }

    /// Decide a claim. Approval issues the derived tokens in the same commit
    /// and links the entry to the claim.
    pub async fn review_claim(
        &self,
        ctx: &CallContext,
        claim_id: &str,
        decision: ReviewDecision,
    ) -> Result<TokenClaim, LedgerError> {
        decision.validate()?;
        ctx.actor.require_approved_government()?;

        let offset = self.offset;
        let command = serde_json::json!({ "claim_id": claim_id, "decision": decision });
        let claim = self
            .execute(ctx, "review_claim", command, |uow| {
                let kind = RequestKind::Claim;
                let mut claim = uow
                    .claim(claim_id)
                    .ok_or_else(|| request_not_found(kind, claim_id))?;
                require_reviewer(&ctx.actor, &claim.city)?;
                claim.review.ensure_open(kind, claim_id)?;

                if let ReviewDecision::Approve { amount, .. } = &decision {
                    if amount.is_some_and(|amount| amount != claim.calculated_tokens) {
                        return Err(LedgerError::Validation(format!(
                            "claims issue exactly the derived {} tokens",
                            claim.calculated_tokens
                        )));
                    }
                    let entry = issue_in(
                        uow,
                        offset,
                        &ctx.actor,
                        &IssueCommand::new(&claim.citizen_id, claim.calculated_tokens)
                            .with_category("claim"),
                        Some(claim.id.clone()),
                    )?;
                    claim.review.ledger_entry_id = Some(entry.entry_id);
                }
                claim.review.decide(&decision, &ctx.actor.id, uow.now())?;
                notify_reviewed(uow, kind, &claim.id, &claim.citizen_id, &claim.review);
                uow.put_claim(claim);
                uow.claim(claim_id)
                    .ok_or_else(|| request_not_found(kind, claim_id))
            })
            .await?;

        info!(
            claim = %claim_id,
            government = %ctx.actor.id,
            status = claim.review.status.name(),
            entry = ?claim.review.ledger_entry_id,
            "Token claim reviewed"
        );
        Ok(claim)
    }

    /// Decide a token request. An approval may grant fewer tokens than
    /// asked, never more.
    pub async fn review_token_request(
        &self,
        ctx: &CallContext,
        request_id: &str,
        decision: ReviewDecision,
    ) -> Result<TokenRequest, LedgerError> {
        decision.validate()?;
        ctx.actor.require_approved_government()?;

        let offset = self.offset;
        let command = serde_json::json!({ "request_id": request_id, "decision": decision });
        let request = self
            .execute(ctx, "review_token_request", command, |uow| {
                let kind = RequestKind::TokenRequest;
                let mut request = uow
                    .token_request(request_id)
                    .ok_or_else(|| request_not_found(kind, request_id))?;
                require_reviewer(&ctx.actor, &request.city)?;
                request.review.ensure_open(kind, request_id)?;

                if matches!(decision, ReviewDecision::Approve { .. }) {
                    let granted = granted_amount(request.requested_tokens, &decision)?;
                    let entry = issue_in(
                        uow,
                        offset,
                        &ctx.actor,
                        &IssueCommand::new(&request.citizen_id, granted).with_category("request"),
                        Some(request.id.clone()),
                    )?;
                    request.approved_tokens = Some(granted);
                    request.review.ledger_entry_id = Some(entry.entry_id);
                }
                request.review.decide(&decision, &ctx.actor.id, uow.now())?;
                notify_reviewed(uow, kind, &request.id, &request.citizen_id, &request.review);
                uow.put_token_request(request);
                uow.token_request(request_id)
                    .ok_or_else(|| request_not_found(kind, request_id))
            })
            .await?;

        info!(
            request = %request_id,
            government = %ctx.actor.id,
            status = request.review.status.name(),
            granted = ?request.approved_tokens,
            "Token request reviewed"
        );
        Ok(request)
    }

    /// Decide a fund request. Records the decision only; no tokens move.
    pub async fn review_fund_request(
        &self,
        ctx: &CallContext,
        request_id: &str,
        decision: ReviewDecision,
    ) -> Result<FundRequest, LedgerError> {
        decision.validate()?;
        ctx.actor.require_approved_government()?;

        let command = serde_json::json!({ "request_id": request_id, "decision": decision });
        let request = self
            .execute(ctx, "review_fund_request", command, |uow| {
                let kind = RequestKind::FundRequest;
                let mut request = uow
                    .fund_request(request_id)
                    .ok_or_else(|| request_not_found(kind, request_id))?;
                require_reviewer(&ctx.actor, &request.city)?;
                request.review.ensure_open(kind, request_id)?;

                if matches!(decision, ReviewDecision::Approve { .. }) {
                    request.approved_fiat_minor =
                        Some(granted_amount(request.requested_fiat_minor, &decision)?);
                }
                request.review.decide(&decision, &ctx.actor.id, uow.now())?;
                notify_reviewed(uow, kind, &request.id, &request.owner_id, &request.review);
                uow.put_fund_request(request);
                uow.fund_request(request_id)
                    .ok_or_else(|| request_not_found(kind, request_id))
            })
            .await?;

        info!(
            request = %request_id,
            government = %ctx.actor.id,
            status = request.review.status.name(),
            approved_fiat_minor = ?request.approved_fiat_minor,
            "Fund request reviewed"
        );
        Ok(request)
    }
}
