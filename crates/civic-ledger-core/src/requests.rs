use crate::documents::ProofDocument;
use crate::error::LedgerError;
use crate::flow::ReviewStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Claim,
    TokenRequest,
    FundRequest,
}

impl RequestKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Claim => "token claim",
            Self::TokenRequest => "token request",
            Self::FundRequest => "fund request",
        }
    }
}

/// Government decision on a submitted request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// `amount` overrides the requested amount for token and fund requests;
    /// it may only lower it. Claims always issue the derived amount.
    Approve {
        #[serde(default)]
        amount: Option<u64>,
        #[serde(default)]
        notes: Option<String>,
    },
    Reject { reason: String },
}

impl ReviewDecision {
    pub fn approve() -> Self {
        Self::Approve {
            amount: None,
            notes: None,
        }
    }

    pub fn approve_amount(amount: u64) -> Self {
        Self::Approve {
            amount: Some(amount),
            notes: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        match self {
            Self::Approve {
                amount: Some(0), ..
            } => Err(LedgerError::Validation(
                "approved amount must be positive".to_string(),
            )),
            Self::Reject { reason } if reason.trim().is_empty() => Err(LedgerError::Validation(
                "rejection reason is required".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn target_status(&self) -> ReviewStatus {
        match self {
            Self::Approve { .. } => ReviewStatus::Approved,
            Self::Reject { .. } => ReviewStatus::Rejected,
        }
    }
}

/// Review bookkeeping shared by every request kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewState {
    pub status: ReviewStatus,
    pub reviewer_id: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    /// Set exactly once, when approval caused a ledger entry.
    pub ledger_entry_id: Option<String>,
}

impl Default for ReviewState {
    fn default() -> Self {
        Self {
            status: ReviewStatus::Pending,
            reviewer_id: None,
            reviewed_at: None,
            notes: None,
            ledger_entry_id: None,
        }
    }
}

impl ReviewState {
    /// Refuse any second decision before a mutation is attempted.
    pub fn ensure_open(&self, kind: RequestKind, id: &str) -> Result<(), LedgerError> {
        if self.status.is_decided() {
            return Err(LedgerError::AlreadyReviewed {
                kind: kind.name(),
                id: id.to_string(),
                status: self.status.name().to_string(),
            });
        }
        Ok(())
    }

    pub fn begin_review(&mut self, reviewer_id: &str) -> Result<(), LedgerError> {
        self.status = self.status.transition(ReviewStatus::UnderReview)?;
        self.reviewer_id = Some(reviewer_id.to_string());
        Ok(())
    }

    pub fn decide(
        &mut self,
        decision: &ReviewDecision,
        reviewer_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.status = self.status.transition(decision.target_status())?;
        self.reviewer_id = Some(reviewer_id.to_string());
        self.reviewed_at = Some(at);
        self.notes = match decision {
            ReviewDecision::Approve { notes, .. } => notes.clone(),
            ReviewDecision::Reject { reason } => Some(reason.clone()),
        };
        Ok(())
    }
}

/// Tokens a claim is worth: `floor(payment / rate)`.
pub fn claim_tokens(payment_amount_minor: u64, token_rate: u64) -> Result<u64, LedgerError> {
    if token_rate == 0 {
        return Err(LedgerError::Validation(
            "claim token rate must be positive".to_string(),
        ));
    }
    Ok(payment_amount_minor / token_rate)
}

/// Citizen claim for tokens earned by a civic payment (e.g. a tax receipt).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaim {
    pub id: String,
    pub citizen_id: String,
    pub city: String,
    pub payment_amount_minor: u64,
    pub token_rate: u64,
    /// Derived at submission; client input is never trusted for this.
    pub calculated_tokens: u64,
    pub proof_documents: Vec<ProofDocument>,
    pub review: ReviewState,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimSubmission {
    pub payment_amount_minor: u64,
    pub proof_documents: Vec<ProofDocument>,
}

/// Citizen request for a discretionary token grant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRequest {
    pub id: String,
    pub citizen_id: String,
    pub city: String,
    pub requested_tokens: u64,
    pub reason: String,
    pub proof_documents: Vec<ProofDocument>,
    pub approved_tokens: Option<u64>,
    pub review: ReviewState,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequestSubmission {
    pub requested_tokens: u64,
    pub reason: String,
    #[serde(default)]
    pub proof_documents: Vec<ProofDocument>,
}

impl TokenRequestSubmission {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.requested_tokens == 0 {
            return Err(LedgerError::Validation(
                "requested tokens must be positive".to_string(),
            ));
        }
        if self.reason.trim().is_empty() {
            return Err(LedgerError::Validation("request reason is required".to_string()));
        }
        Ok(())
    }
}

/// Project request for fiat support; approval moves no tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FundRequest {
    pub id: String,
    pub project_id: String,
    pub owner_id: String,
    pub city: String,
    pub requested_fiat_minor: u64,
    pub purpose: String,
    pub proof_documents: Vec<ProofDocument>,
    pub approved_fiat_minor: Option<u64>,
    pub review: ReviewState,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundRequestSubmission {
    pub project_id: String,
    pub requested_fiat_minor: u64,
    pub purpose: String,
    #[serde(default)]
    pub proof_documents: Vec<ProofDocument>,
}

impl FundRequestSubmission {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.requested_fiat_minor == 0 {
            return Err(LedgerError::Validation(
                "requested fiat amount must be positive".to_string(),
            ));
        }
        if self.purpose.trim().is_empty() {
            return Err(LedgerError::Validation("fund request purpose is required".to_string()));
        }
        Ok(())
    }
}

/// Resolve the amount granted by an approval: never above the request.
pub fn granted_amount(requested: u64, decision: &ReviewDecision) -> Result<u64, LedgerError> {
    match decision {
        ReviewDecision::Approve {
            amount: Some(amount),
            ..
        } if *amount > requested => Err(LedgerError::Validation(format!(
            "approved amount {amount} exceeds requested {requested}"
        ))),
        ReviewDecision::Approve {
            amount: Some(amount),
            ..
        } => Ok(*amount),
        _ => Ok(requested),
    }
}
