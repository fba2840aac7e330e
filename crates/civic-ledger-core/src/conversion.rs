use crate::documents::ProofDocument;
use crate::error::LedgerError;
use crate::flow::ConversionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payout destination supplied by the project owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BankDetails {
    pub account_holder: String,
    pub bank_name: String,
    pub account_number: String,
    #[serde(default)]
    pub routing_code: Option<String>,
}

impl BankDetails {
    pub fn validate(&self) -> Result<(), LedgerError> {
        for (field, value) in [
            ("account_holder", &self.account_holder),
            ("bank_name", &self.bank_name),
            ("account_number", &self.account_number),
        ] {
            if value.trim().is_empty() {
                return Err(LedgerError::Validation(format!(
                    "bank details field '{field}' is required"
                )));
            }
        }
        Ok(())
    }
}

/// Fiat transfer evidence recorded at payout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentDetails {
    pub transaction_id: String,
    pub payment_method: String,
    pub paid_by: String,
    pub paid_at: DateTime<Utc>,
    pub transfer_document: Option<ProofDocument>,
}

/// Owner input for a new conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionDraft {
    pub project_id: String,
    pub token_amount: u64,
    pub bank_details: BankDetails,
}

impl ConversionDraft {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.token_amount == 0 {
            return Err(LedgerError::Validation(
                "conversion token amount must be positive".to_string(),
            ));
        }
        self.bank_details.validate()
    }
}

/// Government input confirming the fiat transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutConfirmation {
    pub transaction_id: String,
    pub payment_method: String,
    #[serde(default)]
    pub transfer_document: Option<ProofDocument>,
}

impl PayoutConfirmation {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.transaction_id.trim().is_empty() {
            return Err(LedgerError::Validation(
                "payout transaction id is required".to_string(),
            ));
        }
        if self.payment_method.trim().is_empty() {
            return Err(LedgerError::Validation(
                "payout payment method is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Token-to-fiat conversion request.
///
/// Tokens leave the ledger exactly once, at the `paid` transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionRequest {
    pub id: String,
    pub project_id: String,
    pub owner_id: String,
    pub city: String,
    pub token_amount: u64,
    pub fiat_amount_minor: u64,
    /// Tokens reserved on the owner's account while the request is open.
    pub escrowed_tokens: u64,
    pub status: ConversionStatus,
    pub bank_details: BankDetails,
    pub payment_details: Option<PaymentDetails>,
    pub approval_notes: Option<String>,
    pub rejection_reason: Option<String>,
    pub reviewed_by: Option<String>,
    pub ledger_entry_id: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
