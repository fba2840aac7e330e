//! Closed state machines for conversions, request reviews and projects.
//!
//! Each machine is a transition table; anything not listed is rejected with
//! `LedgerError::InvalidTransition` before state is touched.

use crate::error::LedgerError;
use serde::{Deserialize, Serialize};

/// Token-to-fiat conversion lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    Pending,
    ApprovedByGovernment,
    Paid,
    Rejected,
    Cancelled,
}

impl ConversionStatus {
    const TRANSITIONS: &'static [(ConversionStatus, ConversionStatus)] = &[
        (Self::Pending, Self::ApprovedByGovernment),
        (Self::Pending, Self::Rejected),
        (Self::ApprovedByGovernment, Self::Paid),
        (Self::ApprovedByGovernment, Self::Rejected),
        (Self::ApprovedByGovernment, Self::Cancelled),
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ApprovedByGovernment => "approved_by_government",
            Self::Paid => "paid",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Rejected | Self::Cancelled)
    }

    /// Escrow is held while the request can still reach `Paid`.
    pub fn holds_escrow(self) -> bool {
        matches!(self, Self::Pending | Self::ApprovedByGovernment)
    }

    pub fn can_transition(self, next: Self) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    pub fn transition(self, next: Self) -> Result<Self, LedgerError> {
        if !self.can_transition(next) {
            return Err(LedgerError::invalid_transition(
                "conversion",
                self.name(),
                next.name(),
            ));
        }
        Ok(next)
    }
}

/// Review lifecycle shared by claims, token requests and fund requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    UnderReview,
    Approved,
    Rejected,
}

impl ReviewStatus {
    const TRANSITIONS: &'static [(ReviewStatus, ReviewStatus)] = &[
        (Self::Pending, Self::UnderReview),
        (Self::Pending, Self::Approved),
        (Self::Pending, Self::Rejected),
        (Self::UnderReview, Self::Approved),
        (Self::UnderReview, Self::Rejected),
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_decided(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    pub fn can_transition(self, next: Self) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    pub fn transition(self, next: Self) -> Result<Self, LedgerError> {
        if !self.can_transition(next) {
            return Err(LedgerError::invalid_transition(
                "review",
                self.name(),
                next.name(),
            ));
        }
        Ok(next)
    }
}

/// Social project lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    PendingApproval,
    Active,
    Inactive,
    Completed,
    Rejected,
}

impl ProjectStatus {
    const TRANSITIONS: &'static [(ProjectStatus, ProjectStatus)] = &[
        (Self::PendingApproval, Self::Active),
        (Self::PendingApproval, Self::Rejected),
        (Self::Active, Self::Inactive),
        (Self::Active, Self::Completed),
        (Self::Inactive, Self::Active),
        (Self::Inactive, Self::Completed),
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending_approval" => Some(Self::PendingApproval),
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "completed" => Some(Self::Completed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn transition(self, next: Self) -> Result<Self, LedgerError> {
        if !Self::TRANSITIONS.contains(&(self, next)) {
            return Err(LedgerError::invalid_transition(
                "project",
                self.name(),
                next.name(),
            ));
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_cannot_skip_approval() {
        let err = ConversionStatus::Pending
            .transition(ConversionStatus::Paid)
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("'pending' -> 'paid'"));
    }

    #[test]
    fn paid_is_terminal() {
        for next in [
            ConversionStatus::Pending,
            ConversionStatus::ApprovedByGovernment,
            ConversionStatus::Rejected,
            ConversionStatus::Cancelled,
            ConversionStatus::Paid,
        ] {
            assert!(!ConversionStatus::Paid.can_transition(next));
        }
    }

    #[test]
    fn conversion_happy_path() {
        let approved = ConversionStatus::Pending
            .transition(ConversionStatus::ApprovedByGovernment)
            .unwrap();
        assert_eq!(
            approved.transition(ConversionStatus::Paid).unwrap(),
            ConversionStatus::Paid
        );
    }

    #[test]
    fn pending_conversion_cannot_be_cancelled() {
        assert!(ConversionStatus::Pending
            .transition(ConversionStatus::Cancelled)
            .is_err());
    }

    #[test]
    fn review_decides_once() {
        let approved = ReviewStatus::UnderReview
            .transition(ReviewStatus::Approved)
            .unwrap();
        assert!(approved.transition(ReviewStatus::Approved).is_err());
        assert!(approved.transition(ReviewStatus::Rejected).is_err());
    }

    #[test]
    fn rejected_project_stays_rejected() {
        assert!(ProjectStatus::Rejected
            .transition(ProjectStatus::Active)
            .is_err());
    }
}
