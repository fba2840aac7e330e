use crate::allocation::AllocationLimit;
use crate::error::LedgerError;
use crate::flow::ProjectStatus;
use crate::project::Project;
use serde::{Deserialize, Serialize};

/// Legacy flat per-citizen-per-project cap.
pub const LEGACY_FLAT_CITIZEN_CAP: u64 = 5;

/// How per-citizen and per-project spend caps are resolved.
///
/// Deployments have historically used both a government-configured
/// allocation and a hardcoded flat cap. Neither is canonical, so the policy
/// has to be chosen explicitly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpendCapPolicy {
    /// Spending needs an active allocation limit on the project.
    RequireAllocation,
    /// Ignore allocations: flat per-citizen cap, funding goal as project cap.
    FlatCap { per_citizen: u64 },
    /// Use the allocation when present, otherwise the flat cap.
    AllocationOrFlat { fallback_per_citizen: u64 },
}

impl SpendCapPolicy {
    pub fn legacy_flat() -> Self {
        Self::FlatCap {
            per_citizen: LEGACY_FLAT_CITIZEN_CAP,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::RequireAllocation => "require_allocation",
            Self::FlatCap { .. } => "flat_cap",
            Self::AllocationOrFlat { .. } => "allocation_or_flat",
        }
    }
}

/// Whether conversion requests hold their tokens until payout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversionEscrow {
    /// Reserve the tokens at request time; released on reject/cancel.
    #[default]
    Reserve,
    /// Only check eligibility at request time and re-check at payout.
    RecheckOnly,
}

/// Caps in force for one support call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendCaps {
    pub per_citizen: u64,
    pub per_project: u64,
}

impl SpendCaps {
    /// An allocation can never raise the project cap above the funding goal.
    fn from_allocation(project: &Project, limit: &AllocationLimit) -> Self {
        Self {
            per_citizen: limit.citizen_token_limit,
            per_project: limit.project_token_limit.min(project.funding_goal),
        }
    }

    fn flat(project: &Project, per_citizen: u64) -> Self {
        Self {
            per_citizen,
            per_project: project.funding_goal,
        }
    }
}

/// Validate a support call against current state.
///
/// Checks run in fixed order and the first failure wins: balance, project
/// status and allocation, per-citizen cap, per-project cap. Amounts are never
/// truncated to what is left.
pub fn check_support(
    policy: SpendCapPolicy,
    available_balance: u64,
    project: &Project,
    allocation: Option<&AllocationLimit>,
    citizen_id: &str,
    tokens: u64,
) -> Result<SpendCaps, LedgerError> {
    if available_balance < tokens {
        return Err(LedgerError::InsufficientBalance {
            available: available_balance,
            requested: tokens,
        });
    }

    if project.status != ProjectStatus::Active {
        return Err(LedgerError::ProjectNotActive {
            project_id: project.id.clone(),
            status: project.status.name().to_string(),
        });
    }

    let caps = match (policy, allocation) {
        (SpendCapPolicy::RequireAllocation, Some(limit)) => {
            SpendCaps::from_allocation(project, limit)
        }
        (SpendCapPolicy::RequireAllocation, None) => {
            return Err(LedgerError::AllocationNotConfigured(project.id.clone()))
        }
        (SpendCapPolicy::FlatCap { per_citizen }, _) => SpendCaps::flat(project, per_citizen),
        (SpendCapPolicy::AllocationOrFlat { .. }, Some(limit)) => {
            SpendCaps::from_allocation(project, limit)
        }
        (
            SpendCapPolicy::AllocationOrFlat {
                fallback_per_citizen,
            },
            None,
        ) => SpendCaps::flat(project, fallback_per_citizen),
    };

    let spent = project.spent_by(citizen_id);
    if spent.saturating_add(tokens) > caps.per_citizen {
        return Err(LedgerError::PerCitizenLimitExceeded {
            spent,
            requested: tokens,
            limit: caps.per_citizen,
        });
    }

    if project.tokens_funded.saturating_add(tokens) > caps.per_project {
        return Err(LedgerError::ProjectLimitExceeded {
            funded: project.tokens_funded,
            requested: tokens,
            limit: caps.per_project,
            remaining: caps.per_project.saturating_sub(project.tokens_funded),
        });
    }

    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationStatus;
    use chrono::Utc;

    fn project(goal: u64, funded: u64) -> Project {
        let mut p = Project {
            id: "p".into(),
            registration_id: "r".into(),
            owner_id: "owner".into(),
            city: "lagos".into(),
            title: "Clinic".into(),
            funding_goal: goal,
            tokens_funded: 0,
            supported_by: Vec::new(),
            status: ProjectStatus::Active,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        if funded > 0 {
            p.record_support("someone-else", funded);
        }
        p
    }

    fn limit(citizen: u64, project: u64) -> AllocationLimit {
        AllocationLimit {
            id: "a".into(),
            registration_id: "r".into(),
            project_id: "p".into(),
            citizen_token_limit: citizen,
            project_token_limit: project,
            status: AllocationStatus::Active,
            set_by: "gov".into(),
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn balance_is_checked_before_everything_else() {
        let mut p = project(100, 0);
        p.status = ProjectStatus::Inactive;
        let err = check_support(SpendCapPolicy::RequireAllocation, 1, &p, None, "c", 5).unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    }

    #[test]
    fn require_allocation_refuses_unconfigured_project() {
        let p = project(100, 0);
        let err = check_support(SpendCapPolicy::RequireAllocation, 10, &p, None, "c", 1).unwrap_err();
        assert_eq!(err.code(), "ALLOCATION_NOT_CONFIGURED");
    }

    #[test]
    fn flat_policy_ignores_allocation() {
        let p = project(100, 0);
        let l = limit(50, 100);
        let err = check_support(SpendCapPolicy::legacy_flat(), 10, &p, Some(&l), "c", 6).unwrap_err();
        assert_eq!(err.code(), "PER_CITIZEN_LIMIT_EXCEEDED");
    }

    #[test]
    fn fallback_uses_flat_cap_without_allocation() {
        let p = project(100, 0);
        let policy = SpendCapPolicy::AllocationOrFlat {
            fallback_per_citizen: 5,
        };
        assert!(check_support(policy, 10, &p, None, "c", 5).is_ok());
        let l = limit(8, 100);
        assert_eq!(
            check_support(policy, 10, &p, Some(&l), "c", 8).unwrap().per_citizen,
            8
        );
    }

    #[test]
    fn project_cap_reports_remaining_tokens() {
        let p = project(100, 98);
        let l = limit(10, 100);
        match check_support(SpendCapPolicy::RequireAllocation, 10, &p, Some(&l), "c", 5) {
            Err(LedgerError::ProjectLimitExceeded { remaining, .. }) => assert_eq!(remaining, 2),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(check_support(SpendCapPolicy::RequireAllocation, 10, &p, Some(&l), "c", 2).is_ok());
    }

    #[test]
    fn allocation_cannot_exceed_funding_goal() {
        let p = project(20, 0);
        let l = limit(50, 500);
        let caps = check_support(SpendCapPolicy::RequireAllocation, 100, &p, Some(&l), "c", 1).unwrap();
        assert_eq!(caps.per_project, 20);
    }
}
