use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

pub const CITIZEN_TOKEN_LIMIT_RANGE: RangeInclusive<u64> = 1..=100;
pub const PROJECT_TOKEN_LIMIT_RANGE: RangeInclusive<u64> = 1..=1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Active,
    Inactive,
}

/// Government-configured funding ceilings for one project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocationLimit {
    pub id: String,
    pub registration_id: String,
    pub project_id: String,
    pub citizen_token_limit: u64,
    pub project_token_limit: u64,
    pub status: AllocationStatus,
    pub set_by: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AllocationLimit {
    pub fn is_active(&self) -> bool {
        self.status == AllocationStatus::Active
    }
}

/// Range checks shared by approval and later updates.
pub fn validate_limits(citizen_token_limit: u64, project_token_limit: u64) -> Result<(), LedgerError> {
    if !CITIZEN_TOKEN_LIMIT_RANGE.contains(&citizen_token_limit) {
        return Err(LedgerError::Validation(format!(
            "citizen token limit {} outside {}..={}",
            citizen_token_limit,
            CITIZEN_TOKEN_LIMIT_RANGE.start(),
            CITIZEN_TOKEN_LIMIT_RANGE.end()
        )));
    }
    if !PROJECT_TOKEN_LIMIT_RANGE.contains(&project_token_limit) {
        return Err(LedgerError::Validation(format!(
            "project token limit {} outside {}..={}",
            project_token_limit,
            PROJECT_TOKEN_LIMIT_RANGE.start(),
            PROJECT_TOKEN_LIMIT_RANGE.end()
        )));
    }
    if citizen_token_limit > project_token_limit {
        return Err(LedgerError::Validation(format!(
            "citizen token limit {} cannot exceed funding goal {}",
            citizen_token_limit, project_token_limit
        )));
    }
    Ok(())
}

/// The single active limit for a project, if any.
pub fn active_limit_for<'a>(
    limits: impl IntoIterator<Item = &'a AllocationLimit>,
    project_id: &str,
) -> Option<&'a AllocationLimit> {
    limits
        .into_iter()
        .find(|limit| limit.project_id == project_id && limit.is_active())
}
