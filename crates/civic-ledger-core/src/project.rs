use crate::error::LedgerError;
use crate::flow::ProjectStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tokens one citizen has put into one project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Supporter {
    pub user_id: String,
    pub tokens_spent: u64,
}

/// A fundable project of a social-project registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub registration_id: String,
    pub owner_id: String,
    pub city: String,
    pub title: String,
    pub funding_goal: u64,
    pub tokens_funded: u64,
    pub supported_by: Vec<Supporter>,
    pub status: ProjectStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn spent_by(&self, citizen_id: &str) -> u64 {
        self.supported_by
            .iter()
            .find(|supporter| supporter.user_id == citizen_id)
            .map(|supporter| supporter.tokens_spent)
            .unwrap_or(0)
    }

    /// Increment the citizen's support, appending a supporter on first spend.
    pub fn record_support(&mut self, citizen_id: &str, tokens: u64) {
        self.tokens_funded += tokens;
        match self
            .supported_by
            .iter_mut()
            .find(|supporter| supporter.user_id == citizen_id)
        {
            Some(existing) => existing.tokens_spent += tokens,
            None => self.supported_by.push(Supporter {
                user_id: citizen_id.to_string(),
                tokens_spent: tokens,
            }),
        }
    }

    pub fn supporters_total(&self) -> u64 {
        self.supported_by
            .iter()
            .map(|supporter| supporter.tokens_spent)
            .sum()
    }

    pub fn funding_percentage(&self) -> u64 {
        if self.funding_goal == 0 {
            return 0;
        }
        let scaled = u128::from(self.tokens_funded) * 100;
        let goal = u128::from(self.funding_goal);
        ((scaled + goal / 2) / goal) as u64
    }

    pub fn is_fully_funded(&self) -> bool {
        self.tokens_funded >= self.funding_goal
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.funding_goal.saturating_sub(self.tokens_funded)
    }

    pub fn summary(&self) -> ProjectSummary {
        ProjectSummary {
            project: self.clone(),
            funding_percentage: self.funding_percentage(),
            is_fully_funded: self.is_fully_funded(),
            remaining_tokens: self.remaining_tokens(),
        }
    }
}

/// Project plus derived funding values; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    #[serde(flatten)]
    pub project: Project,
    pub funding_percentage: u64,
    pub is_fully_funded: bool,
    pub remaining_tokens: u64,
}

/// Registration input from a project owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProject {
    pub registration_id: String,
    pub title: String,
    pub funding_goal: u64,
}

impl NewProject {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.registration_id.trim().is_empty() {
            return Err(LedgerError::Validation(
                "registration id is required".to_string(),
            ));
        }
        if self.title.trim().is_empty() {
            return Err(LedgerError::Validation("project title is required".to_string()));
        }
        if self.funding_goal == 0 {
            return Err(LedgerError::Validation(
                "funding goal must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(goal: u64) -> Project {
        Project {
            id: "p-1".into(),
            registration_id: "r-1".into(),
            owner_id: "owner".into(),
            city: "lagos".into(),
            title: "Community garden".into(),
            funding_goal: goal,
            tokens_funded: 0,
            supported_by: Vec::new(),
            status: ProjectStatus::Active,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn support_upserts_one_entry_per_citizen() {
        let mut p = project(100);
        p.record_support("alice", 3);
        p.record_support("bob", 2);
        p.record_support("alice", 1);

        assert_eq!(p.supported_by.len(), 2);
        assert_eq!(p.spent_by("alice"), 4);
        assert_eq!(p.tokens_funded, p.supporters_total());
    }

    #[test]
    fn percentage_rounds_to_nearest() {
        let mut p = project(3);
        p.record_support("alice", 1);
        assert_eq!(p.funding_percentage(), 33);
        p.record_support("bob", 1);
        assert_eq!(p.funding_percentage(), 67);
    }

    #[test]
    fn fully_funded_at_goal() {
        let mut p = project(100);
        p.record_support("alice", 100);
        assert!(p.is_fully_funded());
        assert_eq!(p.remaining_tokens(), 0);
        assert_eq!(p.funding_percentage(), 100);
    }
}
