use super::{acting_account, require_text, CivicLedger};
use crate::allocation::{validate_limits, AllocationLimit, AllocationStatus};
use crate::error::LedgerError;
use crate::flow::ProjectStatus;
use crate::notify::NotificationEvent;
use crate::project::{NewProject, Project};
use crate::state::UnitOfWork;
use crate::types::{Account, AccountProfile, CallContext, UserType};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Result of approving a project: the activated project and its limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectApproval {
    pub project: Project,
    pub allocation: AllocationLimit,
}

/// Create the project's active allocation, or update it in place.
fn upsert_allocation(
    uow: &mut UnitOfWork<'_>,
    project: &Project,
    set_by: &str,
    citizen_token_limit: u64,
    project_token_limit: u64,
) -> AllocationLimit {
    let limit = match uow.active_allocation(&project.id) {
        Some(mut existing) => {
            existing.citizen_token_limit = citizen_token_limit;
            existing.project_token_limit = project_token_limit;
            existing.set_by = set_by.to_string();
            existing
        }
        None => AllocationLimit {
            id: Uuid::new_v4().to_string(),
            registration_id: project.registration_id.clone(),
            project_id: project.id.clone(),
            citizen_token_limit,
            project_token_limit,
            status: AllocationStatus::Active,
            set_by: set_by.to_string(),
            version: 0,
            created_at: uow.now(),
            updated_at: uow.now(),
        },
    };
    uow.put_allocation(limit.clone());
    uow.active_allocation(&project.id).unwrap_or(limit)
}

fn notify_reviewed(uow: &mut UnitOfWork<'_>, project: &Project) {
    uow.notify(
        project.owner_id.clone(),
        NotificationEvent::ProjectReviewed {
            project_id: project.id.clone(),
            owner_id: project.owner_id.clone(),
            status: project.status.name().to_string(),
        },
    );
}

impl CivicLedger {
    /// Mirror an identity-provider account. Never touches balances.
    pub async fn upsert_account(&self, profile: AccountProfile) -> Result<Account, LedgerError> {
        profile.validate()?;

        let account = self
            .execute_unkeyed("upsert_account", &profile.id, |uow| {
                let now = uow.now();
                let account = match uow.account(&profile.id) {
                    Some(mut existing) => {
                        if existing.user_type != profile.user_type && existing.token_balance > 0 {
                            return Err(LedgerError::Validation(format!(
                                "account '{}' holds tokens and cannot change type",
                                existing.id
                            )));
                        }
                        existing.user_type = profile.user_type;
                        existing.city = profile.city.clone();
                        existing.is_approved = profile.is_approved;
                        existing.daily_issuance_limit = profile.daily_issuance_limit;
                        existing.deleted = profile.deleted;
                        existing
                    }
                    None => Account {
                        id: profile.id.clone(),
                        user_type: profile.user_type,
                        city: profile.city.clone(),
                        is_approved: profile.is_approved,
                        token_balance: 0,
                        reserved_tokens: 0,
                        daily_issuance_limit: profile.daily_issuance_limit,
                        deleted: profile.deleted,
                        version: 0,
                        created_at: now,
                        updated_at: now,
                    },
                };
                uow.put_account(account);
                uow.require_account(&profile.id)
            })
            .await?;

        info!(
            account = %account.id,
            user_type = account.user_type.name(),
            city = %account.city,
            deleted = account.deleted,
            "Account mirrored"
        );
        Ok(account)
    }

    pub async fn register_project(
        &self,
        ctx: &CallContext,
        draft: NewProject,
    ) -> Result<Project, LedgerError> {
        draft.validate()?;
        ctx.actor.require(UserType::SocialProject)?;

        let project = self
            .execute(ctx, "register_project", serde_json::to_value(&draft)?, |uow| {
                let owner = acting_account(uow, &ctx.actor)?;
                let now = uow.now();
                let project = Project {
                    id: Uuid::new_v4().to_string(),
                    registration_id: draft.registration_id.clone(),
                    owner_id: owner.id,
                    city: owner.city,
                    title: draft.title.clone(),
                    funding_goal: draft.funding_goal,
                    tokens_funded: 0,
                    supported_by: Vec::new(),
                    status: ProjectStatus::PendingApproval,
                    version: 0,
                    created_at: now,
                    updated_at: now,
                };
                uow.put_project(project.clone());
                uow.require_project(&project.id)
            })
            .await?;

        info!(project = %project.id, owner = %project.owner_id, goal = project.funding_goal, "Project registered");
        Ok(project)
    }

    /// Activate a pending project and set its allocation in one commit.
    pub async fn approve_project(
        &self,
        ctx: &CallContext,
        project_id: &str,
        citizen_token_limit: u64,
        project_token_limit: u64,
    ) -> Result<ProjectApproval, LedgerError> {
        validate_limits(citizen_token_limit, project_token_limit)?;
        ctx.actor.require_approved_government()?;

        let command = serde_json::json!({
            "project_id": project_id,
            "citizen_token_limit": citizen_token_limit,
            "project_token_limit": project_token_limit,
        });
        let approval = self
            .execute(ctx, "approve_project", command, |uow| {
                let mut project = uow.require_project(project_id)?;
                ctx.actor.require_city(&project.city)?;
                project.status = project.status.transition(ProjectStatus::Active)?;
                uow.put_project(project.clone());

                let allocation = upsert_allocation(
                    uow,
                    &project,
                    &ctx.actor.id,
                    citizen_token_limit,
                    project_token_limit,
                );
                notify_reviewed(uow, &project);
                Ok(ProjectApproval {
                    project: uow.require_project(project_id)?,
                    allocation,
                })
            })
            .await?;

        info!(
            project = %project_id,
            government = %ctx.actor.id,
            citizen_limit = citizen_token_limit,
            project_limit = project_token_limit,
            "Project approved"
        );
        Ok(approval)
    }

    pub async fn reject_project(
        &self,
        ctx: &CallContext,
        project_id: &str,
        reason: &str,
    ) -> Result<Project, LedgerError> {
        require_text(reason, "rejection reason")?;
        ctx.actor.require_approved_government()?;

        let command = serde_json::json!({ "project_id": project_id, "reason": reason });
        let project = self
            .execute(ctx, "reject_project", command, |uow| {
                let mut project = uow.require_project(project_id)?;
                ctx.actor.require_city(&project.city)?;
                project.status = project.status.transition(ProjectStatus::Rejected)?;
                uow.put_project(project.clone());
                notify_reviewed(uow, &project);
                uow.require_project(project_id)
            })
            .await?;

        info!(project = %project_id, government = %ctx.actor.id, reason = reason, "Project rejected");
        Ok(project)
    }

    /// Pause, resume or complete a project. Allowed for its owner or a
    /// government of its city.
    pub async fn set_project_status(
        &self,
        ctx: &CallContext,
        project_id: &str,
        status: ProjectStatus,
    ) -> Result<Project, LedgerError> {
        let command = serde_json::json!({ "project_id": project_id, "status": status });
        let project = self
            .execute(ctx, "set_project_status", command, |uow| {
                let mut project = uow.require_project(project_id)?;
                let is_owner = ctx.actor.user_type == UserType::SocialProject
                    && ctx.actor.id == project.owner_id;
                if !is_owner {
                    ctx.actor.require_approved_government()?;
                    ctx.actor.require_city(&project.city)?;
                }
                if matches!(status, ProjectStatus::Active | ProjectStatus::Rejected)
                    && project.status == ProjectStatus::PendingApproval
                {
                    return Err(LedgerError::Unauthorized(
                        "pending projects are decided through approval".to_string(),
                    ));
                }
                project.status = project.status.transition(status)?;
                uow.put_project(project);
                uow.require_project(project_id)
            })
            .await?;

        info!(project = %project_id, status = project.status.name(), actor = %ctx.actor.id, "Project status changed");
        Ok(project)
    }

    /// Create or update the project's allocation.
    ///
    /// Lowering a limit below what was already spent is allowed; it only
    /// blocks further spending.
    pub async fn set_allocation_limits(
        &self,
        ctx: &CallContext,
        project_id: &str,
        citizen_token_limit: u64,
        project_token_limit: u64,
    ) -> Result<AllocationLimit, LedgerError> {
        validate_limits(citizen_token_limit, project_token_limit)?;
        ctx.actor.require_approved_government()?;

        let command = serde_json::json!({
            "project_id": project_id,
            "citizen_token_limit": citizen_token_limit,
            "project_token_limit": project_token_limit,
        });
        let limit = self
            .execute(ctx, "set_allocation_limits", command, |uow| {
                let project = uow.require_project(project_id)?;
                ctx.actor.require_city(&project.city)?;
                Ok(upsert_allocation(
                    uow,
                    &project,
                    &ctx.actor.id,
                    citizen_token_limit,
                    project_token_limit,
                ))
            })
            .await?;

        info!(
            project = %project_id,
            government = %ctx.actor.id,
            citizen_limit = limit.citizen_token_limit,
            project_limit = limit.project_token_limit,
            version = limit.version,
            "Allocation limits set"
        );
        Ok(limit)
    }

    pub async fn allocation_limits(&self, project_id: &str) -> Option<AllocationLimit> {
        let state = self.state.lock().await;
        crate::allocation::active_limit_for(state.allocations(), project_id).cloned()
    }
}
