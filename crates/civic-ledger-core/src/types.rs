use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Actor classes known to the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Citizen,
    SocialProject,
    Government,
}

impl UserType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Citizen => "citizen",
            Self::SocialProject => "social_project",
            Self::Government => "government",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "citizen" => Some(Self::Citizen),
            "social_project" => Some(Self::SocialProject),
            "government" => Some(Self::Government),
            _ => None,
        }
    }
}

/// Already-authenticated caller supplied by the identity provider.
///
/// The ledger trusts these fields and only performs authorization on them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub user_type: UserType,
    pub city: String,
    pub is_approved: bool,
}

impl Actor {
    pub fn new(id: impl Into<String>, user_type: UserType, city: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_type,
            city: city.into(),
            is_approved: true,
        }
    }

    pub fn citizen(id: impl Into<String>, city: impl Into<String>) -> Self {
        Self::new(id, UserType::Citizen, city)
    }

    pub fn project_owner(id: impl Into<String>, city: impl Into<String>) -> Self {
        Self::new(id, UserType::SocialProject, city)
    }

    pub fn government(id: impl Into<String>, city: impl Into<String>) -> Self {
        Self::new(id, UserType::Government, city)
    }

    pub fn unapproved(mut self) -> Self {
        self.is_approved = false;
        self
    }

    pub fn require(&self, user_type: UserType) -> Result<(), LedgerError> {
        if self.user_type != user_type {
            return Err(LedgerError::Unauthorized(format!(
                "actor '{}' is a {}, operation requires a {}",
                self.id,
                self.user_type.name(),
                user_type.name()
            )));
        }
        Ok(())
    }

    /// Government actions additionally require the approval flag.
    pub fn require_approved_government(&self) -> Result<(), LedgerError> {
        self.require(UserType::Government)?;
        if !self.is_approved {
            return Err(LedgerError::Unauthorized(format!(
                "government '{}' is not approved",
                self.id
            )));
        }
        Ok(())
    }

    pub fn require_city(&self, target_city: &str) -> Result<(), LedgerError> {
        if self.city != target_city {
            return Err(LedgerError::CityMismatch {
                actor_city: self.city.clone(),
                target_city: target_city.to_string(),
            });
        }
        Ok(())
    }
}

/// Caller-supplied deduplication key for a mutating call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Result<Self, LedgerError> {
        let key = key.into();
        let trimmed = key.trim();
        if trimmed.is_empty() || trimmed.len() > 128 {
            return Err(LedgerError::Validation(
                "idempotency key must be 1..=128 non-blank characters".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request-scoped context passed explicitly into every mutating engine call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub actor: Actor,
    pub idempotency_key: IdempotencyKey,
}

impl CallContext {
    pub fn new(actor: Actor, idempotency_key: IdempotencyKey) -> Self {
        Self {
            actor,
            idempotency_key,
        }
    }

    /// Context with a fresh key, for callers that never retry.
    pub fn once(actor: Actor) -> Self {
        Self::new(actor, IdempotencyKey::random())
    }

    /// Key namespaced by actor, so two actors cannot collide.
    pub fn scoped_key(&self) -> String {
        format!("{}:{}", self.actor.id, self.idempotency_key)
    }
}

/// Account as mirrored from the identity provider, plus its balance cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub user_type: UserType,
    pub city: String,
    pub is_approved: bool,
    /// Denormalized balance; must equal the ledger projection.
    pub token_balance: u64,
    /// Tokens held in escrow by open conversion requests.
    pub reserved_tokens: u64,
    /// Only meaningful for governments.
    pub daily_issuance_limit: Option<u64>,
    pub deleted: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn available_tokens(&self) -> u64 {
        self.token_balance.saturating_sub(self.reserved_tokens)
    }

    pub fn is_active(&self) -> bool {
        !self.deleted
    }
}

/// Identity-provider view of an account; never carries a balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountProfile {
    pub id: String,
    pub user_type: UserType,
    pub city: String,
    #[serde(default = "default_true")]
    pub is_approved: bool,
    #[serde(default)]
    pub daily_issuance_limit: Option<u64>,
    #[serde(default)]
    pub deleted: bool,
}

fn default_true() -> bool {
    true
}

impl AccountProfile {
    pub fn new(id: impl Into<String>, user_type: UserType, city: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_type,
            city: city.into(),
            is_approved: true,
            daily_issuance_limit: None,
            deleted: false,
        }
    }

    pub fn with_daily_issuance_limit(mut self, limit: u64) -> Self {
        self.daily_issuance_limit = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.id.trim().is_empty() {
            return Err(LedgerError::Validation("account id is required".to_string()));
        }
        if self.city.trim().is_empty() {
            return Err(LedgerError::Validation("account city is required".to_string()));
        }
        if self.user_type == UserType::Government && self.daily_issuance_limit.is_none() {
            return Err(LedgerError::Validation(format!(
                "government account '{}' requires a daily issuance limit",
                self.id
            )));
        }
        Ok(())
    }
}
