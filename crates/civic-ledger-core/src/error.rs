use thiserror::Error;

/// Coarse classification of a ledger failure.
///
/// Callers use it to decide whether resubmitting makes sense: validation and
/// authorization failures need corrected input, state preconditions need a
/// different amount or a later retry, concurrency failures are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Authorization,
    NotFound,
    StatePrecondition,
    Concurrency,
    Integrity,
}

/// Civic ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("city mismatch: actor city '{actor_city}' cannot act on '{target_city}'")]
    CityMismatch {
        actor_city: String,
        target_city: String,
    },

    #[error("invalid recipient '{recipient}': {reason}")]
    InvalidRecipient { recipient: String, reason: String },

    #[error("account '{0}' not found")]
    AccountNotFound(String),

    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("conversion request '{0}' not found")]
    ConversionNotFound(String),

    #[error("{kind} '{id}' not found")]
    RequestNotFound { kind: &'static str, id: String },

    #[error(
        "daily issuance limit exceeded: issued {issued_today} today, requested {requested}, limit {limit}"
    )]
    LimitExceeded {
        issued_today: u64,
        requested: u64,
        limit: u64,
    },

    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: u64, requested: u64 },

    #[error("project '{project_id}' is not active (status: {status})")]
    ProjectNotActive { project_id: String, status: String },

    #[error("project '{0}' has no active allocation limit configured")]
    AllocationNotConfigured(String),

    #[error(
        "per-citizen limit exceeded: already spent {spent}, requested {requested}, limit {limit}"
    )]
    PerCitizenLimitExceeded {
        spent: u64,
        requested: u64,
        limit: u64,
    },

    #[error("would exceed funding goal, only {remaining} tokens needed (requested {requested}, limit {limit})")]
    ProjectLimitExceeded {
        funded: u64,
        requested: u64,
        limit: u64,
        remaining: u64,
    },

    #[error("invalid {machine} transition: '{from}' -> '{to}'")]
    InvalidTransition {
        machine: &'static str,
        from: String,
        to: String,
    },

    #[error("insufficient tokens at payout: balance {balance}, conversion requires {required}")]
    InsufficientTokensAtPayout { balance: u64, required: u64 },

    #[error("{kind} '{id}' was already reviewed (status: {status})")]
    AlreadyReviewed {
        kind: &'static str,
        id: String,
        status: String,
    },

    #[error("idempotency key '{key}' was already used for a different {operation} command")]
    IdempotencyKeyReused { key: String, operation: String },

    #[error("concurrent modification: commit failed after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    /// Machine-checkable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::CityMismatch { .. } => "CITY_MISMATCH",
            Self::InvalidRecipient { .. } => "INVALID_RECIPIENT",
            Self::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Self::ProjectNotFound(_) => "PROJECT_NOT_FOUND",
            Self::ConversionNotFound(_) => "CONVERSION_NOT_FOUND",
            Self::RequestNotFound { .. } => "REQUEST_NOT_FOUND",
            Self::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::ProjectNotActive { .. } => "PROJECT_NOT_ACTIVE",
            Self::AllocationNotConfigured(_) => "ALLOCATION_NOT_CONFIGURED",
            Self::PerCitizenLimitExceeded { .. } => "PER_CITIZEN_LIMIT_EXCEEDED",
            Self::ProjectLimitExceeded { .. } => "PROJECT_LIMIT_EXCEEDED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InsufficientTokensAtPayout { .. } => "INSUFFICIENT_TOKENS_AT_PAYOUT",
            Self::AlreadyReviewed { .. } => "ALREADY_REVIEWED",
            Self::IdempotencyKeyReused { .. } => "IDEMPOTENCY_KEY_REUSED",
            Self::Conflict { .. } => "CONCURRENT_MODIFICATION",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::IdempotencyKeyReused { .. } => ErrorCategory::Validation,
            Self::Unauthorized(_) | Self::CityMismatch { .. } => ErrorCategory::Authorization,
            Self::AccountNotFound(_)
            | Self::ProjectNotFound(_)
            | Self::ConversionNotFound(_)
            | Self::RequestNotFound { .. } => ErrorCategory::NotFound,
            Self::InvalidRecipient { .. }
            | Self::LimitExceeded { .. }
            | Self::InsufficientBalance { .. }
            | Self::ProjectNotActive { .. }
            | Self::AllocationNotConfigured(_)
            | Self::PerCitizenLimitExceeded { .. }
            | Self::ProjectLimitExceeded { .. }
            | Self::InvalidTransition { .. }
            | Self::InsufficientTokensAtPayout { .. }
            | Self::AlreadyReviewed { .. } => ErrorCategory::StatePrecondition,
            Self::Conflict { .. } => ErrorCategory::Concurrency,
            Self::Storage(_) | Self::Serialization(_) => ErrorCategory::Integrity,
        }
    }

    pub fn invalid_transition(
        machine: &'static str,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            machine,
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Repository failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Optimistic version check lost against another writer.
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("persisted state is corrupt: {0}")]
    Corrupt(String),
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}
