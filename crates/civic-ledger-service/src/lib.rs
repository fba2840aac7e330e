#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use civic_ledger_adapters::TracingNotificationSink;
use civic_ledger_core::{
    storage, Account, AccountProfile, Actor, AllocationLimit, CallContext, CivicLedger,
    ClaimSubmission, ConversionDraft, ConversionRequest, ErrorCategory, FundRequest,
    FundRequestSubmission, IdempotencyKey, IssueCommand, LedgerConfig, LedgerEntry, LedgerError,
    LedgerQuery, NewProject, PayoutConfirmation, Project, ProjectApproval, ProjectStatus,
    ProjectSummary, ReconciliationReport, RequestKind, ReviewDecision, ReviewState,
    SupportReceipt, SystemClock, TokenClaim, TokenRequest, TokenRequestSubmission,
    TransactionType, UserType,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_TYPE_HEADER: &str = "x-actor-type";
pub const ACTOR_CITY_HEADER: &str = "x-actor-city";
pub const ACTOR_APPROVED_HEADER: &str = "x-actor-approved";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub ledger: LedgerConfig,
}

#[derive(Clone)]
pub struct ServiceState {
    pub ledger: Arc<CivicLedger>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let repository = storage::bootstrap(config.ledger.ledger_storage.clone()).await?;
        let ledger = CivicLedger::with_parts(
            config.ledger,
            repository,
            Arc::new(TracingNotificationSink),
            Arc::new(SystemClock),
        )
        .await?;

        Ok(Self {
            ledger: Arc::new(ledger),
        })
    }
}

/// Periodically reconcile the ledger and expire old idempotency records.
/// Divergence is logged by the engine.
pub fn spawn_reconciliation(ledger: Arc<CivicLedger>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let report = ledger.reconcile().await;
            if report.is_consistent() {
                debug!(entries = report.entry_count, "Ledger reconciled");
            }
            if let Err(err) = ledger.prune_idempotency_keys().await {
                warn!(error = %err, "Idempotency pruning failed");
            }
        }
    })
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/accounts", post(upsert_account))
        .route("/v1/accounts/:id", get(get_account))
        .route("/v1/governments/:id/issued-today", get(issued_today))
        .route("/v1/issuances", post(issue_tokens))
        .route("/v1/projects", post(register_project).get(list_projects))
        .route("/v1/projects/:id", get(get_project))
        .route("/v1/projects/:id/approve", post(approve_project))
        .route("/v1/projects/:id/reject", post(reject_project))
        .route("/v1/projects/:id/status", post(set_project_status))
        .route(
            "/v1/projects/:id/allocation",
            get(get_allocation).put(set_allocation),
        )
        .route("/v1/projects/:id/support", post(support_project))
        .route("/v1/conversions", post(request_conversion))
        .route("/v1/conversions/:id", get(get_conversion))
        .route("/v1/conversions/:id/approve", post(approve_conversion))
        .route("/v1/conversions/:id/reject", post(reject_conversion))
        .route("/v1/conversions/:id/cancel", post(cancel_conversion))
        .route("/v1/conversions/:id/paid", post(mark_conversion_paid))
        .route("/v1/claims", post(submit_claim))
        .route("/v1/claims/:id", get(get_claim))
        .route("/v1/claims/:id/start-review", post(start_claim_review))
        .route("/v1/claims/:id/review", post(review_claim))
        .route("/v1/token-requests", post(submit_token_request))
        .route("/v1/token-requests/:id", get(get_token_request))
        .route("/v1/token-requests/:id/start-review", post(start_token_request_review))
        .route("/v1/token-requests/:id/review", post(review_token_request))
        .route("/v1/fund-requests", post(submit_fund_request))
        .route("/v1/fund-requests/:id", get(get_fund_request))
        .route("/v1/fund-requests/:id/start-review", post(start_fund_request_review))
        .route("/v1/fund-requests/:id/review", post(review_fund_request))
        .route("/v1/ledger/entries", get(list_ledger_entries))
        .route("/v1/ledger/reconciliation", get(reconciliation))
        .with_state(state)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Actor as asserted by the identity provider in front of the service.
pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let missing = |name: &str| {
        ApiError::Ledger(LedgerError::Unauthorized(format!("missing '{name}' header")))
    };
    let id = header(headers, ACTOR_ID_HEADER).ok_or_else(|| missing(ACTOR_ID_HEADER))?;
    let user_type = header(headers, ACTOR_TYPE_HEADER).ok_or_else(|| missing(ACTOR_TYPE_HEADER))?;
    let user_type = UserType::parse(user_type).ok_or_else(|| {
        ApiError::Ledger(LedgerError::Unauthorized(format!(
            "unknown actor type '{user_type}'"
        )))
    })?;
    let city = header(headers, ACTOR_CITY_HEADER).ok_or_else(|| missing(ACTOR_CITY_HEADER))?;

    let actor = Actor::new(id, user_type, city);
    match header(headers, ACTOR_APPROVED_HEADER) {
        None | Some("true") => Ok(actor),
        Some("false") => Ok(actor.unapproved()),
        Some(other) => Err(ApiError::bad_request(format!(
            "invalid '{ACTOR_APPROVED_HEADER}' value '{other}'; expected true or false"
        ))),
    }
}

/// Actor plus the mandatory idempotency key of a mutating call.
pub fn call_context(headers: &HeaderMap) -> Result<CallContext, ApiError> {
    let actor = actor_from_headers(headers)?;
    let key = header(headers, IDEMPOTENCY_KEY_HEADER).ok_or_else(|| {
        ApiError::bad_request(format!("missing '{IDEMPOTENCY_KEY_HEADER}' header"))
    })?;
    Ok(CallContext::new(actor, IdempotencyKey::new(key)?))
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("ledger bootstrap failed: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn status_for(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::Validation => StatusCode::BAD_REQUEST,
        ErrorCategory::Authorization => StatusCode::FORBIDDEN,
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::StatePrecondition | ErrorCategory::Concurrency => StatusCode::CONFLICT,
        ErrorCategory::Integrity => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => (
                status,
                Json(serde_json::json!({ "code": "BAD_REQUEST", "error": message })),
            )
                .into_response(),
            ApiError::Ledger(err) => (
                status_for(err.category()),
                Json(serde_json::json!({ "code": err.code(), "error": err.to_string() })),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    ledger_backend: &'static str,
    spend_cap_policy: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "civic-ledger-service",
        ledger_backend: state.ledger.ledger_backend(),
        spend_cap_policy: state.ledger.config().spend_cap_policy.label(),
    })
}

async fn upsert_account(
    State(state): State<ServiceState>,
    Json(profile): Json<AccountProfile>,
) -> Result<Json<Account>, ApiError> {
    Ok(Json(state.ledger.upsert_account(profile).await?))
}

async fn get_account(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Account>, ApiError> {
    Ok(Json(state.ledger.account(&id).await?))
}

#[derive(Debug, Clone, Serialize)]
struct IssuedTodayResponse {
    government_id: String,
    issued_today: u64,
    daily_issuance_limit: Option<u64>,
}

async fn issued_today(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<IssuedTodayResponse>, ApiError> {
    let account = state.ledger.account(&id).await?;
    Ok(Json(IssuedTodayResponse {
        issued_today: state.ledger.issued_today(&id).await,
        daily_issuance_limit: account.daily_issuance_limit,
        government_id: id,
    }))
}

async fn issue_tokens(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(command): Json<IssueCommand>,
) -> Result<Json<LedgerEntry>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.issue_tokens(&ctx, command).await?))
}

async fn register_project(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(draft): Json<NewProject>,
) -> Result<Json<Project>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.register_project(&ctx, draft).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct ProjectsQuery {
    city: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ProjectsResponse {
    items: Vec<ProjectSummary>,
}

async fn list_projects(
    State(state): State<ServiceState>,
    Query(query): Query<ProjectsQuery>,
) -> Json<ProjectsResponse> {
    Json(ProjectsResponse {
        items: state.ledger.projects(query.city.as_deref()).await,
    })
}

async fn get_project(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<ProjectSummary>, ApiError> {
    Ok(Json(state.ledger.project(&id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct LimitsBody {
    citizen_token_limit: u64,
    project_token_limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ReasonBody {
    reason: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusBody {
    status: ProjectStatus,
}

async fn approve_project(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(limits): Json<LimitsBody>,
) -> Result<Json<ProjectApproval>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(
        state
            .ledger
            .approve_project(&ctx, &id, limits.citizen_token_limit, limits.project_token_limit)
            .await?,
    ))
}

async fn reject_project(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<ReasonBody>,
) -> Result<Json<Project>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.reject_project(&ctx, &id, &body.reason).await?))
}

async fn set_project_status(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<StatusBody>,
) -> Result<Json<Project>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.set_project_status(&ctx, &id, body.status).await?))
}

async fn get_allocation(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<AllocationLimit>, ApiError> {
    let limit = state.ledger.allocation_limits(&id).await.ok_or_else(|| {
        ApiError::Http {
            status: StatusCode::NOT_FOUND,
            message: format!("project '{id}' has no active allocation"),
        }
    })?;
    Ok(Json(limit))
}

async fn set_allocation(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(limits): Json<LimitsBody>,
) -> Result<Json<AllocationLimit>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(
        state
            .ledger
            .set_allocation_limits(&ctx, &id, limits.citizen_token_limit, limits.project_token_limit)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct SupportBody {
    tokens: u64,
}

async fn support_project(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<SupportBody>,
) -> Result<Json<SupportReceipt>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.support_project(&ctx, &id, body.tokens).await?))
}

async fn request_conversion(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(draft): Json<ConversionDraft>,
) -> Result<Json<ConversionRequest>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.request_conversion(&ctx, draft).await?))
}

async fn get_conversion(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<ConversionRequest>, ApiError> {
    Ok(Json(state.ledger.conversion(&id).await?))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NotesBody {
    notes: Option<String>,
}

async fn approve_conversion(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Option<Json<NotesBody>>,
) -> Result<Json<ConversionRequest>, ApiError> {
    let ctx = call_context(&headers)?;
    let notes = body.map(|Json(body)| body).unwrap_or_default().notes;
    Ok(Json(state.ledger.approve_conversion(&ctx, &id, notes).await?))
}

async fn reject_conversion(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<ReasonBody>,
) -> Result<Json<ConversionRequest>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.reject_conversion(&ctx, &id, &body.reason).await?))
}

async fn cancel_conversion(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<ReasonBody>,
) -> Result<Json<ConversionRequest>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.cancel_conversion(&ctx, &id, &body.reason).await?))
}

async fn mark_conversion_paid(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(confirmation): Json<PayoutConfirmation>,
) -> Result<Json<ConversionRequest>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(
        state.ledger.mark_conversion_paid(&ctx, &id, confirmation).await?,
    ))
}

async fn submit_claim(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(submission): Json<ClaimSubmission>,
) -> Result<Json<TokenClaim>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.submit_claim(&ctx, submission).await?))
}

async fn get_claim(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<TokenClaim>, ApiError> {
    Ok(Json(state.ledger.claim(&id).await?))
}

async fn start_review(
    state: &ServiceState,
    headers: &HeaderMap,
    kind: RequestKind,
    id: &str,
) -> Result<Json<ReviewState>, ApiError> {
    let ctx = call_context(headers)?;
    Ok(Json(state.ledger.begin_review(&ctx, kind, id).await?))
}

async fn start_claim_review(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ReviewState>, ApiError> {
    start_review(&state, &headers, RequestKind::Claim, &id).await
}

async fn review_claim(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(decision): Json<ReviewDecision>,
) -> Result<Json<TokenClaim>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.review_claim(&ctx, &id, decision).await?))
}

async fn submit_token_request(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(submission): Json<TokenRequestSubmission>,
) -> Result<Json<TokenRequest>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.submit_token_request(&ctx, submission).await?))
}

async fn get_token_request(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<TokenRequest>, ApiError> {
    Ok(Json(state.ledger.token_request(&id).await?))
}

async fn start_token_request_review(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ReviewState>, ApiError> {
    start_review(&state, &headers, RequestKind::TokenRequest, &id).await
}

async fn review_token_request(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(decision): Json<ReviewDecision>,
) -> Result<Json<TokenRequest>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.review_token_request(&ctx, &id, decision).await?))
}

async fn submit_fund_request(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(submission): Json<FundRequestSubmission>,
) -> Result<Json<FundRequest>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.submit_fund_request(&ctx, submission).await?))
}

async fn get_fund_request(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<FundRequest>, ApiError> {
    Ok(Json(state.ledger.fund_request(&id).await?))
}

async fn start_fund_request_review(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ReviewState>, ApiError> {
    start_review(&state, &headers, RequestKind::FundRequest, &id).await
}

async fn review_fund_request(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(decision): Json<ReviewDecision>,
) -> Result<Json<FundRequest>, ApiError> {
    let ctx = call_context(&headers)?;
    Ok(Json(state.ledger.review_fund_request(&ctx, &id, decision).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct LedgerEntriesQuery {
    account: Option<String>,
    #[serde(rename = "type")]
    transaction_type: Option<String>,
    project: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct LedgerEntriesResponse {
    backend: &'static str,
    total: usize,
    returned: usize,
    items: Vec<LedgerEntry>,
}

fn parse_type_filter(value: Option<&str>) -> Result<Option<TransactionType>, ApiError> {
    match value.map(|value| value.to_ascii_lowercase()) {
        None => Ok(None),
        Some(value) => TransactionType::parse(&value).map(Some).ok_or_else(|| {
            ApiError::bad_request(format!(
                "invalid type '{value}'; expected one of: issue, transfer, spend, reward, penalty, refund, conversion"
            ))
        }),
    }
}

async fn list_ledger_entries(
    State(state): State<ServiceState>,
    Query(query): Query<LedgerEntriesQuery>,
) -> Result<Json<LedgerEntriesResponse>, ApiError> {
    let transaction_type = parse_type_filter(query.transaction_type.as_deref())?;

    let order = query
        .order
        .as_deref()
        .unwrap_or("desc")
        .to_ascii_lowercase();
    let newest_first = match order.as_str() {
        "desc" => true,
        "asc" => false,
        _ => {
            return Err(ApiError::bad_request(format!(
                "invalid order '{order}'; expected asc or desc"
            )))
        }
    };

    let entries = state
        .ledger
        .ledger_entries(&LedgerQuery {
            account: query.account,
            transaction_type,
            project: query.project,
            newest_first,
            offset: 0,
            limit: None,
        })
        .await;

    let total = entries.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(100).min(1000);
    let items = entries
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect::<Vec<_>>();
    let returned = items.len();

    Ok(Json(LedgerEntriesResponse {
        backend: state.ledger.ledger_backend(),
        total,
        returned,
        items,
    }))
}

async fn reconciliation(State(state): State<ServiceState>) -> Json<ReconciliationReport> {
    Json(state.ledger.reconcile().await)
}
