use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use arbiter_core::budget::{BudgetError, BudgetGuard};
use arbiter_core::domain::effect::payload_hash;
use arbiter_core::domain::hold::Hold;
use arbiter_core::domain::intent::{Decision, Intent, IntentScope};
use arbiter_core::engine::{DecisionEngine, EngineError};
use arbiter_core::errors::{ApplicationError, InterfaceError};
use arbiter_core::holds::{HoldError, HoldManager};
use arbiter_core::ledger::{ClaimStatus, IdempotencyLedger, LedgerError};
use arbiter_core::policy::PolicyDocument;
use arbiter_db::{BudgetAuditRepository, DbPool, HoldAuditRepository, SqlDecisionLog};

#[derive(Clone)]
pub struct AppState {
    pub policy: Arc<PolicyDocument>,
    pub engine: Arc<DecisionEngine>,
    pub holds: Arc<HoldManager>,
    pub budget: Arc<BudgetGuard>,
    pub ledger: Arc<IdempotencyLedger>,
    pub decision_log: Arc<SqlDecisionLog>,
    pub hold_audit: Arc<HoldAuditRepository>,
    pub budget_audit: Arc<BudgetAuditRepository>,
    pub db_pool: DbPool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/intents", post(submit_intent))
        .route("/v1/holds/request", post(request_hold))
        .route("/v1/holds/confirm", post(confirm_hold))
        .route("/v1/holds/release", post(release_hold))
        .route("/v1/holds/{token}", get(hold_info))
        .route("/v1/budgets/start", post(start_budget))
        .route("/v1/budgets/consume", post(consume_budget))
        .route("/v1/budgets/stop", post(stop_budget))
        .route("/v1/budgets/{session_id}", get(budget_info))
        .route("/v1/effects", post(perform_effect))
        .route("/v1/effects/commit", post(commit_effect))
        .route("/v1/effects/fail", post(fail_effect))
        .route("/v1/metrics", get(metrics))
        .with_state(state)
}

/// Wire error envelope: machine-readable reason plus the interface-layer
/// category and correlation id.
#[derive(Debug)]
pub struct ApiError {
    reason: &'static str,
    interface: InterfaceError,
}

impl ApiError {
    fn new(
        reason: &'static str,
        error: impl Into<ApplicationError>,
        correlation_id: &str,
    ) -> Self {
        Self { reason, interface: error.into().into_interface(correlation_id) }
    }

    fn not_found(reason: &'static str, message: &str, correlation_id: &str) -> Self {
        Self {
            reason,
            interface: InterfaceError::NotFound {
                message: message.to_string(),
                correlation_id: correlation_id.to_string(),
            },
        }
    }

    fn conflict(reason: &'static str, message: &str, correlation_id: &str) -> Self {
        Self {
            reason,
            interface: InterfaceError::Conflict {
                message: message.to_string(),
                correlation_id: correlation_id.to_string(),
            },
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    reason: &'static str,
    message: String,
    detail: String,
    correlation_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.interface {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            reason: self.reason,
            message: self.interface.user_message().to_string(),
            detail: self.interface.to_string(),
            correlation_id: self.interface.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn hold_api_error(error: HoldError, correlation_id: &str) -> ApiError {
    let reason = match &error {
        HoldError::InvalidTtl { .. } => "invalid_ttl",
        HoldError::NotFound(_) => "not_found",
        HoldError::Expired(_) => "hold_expired",
        HoldError::StillPending(_) => "hold_pending",
        HoldError::NotHolder(_) => "not_holder",
    };
    ApiError::new(reason, arbiter_core::errors::DomainError::from(error), correlation_id)
}

fn budget_api_error(error: BudgetError, correlation_id: &str) -> ApiError {
    let reason = match &error {
        BudgetError::InvalidCap(_) => "invalid_cap",
        BudgetError::InvalidRpm(_) => "invalid_rpm",
        BudgetError::InvalidAmount(_) => "invalid_amount",
        BudgetError::NotFound(_) => "not_found",
    };
    ApiError::new(reason, arbiter_core::errors::DomainError::from(error), correlation_id)
}

fn ledger_api_error(error: LedgerError, correlation_id: &str) -> ApiError {
    let reason = match &error {
        LedgerError::InvalidTtl(_) => "invalid_ttl",
        LedgerError::NotFound(_) => "not_found",
    };
    ApiError::new(reason, arbiter_core::errors::DomainError::from(error), correlation_id)
}

fn engine_api_error(error: EngineError, correlation_id: &str) -> ApiError {
    let reason = match &error {
        EngineError::InvalidTtl { .. } => "invalid_ttl",
        EngineError::Unavailable(_) => "unavailable",
    };
    ApiError::new(reason, error, correlation_id)
}

fn unavailable(detail: impl ToString, correlation_id: &str) -> ApiError {
    ApiError::new(
        "unavailable",
        ApplicationError::Persistence(detail.to_string()),
        correlation_id,
    )
}

#[derive(Debug, Deserialize)]
struct IntentRequest {
    #[serde(rename = "type")]
    intent_type: String,
    resource: String,
    #[serde(default = "default_intent_action")]
    action: String,
    author: String,
    scope: IntentScope,
    ttl_s: u32,
    #[serde(default)]
    meta: BTreeMap<String, String>,
}

fn default_intent_action() -> String {
    "execute".to_string()
}

async fn submit_intent(
    State(state): State<AppState>,
    Json(body): Json<IntentRequest>,
) -> Result<Json<Decision>, ApiError> {
    let correlation_id = new_correlation_id();
    let intent = Intent {
        intent_type: body.intent_type,
        resource: body.resource,
        action: body.action,
        author: body.author,
        scope: body.scope,
        ttl_s: body.ttl_s,
        meta: body.meta,
    };

    let decision = state
        .engine
        .decide(&intent)
        .await
        .map_err(|error| engine_api_error(error, &correlation_id))?;

    if let Some(token) = &decision.hold_token {
        audit_hold(&state, token, &correlation_id).await;
    }

    Ok(Json(decision))
}

#[derive(Debug, Deserialize)]
struct HoldRequestBody {
    resource: String,
    author: String,
    ttl_s: Option<u32>,
    correlation: Option<String>,
}

#[derive(Serialize)]
struct HoldResponseBody {
    token: String,
    resource: String,
    state: &'static str,
    queue_position: usize,
    deadline: String,
}

impl HoldResponseBody {
    fn from_hold(hold: &Hold, queue_position: usize) -> Self {
        Self {
            token: hold.token.0.clone(),
            resource: hold.resource.clone(),
            state: hold.state.as_str(),
            queue_position,
            deadline: hold.deadline.to_rfc3339(),
        }
    }
}

async fn request_hold(
    State(state): State<AppState>,
    Json(body): Json<HoldRequestBody>,
) -> Result<Json<HoldResponseBody>, ApiError> {
    let correlation_id = new_correlation_id();
    let ttl_s = body.ttl_s.unwrap_or(state.policy.limits.default_hold_ttl_s);

    let grant = state
        .holds
        .request(&body.resource, &body.author, ttl_s, body.correlation)
        .await
        .map_err(|error| hold_api_error(error, &correlation_id))?;

    audit_hold(&state, &grant.hold.token.0, &correlation_id).await;
    Ok(Json(HoldResponseBody::from_hold(&grant.hold, grant.queue_position)))
}

#[derive(Debug, Deserialize)]
struct HoldTokenBody {
    token: String,
}

async fn confirm_hold(
    State(state): State<AppState>,
    Json(body): Json<HoldTokenBody>,
) -> Result<Json<HoldResponseBody>, ApiError> {
    let correlation_id = new_correlation_id();
    let hold = state
        .holds
        .confirm(&body.token)
        .await
        .map_err(|error| hold_api_error(error, &correlation_id))?;

    audit_hold(&state, &hold.token.0, &correlation_id).await;
    Ok(Json(HoldResponseBody::from_hold(&hold, 0)))
}

#[derive(Serialize)]
struct OkBody {
    ok: bool,
}

async fn release_hold(
    State(state): State<AppState>,
    Json(body): Json<HoldTokenBody>,
) -> Result<Json<OkBody>, ApiError> {
    let correlation_id = new_correlation_id();
    state
        .holds
        .release(&body.token)
        .await
        .map_err(|error| hold_api_error(error, &correlation_id))?;

    audit_hold(&state, &body.token, &correlation_id).await;
    Ok(Json(OkBody { ok: true }))
}

async fn hold_info(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<Hold>, ApiError> {
    let correlation_id = new_correlation_id();
    state
        .holds
        .info(&token)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("not_found", "unknown hold token", &correlation_id))
}

#[derive(Debug, Deserialize)]
struct BudgetStartBody {
    usd_cap: f64,
    rpm: u32,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct BudgetStartResponse {
    session_id: String,
    usd_cap: f64,
    rpm: u32,
    remaining_usd: f64,
}

async fn start_budget(
    State(state): State<AppState>,
    Json(body): Json<BudgetStartBody>,
) -> Result<Json<BudgetStartResponse>, ApiError> {
    let correlation_id = new_correlation_id();
    let usd_cap = decimal_amount(body.usd_cap)
        .ok_or_else(|| budget_api_error(BudgetError::InvalidCap(Decimal::ZERO), &correlation_id))?;

    let session = state
        .budget
        .start(usd_cap, body.rpm, body.tags)
        .await
        .map_err(|error| budget_api_error(error, &correlation_id))?;

    audit_budget(&state, &session.id.0, &correlation_id).await;
    Ok(Json(BudgetStartResponse {
        session_id: session.id.0.clone(),
        usd_cap: session.usd_cap.to_f64().unwrap_or(body.usd_cap),
        rpm: session.rpm,
        remaining_usd: session.remaining_usd().to_f64().unwrap_or(0.0),
    }))
}

#[derive(Debug, Deserialize)]
struct BudgetConsumeBody {
    session_id: String,
    usd_amount: f64,
}

#[derive(Serialize)]
struct BudgetConsumeResponse {
    session_id: String,
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    spent_usd: f64,
    remaining_usd: f64,
}

async fn consume_budget(
    State(state): State<AppState>,
    Json(body): Json<BudgetConsumeBody>,
) -> Result<Json<BudgetConsumeResponse>, ApiError> {
    let correlation_id = new_correlation_id();
    let usd_amount = decimal_amount(body.usd_amount).ok_or_else(|| {
        budget_api_error(BudgetError::InvalidAmount(Decimal::ZERO), &correlation_id)
    })?;

    let outcome = state
        .budget
        .consume(&body.session_id, usd_amount)
        .await
        .map_err(|error| budget_api_error(error, &correlation_id))?;

    audit_budget(&state, &body.session_id, &correlation_id).await;
    Ok(Json(BudgetConsumeResponse {
        session_id: outcome.session_id.0,
        allowed: outcome.allowed,
        reason: outcome.reason,
        spent_usd: outcome.spent_usd.to_f64().unwrap_or(0.0),
        remaining_usd: outcome.remaining_usd.to_f64().unwrap_or(0.0),
    }))
}

#[derive(Debug, Deserialize)]
struct BudgetStopBody {
    session_id: String,
}

async fn stop_budget(
    State(state): State<AppState>,
    Json(body): Json<BudgetStopBody>,
) -> Result<Json<OkBody>, ApiError> {
    let correlation_id = new_correlation_id();
    state
        .budget
        .stop(&body.session_id)
        .await
        .map_err(|error| budget_api_error(error, &correlation_id))?;

    audit_budget(&state, &body.session_id, &correlation_id).await;
    Ok(Json(OkBody { ok: true }))
}

#[derive(Serialize)]
struct BudgetInfoResponse {
    session_id: String,
    usd_cap: f64,
    rpm: u32,
    spent_usd: f64,
    remaining_usd: f64,
    state: &'static str,
    tags: BTreeMap<String, String>,
}

async fn budget_info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<BudgetInfoResponse>, ApiError> {
    let correlation_id = new_correlation_id();
    let session = state.budget.info(&session_id).await.ok_or_else(|| {
        ApiError::not_found("not_found", "unknown budget session", &correlation_id)
    })?;

    Ok(Json(BudgetInfoResponse {
        session_id: session.id.0.clone(),
        usd_cap: session.usd_cap.to_f64().unwrap_or(0.0),
        rpm: session.rpm,
        spent_usd: session.spent_usd.to_f64().unwrap_or(0.0),
        remaining_usd: session.remaining_usd().to_f64().unwrap_or(0.0),
        state: session.state.as_str(),
        tags: session.tags,
    }))
}

#[derive(Debug, Deserialize)]
struct EffectBody {
    idempotency_key: String,
    ttl_s: u32,
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct EffectResponse {
    idempotency_key: String,
    new_execution: bool,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
}

async fn perform_effect(
    State(state): State<AppState>,
    Json(body): Json<EffectBody>,
) -> Result<Json<EffectResponse>, ApiError> {
    let correlation_id = new_correlation_id();
    let hash = payload_hash(&body.payload);

    let claim = state
        .ledger
        .claim(&body.idempotency_key, body.ttl_s, Some(hash))
        .await
        .map_err(|error| ledger_api_error(error, &correlation_id))?;

    match claim.status {
        ClaimStatus::New => Ok(Json(EffectResponse {
            idempotency_key: body.idempotency_key,
            new_execution: true,
            status: "new",
            result: None,
        })),
        ClaimStatus::Duplicate => Ok(Json(EffectResponse {
            idempotency_key: body.idempotency_key,
            new_execution: false,
            status: "duplicate",
            result: claim.record.result,
        })),
        ClaimStatus::InFlight => Err(ApiError::conflict(
            "duplicate_in_flight",
            "a concurrent execution holds this idempotency key",
            &correlation_id,
        )),
    }
}

#[derive(Debug, Deserialize)]
struct EffectCommitBody {
    idempotency_key: String,
    result: serde_json::Value,
}

async fn commit_effect(
    State(state): State<AppState>,
    Json(body): Json<EffectCommitBody>,
) -> Result<Json<OkBody>, ApiError> {
    let correlation_id = new_correlation_id();
    state
        .ledger
        .commit(&body.idempotency_key, body.result)
        .await
        .map_err(|error| ledger_api_error(error, &correlation_id))?;
    Ok(Json(OkBody { ok: true }))
}

#[derive(Debug, Deserialize)]
struct EffectFailBody {
    idempotency_key: String,
}

async fn fail_effect(
    State(state): State<AppState>,
    Json(body): Json<EffectFailBody>,
) -> Result<Json<OkBody>, ApiError> {
    let correlation_id = new_correlation_id();
    state
        .ledger
        .fail(&body.idempotency_key)
        .await
        .map_err(|error| ledger_api_error(error, &correlation_id))?;
    Ok(Json(OkBody { ok: true }))
}

#[derive(Serialize)]
struct RecentDecisionBody {
    #[serde(rename = "type")]
    intent_type: String,
    resource: String,
    action: String,
    reason: String,
    created_at: String,
}

#[derive(Serialize)]
struct MetricsResponse {
    decision_counts: BTreeMap<String, i64>,
    recent_decisions: Vec<RecentDecisionBody>,
    active_holds: usize,
    pending_holds: usize,
    active_budgets: usize,
}

async fn metrics(State(state): State<AppState>) -> Result<Json<MetricsResponse>, ApiError> {
    let correlation_id = new_correlation_id();
    let decision_metrics = state
        .decision_log
        .metrics()
        .await
        .map_err(|error| unavailable(error, &correlation_id))?;

    Ok(Json(MetricsResponse {
        decision_counts: decision_metrics.decision_counts,
        recent_decisions: decision_metrics
            .recent_decisions
            .into_iter()
            .map(|entry| RecentDecisionBody {
                intent_type: entry.intent_type,
                resource: entry.resource,
                action: entry.action,
                reason: entry.reason,
                created_at: entry.created_at.to_rfc3339(),
            })
            .collect(),
        active_holds: state.holds.active_count().await,
        pending_holds: state.holds.pending_count().await,
        active_budgets: state.budget.active_count().await,
    }))
}

fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

fn decimal_amount(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::try_from(value).ok()
}

/// Audit writes are best-effort; a storage hiccup must not fail the call
/// that already took effect in the managers.
async fn audit_hold(state: &AppState, token: &str, correlation_id: &str) {
    if let Some(hold) = state.holds.info(token).await {
        if let Err(error) = state.hold_audit.upsert(&hold).await {
            warn!(
                event_name = "system.audit.hold_upsert_failed",
                correlation_id = correlation_id,
                token = token,
                error = %error,
                "hold audit upsert failed"
            );
        }
    }
}

async fn audit_budget(state: &AppState, session_id: &str, correlation_id: &str) {
    if let Some(session) = state.budget.info(session_id).await {
        if let Err(error) = state.budget_audit.upsert(&session).await {
            warn!(
                event_name = "system.audit.budget_upsert_failed",
                correlation_id = correlation_id,
                session_id = session_id,
                error = %error,
                "budget audit upsert failed"
            );
        }
    }
}
