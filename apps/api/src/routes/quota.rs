//! Axum route handlers for the Quota API.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::AppError;
use crate::quota::evaluator::{Decision, Denial, Reservation, UsageReport};
use crate::quota::middleware::ClientOrigin;
use crate::quota::tier::{ActionKind, Subject, Tier};
use crate::state::AppState;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct QuotaRequest {
    /// Metered per account when present, per network origin otherwise.
    pub user_id: Option<Uuid>,
    pub action: ActionKind,
}

#[derive(Debug, Serialize)]
pub struct DecisionBody {
    pub action: ActionKind,
    pub tier: Tier,
    pub allowed: bool,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub retry_after_secs: Option<u64>,
    pub resets_at: Option<DateTime<Utc>>,
    pub upgrade_required: bool,
    pub denial: Option<Denial>,
}

impl From<&Decision> for DecisionBody {
    fn from(d: &Decision) -> Self {
        Self {
            action: d.action,
            tier: d.tier,
            allowed: d.allowed,
            limit: d.limit,
            remaining: d.remaining,
            retry_after_secs: d.retry_after_secs(),
            resets_at: d.resets_at,
            upgrade_required: d.is_tier_gated(),
            denial: d.denial,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReserveResponse {
    pub decision: DecisionBody,
    pub reservation: Reservation,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// Resolves who is metered and at which tier.
async fn resolve_subject(
    state: &AppState,
    user_id: Option<Uuid>,
    origin: ClientOrigin,
) -> Result<(Subject, Tier), AppError> {
    let subject = Subject::for_request(user_id, origin.0);
    let Subject::Account(user_id) = subject else {
        return Ok((subject, Tier::Free));
    };
    let account = state
        .accounts
        .find_account_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Account {user_id} not found")))?;
    if !account.is_active {
        return Err(AppError::Unauthorized);
    }
    Ok((subject, Tier::from_account_field(&account.tier)))
}

/// POST /api/v1/quota/check
///
/// Consumes one unit of the action if allowed. Denials come back as 429.
pub async fn handle_check(
    State(state): State<AppState>,
    origin: ClientOrigin,
    Json(req): Json<QuotaRequest>,
) -> Result<Json<DecisionBody>, AppError> {
    let (subject, tier) = resolve_subject(&state, req.user_id, origin).await?;
    let decision = state.quota.check(subject, req.action, tier).await?;
    if !decision.allowed {
        return Err(AppError::QuotaDenied(Box::new(decision)));
    }
    Ok(Json(DecisionBody::from(&decision)))
}

/// POST /api/v1/quota/reserve
///
/// First phase of a two-phase attempt. The returned reservation must be sent
/// to /commit when the attempt failed or /release when it succeeded.
pub async fn handle_reserve(
    State(state): State<AppState>,
    origin: ClientOrigin,
    Json(req): Json<QuotaRequest>,
) -> Result<Json<ReserveResponse>, AppError> {
    let (subject, tier) = resolve_subject(&state, req.user_id, origin).await?;
    let (decision, reservation) = state.quota.reserve(subject, req.action, tier).await?;
    match reservation {
        Some(reservation) => Ok(Json(ReserveResponse {
            decision: DecisionBody::from(&decision),
            reservation,
        })),
        None => Err(AppError::QuotaDenied(Box::new(decision))),
    }
}

/// POST /api/v1/quota/commit
pub async fn handle_commit(
    State(state): State<AppState>,
    Json(reservation): Json<Reservation>,
) -> Result<StatusCode, AppError> {
    state.quota.commit(reservation).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/quota/release
///
/// Refunds a reservation that is still outstanding. Replays, committed and
/// unknown reservations answer `{"refunded": false}`.
pub async fn handle_release(
    State(state): State<AppState>,
    Json(reservation): Json<Reservation>,
) -> Result<Json<Value>, AppError> {
    let refunded = state.quota.release(reservation).await?;
    Ok(Json(json!({ "refunded": refunded })))
}

/// POST /api/v1/quota/refund
///
/// Called after a capped resource (a resume) is deleted, so the slot can be
/// used again.
pub async fn handle_refund(
    State(state): State<AppState>,
    origin: ClientOrigin,
    Json(req): Json<QuotaRequest>,
) -> Result<Json<Value>, AppError> {
    let (subject, tier) = resolve_subject(&state, req.user_id, origin).await?;
    let refunded = state.quota.refund(subject, req.action, tier).await?;
    Ok(Json(json!({ "refunded": refunded })))
}

/// GET /api/v1/quota/usage
///
/// Read-only usage for one action. Never consumes quota.
pub async fn handle_usage(
    State(state): State<AppState>,
    origin: ClientOrigin,
    Query(req): Query<QuotaRequest>,
) -> Result<Json<UsageReport>, AppError> {
    let (subject, tier) = resolve_subject(&state, req.user_id, origin).await?;
    Ok(Json(state.quota.status(subject, req.action, tier).await?))
}
