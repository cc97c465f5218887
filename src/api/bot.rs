/// JSON gateway for the chat front end
///
/// Every route requires the shared bot token. Account ids are the chat
/// platform's user ids, so the front end acts on behalf of its users.
use crate::{
    access::AccessVerdict,
    auth::BotGateway,
    context::AppContext,
    db::models::Account,
    error::{EngineError, EngineResult},
    ledger::StatsSnapshot,
    redemption::{BoundKey, KeyInfo, RedeemOutcome, Redemption},
};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use validator::Validate;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/bot/register", post(register))
        .route("/bot/redeem", post(redeem))
        .route("/bot/deactivate", post(deactivate))
        .route("/bot/validate", post(validate_key))
        .route("/bot/usage", post(record_usage))
        .route("/bot/accounts/:id/stats", get(stats))
        .route("/bot/accounts/:id/access", get(check_access))
        .route("/bot/accounts/:id/key", get(bound_key))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    pub account_id: i64,
    #[validate(length(min = 1, max = 128))]
    pub display_name: String,
    #[validate(length(max = 64))]
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub account: Account,
    pub access_key: String,
}

async fn register(
    State(ctx): State<AppContext>,
    _bot: BotGateway,
    Json(req): Json<RegisterRequest>,
) -> EngineResult<Json<RegisterResponse>> {
    req.validate()
        .map_err(|e| EngineError::Validation(e.to_string()))?;

    let account = ctx
        .ledger
        .get_or_create(req.account_id, &req.display_name, req.username.as_deref())
        .await?;

    Ok(Json(RegisterResponse {
        access_key: account.access_key.clone(),
        account,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub account_id: i64,
    pub code: String,
}

async fn redeem(
    State(ctx): State<AppContext>,
    _bot: BotGateway,
    Json(req): Json<RedeemRequest>,
) -> EngineResult<Json<Redemption>> {
    match ctx.redemption.redeem(req.account_id, &req.code).await? {
        RedeemOutcome::Redeemed(redemption) => Ok(Json(redemption)),
        RedeemOutcome::Rejected(rejection) => Err(rejection.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct AccountRequest {
    pub account_id: i64,
}

#[derive(Debug, Serialize)]
pub struct DeactivateResponse {
    pub deactivated: bool,
}

async fn deactivate(
    State(ctx): State<AppContext>,
    _bot: BotGateway,
    Json(req): Json<AccountRequest>,
) -> EngineResult<Json<DeactivateResponse>> {
    let deactivated = ctx.redemption.deactivate(req.account_id).await?;
    Ok(Json(DeactivateResponse { deactivated }))
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub code: String,
}

async fn validate_key(
    State(ctx): State<AppContext>,
    _bot: BotGateway,
    Json(req): Json<ValidateRequest>,
) -> EngineResult<Json<KeyInfo>> {
    Ok(Json(ctx.redemption.validate(&req.code).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct UsageRequest {
    pub account_id: i64,
    #[validate(length(min = 1, max = 32))]
    pub kind: String,
    #[serde(default)]
    pub request_summary: String,
    #[serde(default)]
    pub response_summary: String,
}

/// Gate a billable action: check access, then count and log it
async fn record_usage(
    State(ctx): State<AppContext>,
    _bot: BotGateway,
    Json(req): Json<UsageRequest>,
) -> EngineResult<Json<StatsSnapshot>> {
    req.validate()
        .map_err(|e| EngineError::Validation(e.to_string()))?;

    let today = Utc::now().date_naive();
    let verdict = ctx.ledger.check_access(req.account_id, today).await?;
    if let Some(denial) = verdict.denial() {
        return Err(denial);
    }

    ctx.ledger.increment_usage(req.account_id).await?;
    if let Err(e) = ctx
        .ledger
        .record_usage(
            req.account_id,
            &req.kind,
            &req.request_summary,
            &req.response_summary,
        )
        .await
    {
        tracing::warn!(account_id = req.account_id, "Failed to write usage record: {}", e);
    }

    Ok(Json(ctx.ledger.get_stats(req.account_id, today).await?))
}

async fn stats(
    State(ctx): State<AppContext>,
    _bot: BotGateway,
    Path(account_id): Path<i64>,
) -> EngineResult<Json<StatsSnapshot>> {
    let today = Utc::now().date_naive();
    Ok(Json(ctx.ledger.get_stats(account_id, today).await?))
}

async fn check_access(
    State(ctx): State<AppContext>,
    _bot: BotGateway,
    Path(account_id): Path<i64>,
) -> EngineResult<Json<AccessVerdict>> {
    let today = Utc::now().date_naive();
    Ok(Json(ctx.ledger.check_access(account_id, today).await?))
}

async fn bound_key(
    State(ctx): State<AppContext>,
    _bot: BotGateway,
    Path(account_id): Path<i64>,
) -> EngineResult<Json<BoundKey>> {
    ctx.redemption
        .bound_key(account_id)
        .await?
        .map(Json)
        .ok_or_else(|| EngineError::NotFound(format!("Account {} has no active key", account_id)))
}
