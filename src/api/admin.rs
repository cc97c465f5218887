/// Admin API Endpoints
///
/// Every handler takes a [`PrivilegedAccount`], the single capability check.
use crate::{
    auth::PrivilegedAccount,
    context::AppContext,
    db::models::{Account, Plan, UsageRecord},
    error::{EngineError, EngineResult},
    keys::{IssuedKeys, KeyFilter, KeyListing, KeyStats},
    ledger::StatsSnapshot,
    redemption::{BoundKey, RevokeResult},
    sweeper::SweepReport,
};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Build admin API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        // Keys
        .route("/admin/keys", post(issue_keys).get(list_keys))
        .route("/admin/keys/stats", get(key_stats))
        .route("/admin/keys/revoke", post(revoke_key))
        // Expiry
        .route("/admin/sweep", post(run_sweep))
        // Accounts
        .route("/admin/accounts/:id", get(get_account))
        .route("/admin/accounts/:id/active", post(set_active))
        .route("/admin/accounts/:id/privileged", post(set_privileged))
        .route("/admin/privileged", get(list_privileged))
        // Plans
        .route("/admin/plans", get(list_all_plans))
        .route("/admin/plans/:name/active", post(set_plan_active))
}

fn validated<T: Validate>(req: &T) -> EngineResult<()> {
    req.validate()
        .map_err(|e| EngineError::Validation(e.to_string()))
}

#[derive(Debug, Deserialize, Validate)]
pub struct IssueKeysRequest {
    #[validate(length(min = 1, max = 32))]
    pub plan: String,
    #[validate(range(min = 1))]
    pub quantity: u32,
    /// Falls back to the configured default; 0 means no expiry
    #[validate(range(max = 36500))]
    pub validity_days: Option<u32>,
}

async fn issue_keys(
    State(ctx): State<AppContext>,
    admin: PrivilegedAccount,
    Json(req): Json<IssueKeysRequest>,
) -> EngineResult<Json<IssuedKeys>> {
    validated(&req)?;

    let validity_days = req
        .validity_days
        .unwrap_or(ctx.config.issuance.default_validity_days);
    let issued = ctx
        .issuer
        .issue_keys(&req.plan, req.quantity, validity_days)
        .await?;

    tracing::info!(
        admin = admin.account.id,
        plan = %issued.plan.name,
        issued = issued.codes.len(),
        "Admin issued activation keys"
    );

    Ok(Json(issued))
}

#[derive(Debug, Deserialize)]
pub struct ListKeysQuery {
    pub plan: Option<String>,
    pub used: Option<bool>,
    pub limit: Option<i64>,
}

async fn list_keys(
    State(ctx): State<AppContext>,
    _admin: PrivilegedAccount,
    Query(query): Query<ListKeysQuery>,
) -> EngineResult<Json<Vec<KeyListing>>> {
    let filter = KeyFilter {
        plan: query.plan,
        used: query.used,
    };
    let keys = ctx
        .issuer
        .list_keys(&filter, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(keys))
}

async fn key_stats(
    State(ctx): State<AppContext>,
    _admin: PrivilegedAccount,
) -> EngineResult<Json<KeyStats>> {
    Ok(Json(ctx.issuer.key_stats().await?))
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub code: String,
}

async fn revoke_key(
    State(ctx): State<AppContext>,
    admin: PrivilegedAccount,
    Json(req): Json<RevokeRequest>,
) -> EngineResult<Json<RevokeResult>> {
    let result = ctx.redemption.revoke_key(&req.code).await?;
    tracing::info!(admin = admin.account.id, key_id = result.key_id, "Admin revoked key");
    Ok(Json(result))
}

async fn run_sweep(
    State(ctx): State<AppContext>,
    admin: PrivilegedAccount,
) -> EngineResult<Json<SweepReport>> {
    let report = ctx.sweeper.run(Utc::now().date_naive()).await?;
    tracing::info!(
        admin = admin.account.id,
        downgraded = report.downgraded,
        renewed = report.renewed,
        "Manual sweep completed"
    );
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct AccountDetail {
    pub account: Account,
    pub stats: StatsSnapshot,
    pub bound_key: Option<BoundKey>,
    pub recent_usage: Vec<UsageRecord>,
}

async fn get_account(
    State(ctx): State<AppContext>,
    _admin: PrivilegedAccount,
    Path(account_id): Path<i64>,
) -> EngineResult<Json<AccountDetail>> {
    let account = ctx
        .ledger
        .get_account(account_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Account {} not found", account_id)))?;

    let stats = ctx
        .ledger
        .get_stats(account_id, Utc::now().date_naive())
        .await?;
    let bound_key = ctx.redemption.bound_key(account_id).await?;
    let recent_usage = ctx.ledger.recent_usage(account_id, 10).await?;

    Ok(Json(AccountDetail {
        account,
        stats,
        bound_key,
        recent_usage,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

async fn set_active(
    State(ctx): State<AppContext>,
    admin: PrivilegedAccount,
    Path(account_id): Path<i64>,
    Json(req): Json<ActiveRequest>,
) -> EngineResult<Json<Account>> {
    if account_id == admin.account.id && !req.active {
        return Err(EngineError::Conflict(
            "Administrators cannot block themselves".to_string(),
        ));
    }
    Ok(Json(ctx.ledger.set_active(account_id, req.active).await?))
}

#[derive(Debug, Deserialize)]
pub struct PrivilegedRequest {
    pub privileged: bool,
}

async fn set_privileged(
    State(ctx): State<AppContext>,
    admin: PrivilegedAccount,
    Path(account_id): Path<i64>,
    Json(req): Json<PrivilegedRequest>,
) -> EngineResult<Json<Account>> {
    let account = ctx.ledger.set_privileged(account_id, req.privileged).await?;
    tracing::info!(
        admin = admin.account.id,
        account_id,
        privileged = req.privileged,
        "Admin changed account privilege"
    );
    Ok(Json(account))
}

async fn list_privileged(
    State(ctx): State<AppContext>,
    _admin: PrivilegedAccount,
) -> EngineResult<Json<Vec<Account>>> {
    Ok(Json(ctx.ledger.list_privileged().await?))
}

async fn list_all_plans(
    State(ctx): State<AppContext>,
    _admin: PrivilegedAccount,
) -> EngineResult<Json<Vec<Plan>>> {
    Ok(Json(ctx.catalog.list_all_plans().await?))
}

async fn set_plan_active(
    State(ctx): State<AppContext>,
    _admin: PrivilegedAccount,
    Path(name): Path<String>,
    Json(req): Json<ActiveRequest>,
) -> EngineResult<Json<Plan>> {
    Ok(Json(ctx.catalog.set_plan_active(&name, req.active).await?))
}
