/// Read API keyed by an account's access key
use crate::{
    auth::AccessKeyAccount,
    context::AppContext,
    error::{EngineError, EngineResult},
};
use axum::{extract::State, routing::get, Json, Router};
use chrono::{NaiveDate, Utc};
use serde::Serialize;

pub fn routes() -> Router<AppContext> {
    Router::new().route("/user/info", get(user_info))
}

#[derive(Debug, Serialize)]
pub struct PlanSummary {
    pub name: String,
    pub description: String,
    pub quota_ceiling: i64,
    pub window_days: i64,
}

#[derive(Debug, Serialize)]
pub struct UserInfoResponse {
    pub account_id: i64,
    pub display_name: String,
    pub username: Option<String>,
    pub plan: PlanSummary,
    pub has_key: bool,
    pub requests_used: i64,
    pub requests_remaining: i64,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub days_remaining: i64,
}

/// Account and plan snapshot; each call counts against the quota
async fn user_info(
    State(ctx): State<AppContext>,
    auth: AccessKeyAccount,
) -> EngineResult<Json<UserInfoResponse>> {
    let account_id = auth.account.id;
    let today = Utc::now().date_naive();

    let verdict = ctx.ledger.check_access(account_id, today).await?;
    if let Some(denial) = verdict.denial() {
        return Err(denial);
    }

    ctx.ledger.increment_usage(account_id).await?;

    let stats = ctx.ledger.get_stats(account_id, today).await?;
    let plan = ctx
        .catalog
        .get_plan_by_name(&stats.plan_name)
        .await?
        .ok_or_else(|| EngineError::Internal(format!("Plan {} vanished", stats.plan_name)))?;

    if let Err(e) = ctx
        .ledger
        .record_usage(
            account_id,
            "api_info",
            "GET /user/info",
            &format!("plan={} remaining={}", plan.name, stats.requests_remaining),
        )
        .await
    {
        tracing::warn!(account_id, "Failed to write usage audit row: {}", e);
    }

    Ok(Json(UserInfoResponse {
        account_id,
        display_name: stats.display_name.clone(),
        username: stats.username.clone(),
        plan: PlanSummary {
            name: plan.name,
            description: plan.description,
            quota_ceiling: plan.quota_ceiling,
            window_days: plan.window_days,
        },
        has_key: stats.has_key,
        requests_used: stats.used_count,
        requests_remaining: stats.display_requests_remaining(),
        window_start: stats.window_start,
        window_end: stats.window_end,
        days_remaining: stats.display_days_remaining(),
    }))
}
