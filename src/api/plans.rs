/// Public plan listing
use crate::{context::AppContext, db::models::Plan, error::EngineResult};
use axum::{extract::State, routing::get, Json, Router};

pub fn routes() -> Router<AppContext> {
    Router::new().route("/plans", get(list_plans))
}

/// Active plans, cheapest first
async fn list_plans(State(ctx): State<AppContext>) -> EngineResult<Json<Vec<Plan>>> {
    Ok(Json(ctx.catalog.list_active_plans().await?))
}
