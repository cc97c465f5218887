/// Background task implementations
use crate::{context::AppContext, db, error::EngineResult, sweeper::SweepReport};
use chrono::Utc;

/// Run the expiry sweep for today
pub async fn expiry_sweep(ctx: &AppContext) -> EngineResult<SweepReport> {
    ctx.sweeper.run(Utc::now().date_naive()).await
}

/// Health check - verify the store is reachable
pub async fn health_check(ctx: &AppContext) -> EngineResult<()> {
    db::test_connection(&ctx.db).await
}
