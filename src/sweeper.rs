/// Expiry Sweeper
///
/// Moves accounts whose paid window has elapsed back to the free tier and
/// rolls free-tier windows forward. Each account is updated in its own
/// transaction, guarded by the same condition it was selected with, so a
/// concurrent redemption on that account simply makes the sweep skip it.
use crate::{
    catalog::PlanCatalog,
    db::{self, models::Transition},
    error::EngineResult,
    ledger::{self, DowngradeGuard},
    metrics,
};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub downgraded: u64,
    pub renewed: u64,
}

#[derive(Clone)]
pub struct ExpirySweeper {
    db: SqlitePool,
    catalog: PlanCatalog,
    store_timeout: Duration,
}

impl ExpirySweeper {
    pub fn new(db: SqlitePool, catalog: PlanCatalog, store_timeout: Duration) -> Self {
        Self {
            db,
            catalog,
            store_timeout,
        }
    }

    /// Downgrade every paid account whose window ended before `today`
    pub async fn sweep_expired(&self, today: NaiveDate) -> EngineResult<u64> {
        let free = self.catalog.free_plan().await?;

        let candidates: Vec<(i64, Option<i64>)> = sqlx::query_as(
            "SELECT id, bound_key_id FROM accounts WHERE window_end < ? AND plan_id != ? ORDER BY id",
        )
        .bind(today)
        .bind(free.id)
        .fetch_all(&self.db)
        .await?;

        let mut downgraded = 0;

        for (account_id, bound_key) in candidates {
            let swept = db::with_timeout(self.store_timeout, async {
                let mut tx = self.db.begin().await?;
                let swept = ledger::downgrade_to_free(
                    &mut tx,
                    account_id,
                    &free,
                    bound_key,
                    today,
                    DowngradeGuard::Elapsed { today },
                    Transition::Sweep,
                )
                .await?;
                if swept {
                    tx.commit().await?;
                }
                Ok(swept)
            })
            .await?;

            if swept {
                downgraded += 1;
                metrics::SWEEP_DOWNGRADES_TOTAL.inc();
                tracing::info!(account_id, "Expired subscription downgraded to free plan");
            }
        }

        Ok(downgraded)
    }

    /// Give free-tier accounts with an elapsed window a fresh one
    pub async fn renew_free_windows(&self, today: NaiveDate) -> EngineResult<u64> {
        let free = self.catalog.free_plan().await?;
        let (window_start, window_end) = free.window_from(today);

        let result = db::with_timeout(self.store_timeout, async {
            let result = sqlx::query(
                r#"
                UPDATE accounts
                SET used_count = 0, quota_limit = ?, window_start = ?, window_end = ?, updated_at = ?
                WHERE plan_id = ? AND window_end < ?
                "#,
            )
            .bind(free.quota_ceiling)
            .bind(window_start)
            .bind(window_end)
            .bind(Utc::now())
            .bind(free.id)
            .bind(today)
            .execute(&self.db)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if result > 0 {
            tracing::info!(renewed = result, "Renewed free-tier quota windows");
        }

        Ok(result)
    }

    /// Downgrade expired subscriptions, then roll free windows forward
    pub async fn run(&self, today: NaiveDate) -> EngineResult<SweepReport> {
        let downgraded = self.sweep_expired(today).await?;
        let renewed = self.renew_free_windows(today).await?;
        Ok(SweepReport {
            downgraded,
            renewed,
        })
    }
}
