/// Plan Catalog
///
/// Named subscription tiers. Plans are seeded once with insert-if-absent
/// semantics and are never deleted, only deactivated.
use crate::{
    db::models::Plan,
    error::{EngineError, EngineResult},
};
use chrono::Utc;
use sqlx::SqlitePool;

/// Name of the zero-cost tier every account falls back to
pub const FREE_PLAN_NAME: &str = "FREE";

struct SeedPlan {
    name: &'static str,
    description: &'static str,
    price: f64,
    quota_ceiling: i64,
    window_days: i64,
    max_keys_per_plan: i64,
}

const BASELINE_PLANS: [SeedPlan; 5] = [
    SeedPlan {
        name: FREE_PLAN_NAME,
        description: "Free plan",
        price: 0.0,
        quota_ceiling: 50,
        window_days: 30,
        max_keys_per_plan: 0,
    },
    SeedPlan {
        name: "BASIC",
        description: "Basic plan",
        price: 10.0,
        quota_ceiling: 500,
        window_days: 30,
        max_keys_per_plan: 1,
    },
    SeedPlan {
        name: "PRO",
        description: "Professional plan",
        price: 25.0,
        quota_ceiling: 2000,
        window_days: 30,
        max_keys_per_plan: 3,
    },
    SeedPlan {
        name: "PREMIUM",
        description: "Premium plan",
        price: 50.0,
        quota_ceiling: 10000,
        window_days: 30,
        max_keys_per_plan: 5,
    },
    SeedPlan {
        name: "ENTERPRISE",
        description: "Enterprise plan",
        price: 200.0,
        quota_ceiling: 50000,
        window_days: 30,
        max_keys_per_plan: 10,
    },
];

const PLAN_COLUMNS: &str =
    "id, name, description, price, quota_ceiling, window_days, max_keys_per_plan, active, created_at";

/// Plan catalog manager
#[derive(Clone)]
pub struct PlanCatalog {
    db: SqlitePool,
}

impl PlanCatalog {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Insert the baseline catalog, leaving existing rows untouched
    pub async fn seed_defaults(&self) -> EngineResult<u64> {
        let now = Utc::now();
        let mut inserted = 0;

        for plan in BASELINE_PLANS.iter() {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO plans
                (name, description, price, quota_ceiling, window_days, max_keys_per_plan, active, created_at)
                VALUES (?, ?, ?, ?, ?, ?, 1, ?)
                "#,
            )
            .bind(plan.name)
            .bind(plan.description)
            .bind(plan.price)
            .bind(plan.quota_ceiling)
            .bind(plan.window_days)
            .bind(plan.max_keys_per_plan)
            .bind(now)
            .execute(&self.db)
            .await?;

            inserted += result.rows_affected();
        }

        if inserted > 0 {
            tracing::info!(inserted, "Seeded baseline plan catalog");
        }

        Ok(inserted)
    }

    /// Active plans, cheapest first
    pub async fn list_active_plans(&self) -> EngineResult<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {} FROM plans WHERE active = 1 ORDER BY price ASC, id ASC",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;

        Ok(plans)
    }

    /// All plans including deactivated ones
    pub async fn list_all_plans(&self) -> EngineResult<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {} FROM plans ORDER BY price ASC, id ASC",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;

        Ok(plans)
    }

    pub async fn get_plan(&self, id: i64) -> EngineResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {} FROM plans WHERE id = ?",
            PLAN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(plan)
    }

    /// Look up a plan by name, case-insensitively
    pub async fn get_plan_by_name(&self, name: &str) -> EngineResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {} FROM plans WHERE name = ?",
            PLAN_COLUMNS
        ))
        .bind(name.trim().to_uppercase())
        .fetch_optional(&self.db)
        .await?;

        Ok(plan)
    }

    /// The zero-cost fallback tier
    pub async fn free_plan(&self) -> EngineResult<Plan> {
        self.get_plan_by_name(FREE_PLAN_NAME)
            .await?
            .ok_or_else(|| EngineError::Internal("Free plan missing from catalog".to_string()))
    }

    /// Activate or deactivate a plan; the free tier cannot be deactivated
    pub async fn set_plan_active(&self, name: &str, active: bool) -> EngineResult<Plan> {
        let name = name.trim().to_uppercase();
        if !active && name == FREE_PLAN_NAME {
            return Err(EngineError::Conflict(
                "The free plan cannot be deactivated".to_string(),
            ));
        }

        let result = sqlx::query("UPDATE plans SET active = ? WHERE name = ?")
            .bind(active)
            .bind(&name)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("Plan {} not found", name)));
        }

        tracing::info!(plan = %name, active, "Plan availability changed");

        self.get_plan_by_name(&name)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Plan {} not found", name)))
    }
}
