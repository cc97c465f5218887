/// Key Issuance
use super::{digest, generate_code};
use crate::{
    catalog::PlanCatalog,
    config::{IssuanceConfig, MAX_VALIDITY_DAYS},
    db::{self, models::Plan},
    error::{EngineError, EngineResult},
    metrics,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// Result of a batch issuance; may hold fewer codes than requested
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKeys {
    pub plan: Plan,
    pub requested: u32,
    pub codes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl IssuedKeys {
    pub fn is_partial(&self) -> bool {
        (self.codes.len() as u32) < self.requested
    }
}

/// Filter for administrative key listings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyFilter {
    pub plan: Option<String>,
    /// `Some(false)` lists only unredeemed keys
    pub used: Option<bool>,
}

/// Key row joined with its plan and binding
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct KeyListing {
    pub id: i64,
    pub code: String,
    pub plan_name: String,
    pub used: bool,
    pub bound_account_id: Option<i64>,
    pub bound_display_name: Option<String>,
    pub bound_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PlanKeyStats {
    pub plan_name: String,
    pub total: i64,
    pub used: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    pub total: i64,
    pub used: i64,
    pub available: i64,
    pub per_plan: Vec<PlanKeyStats>,
}

/// Issues unredeemed activation keys; never touches account state
#[derive(Clone)]
pub struct KeyIssuer {
    db: SqlitePool,
    catalog: PlanCatalog,
    config: IssuanceConfig,
    store_timeout: std::time::Duration,
}

impl KeyIssuer {
    pub fn new(
        db: SqlitePool,
        catalog: PlanCatalog,
        config: IssuanceConfig,
        store_timeout: std::time::Duration,
    ) -> Self {
        Self {
            db,
            catalog,
            config,
            store_timeout,
        }
    }

    /// Issue `quantity` keys for a plan; `validity_days == 0` means no expiry
    pub async fn issue_keys(
        &self,
        plan_name: &str,
        quantity: u32,
        validity_days: u32,
    ) -> EngineResult<IssuedKeys> {
        self.issue_keys_with(plan_name, quantity, validity_days, || {
            generate_code(&mut rand::thread_rng())
        })
        .await
    }

    pub(crate) async fn issue_keys_with<F>(
        &self,
        plan_name: &str,
        quantity: u32,
        validity_days: u32,
        mut next_code: F,
    ) -> EngineResult<IssuedKeys>
    where
        F: FnMut() -> String + Send,
    {
        if quantity == 0 || quantity > self.config.max_keys_per_request {
            return Err(EngineError::Validation(format!(
                "Quantity must be between 1 and {}",
                self.config.max_keys_per_request
            )));
        }

        if validity_days > MAX_VALIDITY_DAYS {
            return Err(EngineError::Validation(format!(
                "Validity must be at most {} days",
                MAX_VALIDITY_DAYS
            )));
        }

        let plan = self
            .catalog
            .get_plan_by_name(plan_name)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Plan {} not found", plan_name)))?;

        if !plan.active {
            return Err(EngineError::Conflict(format!("Plan {} is not active", plan.name)));
        }
        if plan.max_keys_per_plan == 0 {
            return Err(EngineError::Conflict(format!(
                "Plan {} does not accept activation keys",
                plan.name
            )));
        }

        let now = Utc::now();
        let expires_at = match validity_days {
            0 => None,
            days => Some(
                now.checked_add_signed(Duration::days(i64::from(days)))
                    .ok_or_else(|| {
                        EngineError::Validation(format!(
                            "Validity of {} days is out of range",
                            days
                        ))
                    })?,
            ),
        };
        let max_attempts = self.config.max_attempts_per_key;

        let codes = db::with_timeout(self.store_timeout, async {
            let mut tx = self.db.begin().await?;
            let mut codes = Vec::with_capacity(quantity as usize);

            for slot in 1..=quantity {
                let mut issued = false;

                for attempt in 1..=max_attempts {
                    let code = next_code();
                    let result = sqlx::query(
                        r#"
                        INSERT INTO activation_keys (plan_id, code, code_hash, used, created_at, expires_at)
                        VALUES (?, ?, ?, 0, ?, ?)
                        "#,
                    )
                    .bind(plan.id)
                    .bind(&code)
                    .bind(digest(&code))
                    .bind(now)
                    .bind(expires_at)
                    .execute(&mut *tx)
                    .await;

                    match result {
                        Ok(_) => {
                            codes.push(code);
                            issued = true;
                            break;
                        }
                        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                            metrics::KEY_COLLISIONS_TOTAL.inc();
                            tracing::warn!(slot, attempt, "Activation code collision, retrying");
                        }
                        Err(e) => return Err(EngineError::from(e)),
                    }
                }

                if !issued {
                    tracing::warn!(
                        slot,
                        max_attempts,
                        "Could not generate a unique activation code"
                    );
                }
            }

            tx.commit().await?;
            Ok(codes)
        })
        .await?;

        metrics::record_keys_issued(&plan.name, codes.len());
        tracing::info!(
            plan = %plan.name,
            requested = quantity,
            issued = codes.len(),
            validity_days,
            "Issued activation keys"
        );

        Ok(IssuedKeys {
            plan,
            requested: quantity,
            codes,
            expires_at,
        })
    }

    /// Newest keys first, optionally filtered by plan and redemption state
    pub async fn list_keys(&self, filter: &KeyFilter, limit: i64) -> EngineResult<Vec<KeyListing>> {
        let plan = filter.plan.as_ref().map(|p| p.trim().to_uppercase());

        let keys = sqlx::query_as::<_, KeyListing>(
            r#"
            SELECT k.id, k.code, p.name AS plan_name, k.used, k.bound_account_id,
                   a.display_name AS bound_display_name, k.bound_at, k.created_at, k.expires_at
            FROM activation_keys k
            JOIN plans p ON k.plan_id = p.id
            LEFT JOIN accounts a ON k.bound_account_id = a.id
            WHERE (?1 IS NULL OR p.name = ?1)
              AND (?2 IS NULL OR k.used = ?2)
            ORDER BY k.created_at DESC, k.id DESC
            LIMIT ?3
            "#,
        )
        .bind(plan)
        .bind(filter.used)
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.db)
        .await?;

        Ok(keys)
    }

    /// Totals across all keys plus a per-plan breakdown ordered by price
    pub async fn key_stats(&self) -> EngineResult<KeyStats> {
        let (total, used): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(CASE WHEN used = 1 THEN 1 ELSE 0 END), 0)
            FROM activation_keys
            "#,
        )
        .fetch_one(&self.db)
        .await?;

        let per_plan = sqlx::query_as::<_, PlanKeyStats>(
            r#"
            SELECT p.name AS plan_name,
                   COUNT(k.id) AS total,
                   COALESCE(SUM(CASE WHEN k.used = 1 THEN 1 ELSE 0 END), 0) AS used
            FROM plans p
            JOIN activation_keys k ON k.plan_id = p.id
            GROUP BY p.id, p.name
            ORDER BY p.price ASC
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        Ok(KeyStats {
            total,
            used,
            available: total - used,
            per_plan,
        })
    }
}
