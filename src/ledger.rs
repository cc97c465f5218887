/// Account & Quota Ledger
///
/// Owns account rows and the usage log. Registration is idempotent, the
/// usage counter and the usage log are independent writes, and plan
/// downgrades shared by deactivation, revocation and the sweeper go through
/// [`downgrade_to_free`].
use crate::{
    access::{self, AccessReason, AccessVerdict},
    catalog::PlanCatalog,
    db::{
        self,
        models::{Account, Plan, Transition, UsageRecord},
    },
    error::{EngineError, EngineResult},
    metrics, redemption,
};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub(crate) const ACCOUNT_COLUMNS: &str = "id, display_name, username, access_key, plan_id, bound_key_id, used_count, quota_limit, window_start, window_end, active, is_privileged, created_at, updated_at";

/// Longest stored request/response summary, in characters
const SUMMARY_LIMIT: usize = 500;

/// Point-in-time view of an account's quota and window
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub account_id: i64,
    pub display_name: String,
    pub username: Option<String>,
    pub plan_name: String,
    pub has_key: bool,
    pub active: bool,
    pub quota_limit: i64,
    pub used_count: i64,
    /// `quota_limit - used_count`, may be negative
    pub requests_remaining: i64,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    /// `window_end - today`, may be negative
    pub days_remaining: i64,
    pub total_requests: i64,
}

impl StatsSnapshot {
    pub fn display_requests_remaining(&self) -> i64 {
        self.requests_remaining.max(0)
    }

    pub fn display_days_remaining(&self) -> i64 {
        self.days_remaining.max(0)
    }
}

/// Row condition applied when moving an account back to the free tier
#[derive(Debug, Clone, Copy)]
pub(crate) enum DowngradeGuard {
    /// Account must currently hold a key
    HasKey,
    /// Unconditional
    Force,
    /// Window elapsed before `today` and the account is on a paid plan
    Elapsed { today: NaiveDate },
}

/// Move an account to the free plan with a fresh window and append history
///
/// Runs on the caller's transaction; returns false when the guard matched no
/// row.
pub(crate) async fn downgrade_to_free(
    conn: &mut SqliteConnection,
    account_id: i64,
    free: &Plan,
    released_key: Option<i64>,
    today: NaiveDate,
    guard: DowngradeGuard,
    transition: Transition,
) -> EngineResult<bool> {
    let (window_start, window_end) = free.window_from(today);

    let condition = match guard {
        DowngradeGuard::HasKey => "AND bound_key_id IS NOT NULL",
        DowngradeGuard::Force => "",
        DowngradeGuard::Elapsed { .. } => "AND window_end < ? AND plan_id != ?",
    };

    let sql = format!(
        r#"
        UPDATE accounts
        SET plan_id = ?, bound_key_id = NULL, quota_limit = ?, used_count = 0,
            window_start = ?, window_end = ?, updated_at = ?
        WHERE id = ? {}
        "#,
        condition
    );

    let mut query = sqlx::query(&sql)
        .bind(free.id)
        .bind(free.quota_ceiling)
        .bind(window_start)
        .bind(window_end)
        .bind(Utc::now())
        .bind(account_id);

    if let DowngradeGuard::Elapsed { today } = guard {
        query = query.bind(today).bind(free.id);
    }

    let result = query.execute(&mut *conn).await?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }

    redemption::append_event(
        &mut *conn,
        account_id,
        free.id,
        released_key,
        transition,
        window_start,
        window_end,
    )
    .await?;

    Ok(true)
}

/// Account and quota ledger
#[derive(Clone)]
pub struct AccountLedger {
    db: SqlitePool,
    catalog: PlanCatalog,
    bootstrap_admins: Arc<Vec<i64>>,
    store_timeout: Duration,
}

impl AccountLedger {
    pub fn new(
        db: SqlitePool,
        catalog: PlanCatalog,
        bootstrap_admins: Vec<i64>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            db,
            catalog,
            bootstrap_admins: Arc::new(bootstrap_admins),
            store_timeout,
        }
    }

    /// Register an account on the free plan, or return the existing one unchanged
    pub async fn get_or_create(
        &self,
        account_id: i64,
        display_name: &str,
        username: Option<&str>,
    ) -> EngineResult<Account> {
        let free = self.catalog.free_plan().await?;
        let (window_start, window_end) = free.window_from(Utc::now().date_naive());
        let now = Utc::now();

        let inserted = db::with_timeout(self.store_timeout, async {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO accounts
                (id, display_name, username, access_key, plan_id, bound_key_id, used_count,
                 quota_limit, window_start, window_end, active, is_privileged, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, NULL, 0, ?, ?, ?, 1, 0, ?, ?)
                "#,
            )
            .bind(account_id)
            .bind(display_name)
            .bind(username)
            .bind(Uuid::new_v4().simple().to_string())
            .bind(free.id)
            .bind(free.quota_ceiling)
            .bind(window_start)
            .bind(window_end)
            .bind(now)
            .bind(now)
            .execute(&self.db)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await?;

        if inserted {
            tracing::info!(account_id, "Registered account on free plan");
        }

        self.get_account(account_id).await?.ok_or_else(|| {
            EngineError::Internal(format!("Account {} missing after registration", account_id))
        })
    }

    pub async fn get_account(&self, account_id: i64) -> EngineResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(account)
    }

    pub async fn get_account_by_access_key(&self, access_key: &str) -> EngineResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE access_key = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(access_key)
        .fetch_optional(&self.db)
        .await?;

        Ok(account)
    }

    async fn require_account(&self, account_id: i64) -> EngineResult<Account> {
        self.get_account(account_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Account {} not found", account_id)))
    }

    /// Bump the usage counter; does not enforce the quota ceiling
    pub async fn increment_usage(&self, account_id: i64) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE accounts SET used_count = used_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(account_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("Account {} not found", account_id)));
        }

        Ok(())
    }

    /// Append a usage log row, independent of the counter
    pub async fn record_usage(
        &self,
        account_id: i64,
        kind: &str,
        request_summary: &str,
        response_summary: &str,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_records (account_id, kind, request_summary, response_summary, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(account_id)
        .bind(kind)
        .bind(summarize(request_summary))
        .bind(summarize(response_summary))
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        metrics::record_usage(kind);
        Ok(())
    }

    /// Most recent usage rows first
    pub async fn recent_usage(&self, account_id: i64, limit: i64) -> EngineResult<Vec<UsageRecord>> {
        let records = sqlx::query_as::<_, UsageRecord>(
            r#"
            SELECT id, account_id, kind, request_summary, response_summary, created_at
            FROM usage_records
            WHERE account_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.db)
        .await?;

        Ok(records)
    }

    pub async fn get_stats(&self, account_id: i64, today: NaiveDate) -> EngineResult<StatsSnapshot> {
        let account = self.require_account(account_id).await?;
        let plan = self.catalog.get_plan(account.plan_id).await?.ok_or_else(|| {
            EngineError::StateCorruption(format!(
                "account {} references missing plan {}",
                account.id, account.plan_id
            ))
        })?;

        let total_requests: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM usage_records WHERE account_id = ?")
                .bind(account_id)
                .fetch_one(&self.db)
                .await?;

        Ok(StatsSnapshot {
            account_id: account.id,
            display_name: account.display_name,
            username: account.username,
            plan_name: plan.name,
            has_key: account.bound_key_id.is_some(),
            active: account.active,
            quota_limit: account.quota_limit,
            used_count: account.used_count,
            requests_remaining: account.quota_limit - account.used_count,
            window_start: account.window_start,
            window_end: account.window_end,
            days_remaining: (account.window_end - today).num_days(),
            total_requests,
        })
    }

    /// Read the account and evaluate access; no side effects besides metrics
    pub async fn check_access(&self, account_id: i64, today: NaiveDate) -> EngineResult<AccessVerdict> {
        let account = self.get_account(account_id).await?;
        let verdict = access::check_access(account.as_ref(), today);
        metrics::record_access_decision(verdict.reason.label());
        Ok(verdict)
    }

    /// Check and consume one unit of quota in a single conditional update
    pub async fn consume_if_available(
        &self,
        account_id: i64,
        today: NaiveDate,
    ) -> EngineResult<AccessVerdict> {
        let consumed = db::with_timeout(self.store_timeout, async {
            let result = sqlx::query(
                r#"
                UPDATE accounts
                SET used_count = used_count + 1, updated_at = ?
                WHERE id = ? AND active = 1 AND window_end >= ? AND used_count < quota_limit
                "#,
            )
            .bind(Utc::now())
            .bind(account_id)
            .bind(today)
            .execute(&self.db)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await?;

        let account = self.get_account(account_id).await?;
        let mut verdict = access::check_access(account.as_ref(), today);

        if consumed {
            verdict = AccessVerdict {
                allowed: true,
                reason: AccessReason::Granted,
                active: true,
                subscription_active: true,
                has_quota: true,
            };
        } else if verdict.allowed {
            // Lost the last unit to a concurrent consumer between the update and the read
            verdict.allowed = false;
            verdict.has_quota = false;
            verdict.reason = AccessReason::QuotaExhausted;
        }

        metrics::record_access_decision(verdict.reason.label());
        Ok(verdict)
    }

    /// Block or unblock an account
    pub async fn set_active(&self, account_id: i64, active: bool) -> EngineResult<Account> {
        let result = sqlx::query("UPDATE accounts SET active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(Utc::now())
            .bind(account_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("Account {} not found", account_id)));
        }

        tracing::info!(account_id, active, "Account active flag changed");
        self.require_account(account_id).await
    }

    pub async fn set_privileged(&self, account_id: i64, privileged: bool) -> EngineResult<Account> {
        let result =
            sqlx::query("UPDATE accounts SET is_privileged = ?, updated_at = ? WHERE id = ?")
                .bind(privileged)
                .bind(Utc::now())
                .bind(account_id)
                .execute(&self.db)
                .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("Account {} not found", account_id)));
        }

        tracing::info!(account_id, privileged, "Account privilege changed");
        self.require_account(account_id).await
    }

    pub async fn list_privileged(&self) -> EngineResult<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE is_privileged = 1 ORDER BY id ASC",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;

        Ok(accounts)
    }

    pub fn is_privileged(&self, account: &Account) -> bool {
        account.is_privileged || self.bootstrap_admins.contains(&account.id)
    }

    /// Single capability check for administrative operations
    pub async fn require_privileged(&self, account_id: i64) -> EngineResult<Account> {
        let account = self.get_account(account_id).await?.ok_or_else(|| {
            EngineError::Authorization("Account is not registered".to_string())
        })?;

        if !self.is_privileged(&account) {
            tracing::debug!(account_id, "Privileged operation refused");
            return Err(EngineError::Authorization(
                "Privileged access required".to_string(),
            ));
        }

        Ok(account)
    }
}

fn summarize(text: &str) -> String {
    match text.char_indices().nth(SUMMARY_LIMIT) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Duration as ChronoDuration;

    async fn setup() -> AccountLedger {
        let db = test_pool().await;
        let catalog = PlanCatalog::new(db.clone());
        catalog.seed_defaults().await.unwrap();
        AccountLedger::new(db, catalog, vec![9000], Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let ledger = setup().await;

        let first = ledger.get_or_create(42, "Alice", Some("alice")).await.unwrap();
        let second = ledger.get_or_create(42, "Bob", None).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.display_name, "Alice");
        assert_eq!(second.username.as_deref(), Some("alice"));
        assert_eq!(first.access_key, second.access_key);
        assert_eq!(first.access_key.len(), 32);

        let free = ledger.catalog.free_plan().await.unwrap();
        assert_eq!(first.plan_id, free.id);
        assert_eq!(first.quota_limit, free.quota_ceiling);
        assert_eq!(
            (first.window_end - first.window_start).num_days(),
            free.window_days
        );
    }

    #[tokio::test]
    async fn test_lookup_by_access_key() {
        let ledger = setup().await;
        let account = ledger.get_or_create(7, "Carol", None).await.unwrap();

        let found = ledger
            .get_account_by_access_key(&account.access_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, 7);
        assert!(ledger.get_account_by_access_key("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_increment_and_stats() {
        let ledger = setup().await;
        ledger.get_or_create(1, "Alice", None).await.unwrap();

        ledger.increment_usage(1).await.unwrap();
        ledger.increment_usage(1).await.unwrap();
        ledger.record_usage(1, "query", "hello", "world").await.unwrap();

        let today = Utc::now().date_naive();
        let stats = ledger.get_stats(1, today).await.unwrap();
        assert_eq!(stats.plan_name, "FREE");
        assert_eq!(stats.used_count, 2);
        assert_eq!(stats.requests_remaining, 48);
        assert_eq!(stats.days_remaining, 30);
        assert_eq!(stats.total_requests, 1);
        assert!(!stats.has_key);

        assert!(matches!(
            ledger.increment_usage(999).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            ledger.get_stats(999, today).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stats_display_floors() {
        let ledger = setup().await;
        ledger.get_or_create(1, "Alice", None).await.unwrap();

        sqlx::query("UPDATE accounts SET used_count = 60 WHERE id = 1")
            .execute(&ledger.db)
            .await
            .unwrap();

        let later = Utc::now().date_naive() + ChronoDuration::days(45);
        let stats = ledger.get_stats(1, later).await.unwrap();
        assert_eq!(stats.requests_remaining, -10);
        assert_eq!(stats.display_requests_remaining(), 0);
        assert_eq!(stats.days_remaining, -15);
        assert_eq!(stats.display_days_remaining(), 0);
    }

    #[tokio::test]
    async fn test_usage_summaries_are_truncated() {
        let ledger = setup().await;
        ledger.get_or_create(1, "Alice", None).await.unwrap();

        let long = "é".repeat(SUMMARY_LIMIT + 20);
        ledger.record_usage(1, "query", &long, "ok").await.unwrap();

        let records = ledger.recent_usage(1, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request_summary.chars().count(), SUMMARY_LIMIT);
        assert_eq!(records[0].response_summary, "ok");
    }

    #[tokio::test]
    async fn test_consume_if_available() {
        let ledger = setup().await;
        ledger.get_or_create(1, "Alice", None).await.unwrap();
        sqlx::query("UPDATE accounts SET quota_limit = 1 WHERE id = 1")
            .execute(&ledger.db)
            .await
            .unwrap();

        let today = Utc::now().date_naive();
        assert!(ledger.consume_if_available(1, today).await.unwrap().allowed);

        let denied = ledger.consume_if_available(1, today).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reason, AccessReason::QuotaExhausted);

        let account = ledger.get_account(1).await.unwrap().unwrap();
        assert_eq!(account.used_count, 1);

        let missing = ledger.consume_if_available(2, today).await.unwrap();
        assert_eq!(missing.reason, AccessReason::AccountNotFound);
    }

    #[tokio::test]
    async fn test_block_and_privilege() {
        let ledger = setup().await;
        ledger.get_or_create(1, "Alice", None).await.unwrap();
        ledger.get_or_create(9000, "Root", None).await.unwrap();

        let today = Utc::now().date_naive();
        let blocked = ledger.set_active(1, false).await.unwrap();
        assert!(!blocked.active);
        let verdict = ledger.check_access(1, today).await.unwrap();
        assert_eq!(verdict.reason, AccessReason::AccountInactive);

        assert!(matches!(
            ledger.require_privileged(1).await,
            Err(EngineError::Authorization(_))
        ));
        assert!(ledger.require_privileged(9000).await.is_ok());
        assert!(matches!(
            ledger.require_privileged(555).await,
            Err(EngineError::Authorization(_))
        ));

        ledger.set_privileged(1, true).await.unwrap();
        assert!(ledger.require_privileged(1).await.is_ok());

        let admins = ledger.list_privileged().await.unwrap();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].id, 1);

        assert!(matches!(
            ledger.set_active(555, true).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
