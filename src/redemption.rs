/// Redemption Engine
///
/// Key states: unbound, then bound to exactly one account. Only an
/// administrative revoke returns a bound key to the unbound state.
///
/// Every mutation runs in one transaction whose first statement is a
/// conditional update. The affected-row count of that update decides the
/// outcome, so concurrent redemptions of the same code cannot both win even
/// across processes sharing the database.
use crate::{
    catalog::PlanCatalog,
    db::{
        self,
        models::{ActivationKey, Plan, Transition},
    },
    error::{EngineError, EngineResult},
    keys::{self, MalformedCode},
    ledger::{self, DowngradeGuard},
    metrics,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::time::Duration;

const KEY_COLUMNS: &str =
    "id, plan_id, code, code_hash, used, bound_account_id, bound_at, created_at, expires_at";

/// Successful redemption
#[derive(Debug, Clone, Serialize)]
pub struct Redemption {
    pub key_id: i64,
    pub plan_name: String,
    pub quota_ceiling: i64,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
}

/// Why a redemption did not bind the key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemRejection {
    Malformed(MalformedCode),
    InvalidOrExpired,
    AlreadyBoundToSelf,
    BoundToOther,
    AccountNotRegistered,
    AlreadyHasKey,
}

impl RedeemRejection {
    /// Human-readable reason shown to the user
    pub fn reason(&self) -> String {
        match self {
            RedeemRejection::Malformed(e) => {
                format!("Invalid key format: {}. Expected XXXX-XXXX-XXXX-XXXX", e)
            }
            RedeemRejection::InvalidOrExpired => "Key not found or expired".to_string(),
            RedeemRejection::AlreadyBoundToSelf => {
                "This key is already activated on your account".to_string()
            }
            RedeemRejection::BoundToOther => {
                "This key has already been used by another account".to_string()
            }
            RedeemRejection::AccountNotRegistered => {
                "Account is not registered; register first and retry with the same key".to_string()
            }
            RedeemRejection::AlreadyHasKey => {
                "Account already has an active key; deactivate it first".to_string()
            }
        }
    }

    /// Stable wire code
    pub fn code(&self) -> &'static str {
        match self {
            RedeemRejection::Malformed(_) => "MALFORMED",
            RedeemRejection::InvalidOrExpired => "INVALID_OR_EXPIRED",
            RedeemRejection::AlreadyBoundToSelf => "ALREADY_BOUND_TO_SELF",
            RedeemRejection::BoundToOther => "BOUND_TO_OTHER",
            RedeemRejection::AccountNotRegistered => "ACCOUNT_NOT_REGISTERED",
            RedeemRejection::AlreadyHasKey => "ALREADY_HAS_KEY",
        }
    }

    /// Error taxonomy class
    pub fn kind(&self) -> &'static str {
        match self {
            RedeemRejection::Malformed(_) => "MalformedInput",
            RedeemRejection::InvalidOrExpired => "ExpiredOrInvalid",
            RedeemRejection::AccountNotRegistered => "NotFound",
            RedeemRejection::AlreadyBoundToSelf
            | RedeemRejection::BoundToOther
            | RedeemRejection::AlreadyHasKey => "Conflict",
        }
    }
}

impl From<RedeemRejection> for EngineError {
    fn from(rejection: RedeemRejection) -> Self {
        match rejection {
            RedeemRejection::Malformed(e) => e.into(),
            RedeemRejection::InvalidOrExpired => EngineError::ExpiredOrInvalid,
            RedeemRejection::AccountNotRegistered => EngineError::NotFound(rejection.reason()),
            other => EngineError::Conflict(other.reason()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RedeemOutcome {
    Redeemed(Redemption),
    Rejected(RedeemRejection),
}

impl RedeemOutcome {
    pub fn is_redeemed(&self) -> bool {
        matches!(self, RedeemOutcome::Redeemed(_))
    }

    pub fn rejection(&self) -> Option<&RedeemRejection> {
        match self {
            RedeemOutcome::Rejected(r) => Some(r),
            RedeemOutcome::Redeemed(_) => None,
        }
    }
}

/// Display data for a key; never names the bound account
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub code: String,
    pub plan_name: String,
    pub plan_description: String,
    pub quota_ceiling: i64,
    pub window_days: i64,
    pub used: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyInfo {
    fn new(key: ActivationKey, plan: Plan) -> Self {
        Self {
            code: key.code,
            plan_name: plan.name,
            plan_description: plan.description,
            quota_ceiling: plan.quota_ceiling,
            window_days: plan.window_days,
            used: key.used,
            created_at: key.created_at,
            expires_at: key.expires_at,
        }
    }
}

/// Key currently bound to an account
#[derive(Debug, Clone, Serialize)]
pub struct BoundKey {
    pub key: ActivationKey,
    pub plan: Plan,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevokeResult {
    pub key_id: i64,
    pub code: String,
    /// Account the key was bound to, if any
    pub released_account_id: Option<i64>,
    pub account_downgraded: bool,
}

/// Append a subscription history row on the caller's transaction
pub(crate) async fn append_event(
    conn: &mut SqliteConnection,
    account_id: i64,
    plan_id: i64,
    key_id: Option<i64>,
    transition: Transition,
    window_start: NaiveDate,
    window_end: NaiveDate,
) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO subscription_events
        (account_id, plan_id, key_id, transition, window_start, window_end, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(account_id)
    .bind(plan_id)
    .bind(key_id)
    .bind(transition.as_str())
    .bind(window_start)
    .bind(window_end)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Redemption engine
#[derive(Clone)]
pub struct RedemptionEngine {
    db: SqlitePool,
    catalog: PlanCatalog,
    store_timeout: Duration,
}

impl RedemptionEngine {
    pub fn new(db: SqlitePool, catalog: PlanCatalog, store_timeout: Duration) -> Self {
        Self {
            db,
            catalog,
            store_timeout,
        }
    }

    async fn find_key(&self, code: &str) -> EngineResult<Option<ActivationKey>> {
        let key = sqlx::query_as::<_, ActivationKey>(&format!(
            "SELECT {} FROM activation_keys WHERE code = ?",
            KEY_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.db)
        .await?;

        Ok(key)
    }

    async fn find_key_by_id(&self, id: i64) -> EngineResult<Option<ActivationKey>> {
        let key = sqlx::query_as::<_, ActivationKey>(&format!(
            "SELECT {} FROM activation_keys WHERE id = ?",
            KEY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(key)
    }

    async fn plan_for(&self, key: &ActivationKey) -> EngineResult<Plan> {
        self.catalog.get_plan(key.plan_id).await?.ok_or_else(|| {
            EngineError::StateCorruption(format!(
                "activation key {} references missing plan {}",
                key.id, key.plan_id
            ))
        })
    }

    async fn account_binding(&self, account_id: i64) -> EngineResult<Option<Option<i64>>> {
        let binding: Option<Option<i64>> =
            sqlx::query_scalar("SELECT bound_key_id FROM accounts WHERE id = ?")
                .bind(account_id)
                .fetch_optional(&self.db)
                .await?;

        Ok(binding)
    }

    fn classify_bound(key: &ActivationKey, account_id: i64) -> RedeemRejection {
        if key.bound_account_id == Some(account_id) {
            RedeemRejection::AlreadyBoundToSelf
        } else {
            RedeemRejection::BoundToOther
        }
    }

    /// Bind `code` to `account_id` and activate the key's plan
    pub async fn redeem(&self, account_id: i64, code: &str) -> EngineResult<RedeemOutcome> {
        let outcome = self.redeem_inner(account_id, code).await?;

        match &outcome {
            RedeemOutcome::Redeemed(r) => {
                metrics::record_redemption("redeemed");
                tracing::info!(
                    account_id,
                    key_id = r.key_id,
                    plan = %r.plan_name,
                    window_end = %r.window_end,
                    "Activation key redeemed"
                );
            }
            RedeemOutcome::Rejected(rejection) => {
                metrics::record_redemption(rejection.code());
                tracing::debug!(account_id, outcome = rejection.code(), "Redemption rejected");
            }
        }

        Ok(outcome)
    }

    async fn redeem_inner(&self, account_id: i64, code: &str) -> EngineResult<RedeemOutcome> {
        let code = match keys::parse_code(code) {
            Ok(code) => code,
            Err(e) => return Ok(RedeemOutcome::Rejected(RedeemRejection::Malformed(e))),
        };

        let key = match self.find_key(&code).await? {
            Some(key) if !key.is_expired(Utc::now()) => key,
            _ => return Ok(RedeemOutcome::Rejected(RedeemRejection::InvalidOrExpired)),
        };
        key.ensure_consistent()?;

        if key.used {
            return Ok(RedeemOutcome::Rejected(Self::classify_bound(&key, account_id)));
        }

        match self.account_binding(account_id).await? {
            None => return Ok(RedeemOutcome::Rejected(RedeemRejection::AccountNotRegistered)),
            Some(Some(_)) => return Ok(RedeemOutcome::Rejected(RedeemRejection::AlreadyHasKey)),
            Some(None) => {}
        }

        let plan = self.plan_for(&key).await?;
        let today = Utc::now().date_naive();
        let (window_start, window_end) = plan.window_from(today);

        let committed = db::with_timeout(self.store_timeout, async {
            let mut tx = self.db.begin().await?;
            let now = Utc::now();

            let claimed = sqlx::query(
                r#"
                UPDATE activation_keys
                SET used = 1, bound_account_id = ?, bound_at = ?
                WHERE id = ? AND used = 0
                "#,
            )
            .bind(account_id)
            .bind(now)
            .bind(key.id)
            .execute(&mut *tx)
            .await?;

            if claimed.rows_affected() == 0 {
                return Ok(false);
            }

            let bound = sqlx::query(
                r#"
                UPDATE accounts
                SET plan_id = ?, bound_key_id = ?, quota_limit = ?, used_count = 0,
                    window_start = ?, window_end = ?, updated_at = ?
                WHERE id = ? AND bound_key_id IS NULL
                "#,
            )
            .bind(plan.id)
            .bind(key.id)
            .bind(plan.quota_ceiling)
            .bind(window_start)
            .bind(window_end)
            .bind(now)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

            if bound.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            append_event(
                &mut tx,
                account_id,
                plan.id,
                Some(key.id),
                Transition::Redemption,
                window_start,
                window_end,
            )
            .await?;

            tx.commit().await?;
            Ok(true)
        })
        .await?;

        if committed {
            return Ok(RedeemOutcome::Redeemed(Redemption {
                key_id: key.id,
                plan_name: plan.name,
                quota_ceiling: plan.quota_ceiling,
                window_start,
                window_end,
            }));
        }

        // Lost a race; re-read to report what the winner left behind
        if let Some(current) = self.find_key_by_id(key.id).await? {
            if current.used {
                current.ensure_consistent()?;
                return Ok(RedeemOutcome::Rejected(Self::classify_bound(&current, account_id)));
            }
        }

        let rejection = match self.account_binding(account_id).await? {
            None => RedeemRejection::AccountNotRegistered,
            Some(Some(_)) => RedeemRejection::AlreadyHasKey,
            Some(None) => RedeemRejection::BoundToOther,
        };
        Ok(RedeemOutcome::Rejected(rejection))
    }

    /// Return an account to the free plan; the released key stays used
    pub async fn deactivate(&self, account_id: i64) -> EngineResult<bool> {
        let Some(binding) = self.account_binding(account_id).await? else {
            return Err(EngineError::NotFound(format!("Account {} not found", account_id)));
        };
        let Some(key_id) = binding else {
            return Ok(false);
        };

        let free = self.catalog.free_plan().await?;
        let today = Utc::now().date_naive();

        let downgraded = db::with_timeout(self.store_timeout, async {
            let mut tx = self.db.begin().await?;
            let downgraded = ledger::downgrade_to_free(
                &mut tx,
                account_id,
                &free,
                Some(key_id),
                today,
                DowngradeGuard::HasKey,
                Transition::Deactivation,
            )
            .await?;

            if downgraded {
                tx.commit().await?;
            }
            Ok(downgraded)
        })
        .await?;

        if downgraded {
            tracing::info!(account_id, key_id, "Subscription deactivated");
        }

        Ok(downgraded)
    }

    /// Administrative revoke: downgrade the bound account and free the key
    pub async fn revoke_key(&self, code: &str) -> EngineResult<RevokeResult> {
        let code = keys::parse_code(code)?;
        let key = self
            .find_key(&code)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Key {} not found", code)))?;
        key.ensure_consistent()?;

        let Some(bound_account) = key.bound_account_id else {
            return Ok(RevokeResult {
                key_id: key.id,
                code: key.code,
                released_account_id: None,
                account_downgraded: false,
            });
        };

        let free = self.catalog.free_plan().await?;
        let today = Utc::now().date_naive();

        let downgraded = db::with_timeout(self.store_timeout, async {
            let mut tx = self.db.begin().await?;

            let reset = sqlx::query(
                r#"
                UPDATE activation_keys
                SET used = 0, bound_account_id = NULL, bound_at = NULL
                WHERE id = ? AND used = 1 AND bound_account_id = ?
                "#,
            )
            .bind(key.id)
            .bind(bound_account)
            .execute(&mut *tx)
            .await?;

            if reset.rows_affected() == 0 {
                return Err(EngineError::Conflict(format!(
                    "Key {} changed state during revoke",
                    key.code
                )));
            }

            let current: Option<Option<i64>> =
                sqlx::query_scalar("SELECT bound_key_id FROM accounts WHERE id = ?")
                    .bind(bound_account)
                    .fetch_optional(&mut *tx)
                    .await?;

            let downgraded = match current {
                None => {
                    tracing::warn!(
                        key_id = key.id,
                        account_id = bound_account,
                        "Revoked key was bound to a missing account"
                    );
                    false
                }
                Some(None) => {
                    // Already released back to the free tier; plan and quota stay as they are
                    tracing::debug!(
                        key_id = key.id,
                        account_id = bound_account,
                        "Revoked key was already released by its account"
                    );
                    false
                }
                Some(current_key) => {
                    if current_key != Some(key.id) {
                        tracing::warn!(
                            key_id = key.id,
                            account_id = bound_account,
                            current_key = ?current_key,
                            "Account binding moved since redemption; downgrading anyway"
                        );
                    }
                    ledger::downgrade_to_free(
                        &mut tx,
                        bound_account,
                        &free,
                        Some(key.id),
                        today,
                        DowngradeGuard::Force,
                        Transition::Revocation,
                    )
                    .await?
                }
            };

            tx.commit().await?;
            Ok(downgraded)
        })
        .await?;

        metrics::KEY_REVOCATIONS_TOTAL.inc();
        tracing::info!(
            key_id = key.id,
            account_id = bound_account,
            downgraded,
            "Activation key revoked"
        );

        Ok(RevokeResult {
            key_id: key.id,
            code: key.code,
            released_account_id: Some(bound_account),
            account_downgraded: downgraded,
        })
    }

    /// Read-only structural, existence and expiry check
    pub async fn validate(&self, code: &str) -> EngineResult<KeyInfo> {
        let code = keys::parse_code(code)?;
        let key = self.find_key(&code).await?;
        self.key_info(key).await
    }

    /// Look a key up by its SHA-256 digest
    pub async fn validate_by_hash(&self, code_hash: &str) -> EngineResult<KeyInfo> {
        let code_hash = code_hash.trim().to_ascii_lowercase();
        if code_hash.len() != 64 || !code_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EngineError::MalformedInput(
                "Key hash must be 64 hexadecimal characters".to_string(),
            ));
        }

        let key = sqlx::query_as::<_, ActivationKey>(&format!(
            "SELECT {} FROM activation_keys WHERE code_hash = ?",
            KEY_COLUMNS
        ))
        .bind(&code_hash)
        .fetch_optional(&self.db)
        .await?;

        self.key_info(key).await
    }

    async fn key_info(&self, key: Option<ActivationKey>) -> EngineResult<KeyInfo> {
        let key = match key {
            Some(key) if !key.is_expired(Utc::now()) => key,
            _ => return Err(EngineError::ExpiredOrInvalid),
        };
        key.ensure_consistent()?;
        let plan = self.plan_for(&key).await?;
        Ok(KeyInfo::new(key, plan))
    }

    /// Key and plan currently bound to an account
    pub async fn bound_key(&self, account_id: i64) -> EngineResult<Option<BoundKey>> {
        let Some(Some(key_id)) = self.account_binding(account_id).await? else {
            return Ok(None);
        };

        let key = self.find_key_by_id(key_id).await?.ok_or_else(|| {
            EngineError::StateCorruption(format!(
                "account {} references missing key {}",
                account_id, key_id
            ))
        })?;

        if key.bound_account_id != Some(account_id) {
            tracing::error!(
                account_id,
                key_id,
                key_bound_to = ?key.bound_account_id,
                "account/key binding invariant violated"
            );
            return Err(EngineError::StateCorruption(format!(
                "account {} holds key {} bound to {:?}",
                account_id, key_id, key.bound_account_id
            )));
        }

        let plan = self.plan_for(&key).await?;
        Ok(Some(BoundKey { key, plan }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IssuanceConfig;
    use crate::db::test_pool;
    use crate::keys::KeyIssuer;
    use crate::ledger::AccountLedger;

    struct Fixture {
        engine: RedemptionEngine,
        ledger: AccountLedger,
        issuer: KeyIssuer,
        db: SqlitePool,
    }

    async fn setup() -> Fixture {
        let db = test_pool().await;
        let catalog = PlanCatalog::new(db.clone());
        catalog.seed_defaults().await.unwrap();
        let timeout = Duration::from_secs(5);
        Fixture {
            engine: RedemptionEngine::new(db.clone(), catalog.clone(), timeout),
            ledger: AccountLedger::new(db.clone(), catalog.clone(), vec![], timeout),
            issuer: KeyIssuer::new(db.clone(), catalog, IssuanceConfig::default(), timeout),
            db,
        }
    }

    async fn issue(f: &Fixture, plan: &str) -> String {
        f.issuer.issue_keys(plan, 1, 30).await.unwrap().codes.remove(0)
    }

    fn rejection(outcome: RedeemOutcome) -> RedeemRejection {
        match outcome {
            RedeemOutcome::Rejected(r) => r,
            RedeemOutcome::Redeemed(r) => panic!("unexpected redemption {:?}", r),
        }
    }

    #[tokio::test]
    async fn test_redeem_binds_key_and_activates_plan() {
        let f = setup().await;
        let code = issue(&f, "PRO").await;
        f.ledger.get_or_create(1, "Alice", None).await.unwrap();
        f.ledger.increment_usage(1).await.unwrap();

        let outcome = f.engine.redeem(1, &code.to_lowercase()).await.unwrap();
        let RedeemOutcome::Redeemed(redemption) = outcome else {
            panic!("expected redemption");
        };
        assert_eq!(redemption.plan_name, "PRO");
        assert_eq!(redemption.quota_ceiling, 2000);
        assert_eq!((redemption.window_end - redemption.window_start).num_days(), 30);

        let account = f.ledger.get_account(1).await.unwrap().unwrap();
        assert_eq!(account.bound_key_id, Some(redemption.key_id));
        assert_eq!(account.quota_limit, 2000);
        assert_eq!(account.used_count, 0);

        let bound = f.engine.bound_key(1).await.unwrap().unwrap();
        assert!(bound.key.used);
        assert_eq!(bound.key.bound_account_id, Some(1));
        assert!(bound.key.bound_at.is_some());
        assert_eq!(bound.plan.name, "PRO");

        let events: Vec<(String, Option<i64>)> =
            sqlx::query_as("SELECT transition, key_id FROM subscription_events WHERE account_id = 1")
                .fetch_all(&f.db)
                .await
                .unwrap();
        assert_eq!(events, vec![("redemption".to_string(), Some(redemption.key_id))]);
    }

    #[tokio::test]
    async fn test_redeem_rejections() {
        let f = setup().await;
        let code = issue(&f, "BASIC").await;
        f.ledger.get_or_create(1, "Alice", None).await.unwrap();
        f.ledger.get_or_create(2, "Bob", None).await.unwrap();

        assert!(matches!(
            rejection(f.engine.redeem(1, "short").await.unwrap()),
            RedeemRejection::Malformed(_)
        ));
        assert_eq!(
            rejection(f.engine.redeem(1, "AAAA-BBBB-CCCC-DDDD").await.unwrap()),
            RedeemRejection::InvalidOrExpired
        );
        assert_eq!(
            rejection(f.engine.redeem(3, &code).await.unwrap()),
            RedeemRejection::AccountNotRegistered
        );

        assert!(f.engine.redeem(1, &code).await.unwrap().is_redeemed());

        assert_eq!(
            rejection(f.engine.redeem(1, &code).await.unwrap()),
            RedeemRejection::AlreadyBoundToSelf
        );
        assert_eq!(
            rejection(f.engine.redeem(2, &code).await.unwrap()),
            RedeemRejection::BoundToOther
        );

        let second = issue(&f, "PRO").await;
        assert_eq!(
            rejection(f.engine.redeem(1, &second).await.unwrap()),
            RedeemRejection::AlreadyHasKey
        );
        let key: (bool, Option<i64>) =
            sqlx::query_as("SELECT used, bound_account_id FROM activation_keys WHERE code = ?")
                .bind(&second)
                .fetch_one(&f.db)
                .await
                .unwrap();
        assert_eq!(key, (false, None));
    }

    #[tokio::test]
    async fn test_unregistered_account_leaves_key_redeemable() {
        let f = setup().await;
        let code = issue(&f, "BASIC").await;

        assert_eq!(
            rejection(f.engine.redeem(5, &code).await.unwrap()),
            RedeemRejection::AccountNotRegistered
        );

        f.ledger.get_or_create(5, "Eve", None).await.unwrap();
        assert!(f.engine.redeem(5, &code).await.unwrap().is_redeemed());
    }

    #[tokio::test]
    async fn test_expired_key_is_dead() {
        let f = setup().await;
        let code = issue(&f, "BASIC").await;
        f.ledger.get_or_create(1, "Alice", None).await.unwrap();

        sqlx::query("UPDATE activation_keys SET expires_at = ? WHERE code = ?")
            .bind(Utc::now() - chrono::Duration::days(1))
            .bind(&code)
            .execute(&f.db)
            .await
            .unwrap();

        assert_eq!(
            rejection(f.engine.redeem(1, &code).await.unwrap()),
            RedeemRejection::InvalidOrExpired
        );
        assert!(matches!(
            f.engine.validate(&code).await,
            Err(EngineError::ExpiredOrInvalid)
        ));
    }

    #[tokio::test]
    async fn test_deactivate_keeps_key_used() {
        let f = setup().await;
        let code = issue(&f, "PRO").await;
        f.ledger.get_or_create(1, "Alice", None).await.unwrap();

        assert!(!f.engine.deactivate(1).await.unwrap());
        assert!(f.engine.redeem(1, &code).await.unwrap().is_redeemed());
        f.ledger.increment_usage(1).await.unwrap();

        assert!(f.engine.deactivate(1).await.unwrap());
        assert!(!f.engine.deactivate(1).await.unwrap());

        let account = f.ledger.get_account(1).await.unwrap().unwrap();
        assert_eq!(account.bound_key_id, None);
        assert_eq!(account.quota_limit, 50);
        assert_eq!(account.used_count, 0);

        let info = f.engine.validate(&code).await.unwrap();
        assert!(info.used);

        assert!(matches!(
            f.engine.deactivate(77).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_revoke_frees_key() {
        let f = setup().await;
        let code = issue(&f, "PREMIUM").await;
        f.ledger.get_or_create(1, "Alice", None).await.unwrap();
        f.ledger.get_or_create(2, "Bob", None).await.unwrap();
        f.engine.redeem(1, &code).await.unwrap();

        let result = f.engine.revoke_key(&code).await.unwrap();
        assert_eq!(result.released_account_id, Some(1));
        assert!(result.account_downgraded);

        let alice = f.ledger.get_account(1).await.unwrap().unwrap();
        assert_eq!(alice.bound_key_id, None);
        assert_eq!(alice.quota_limit, 50);

        assert!(f.engine.redeem(2, &code).await.unwrap().is_redeemed());

        let transitions: Vec<String> = sqlx::query_scalar(
            "SELECT transition FROM subscription_events WHERE account_id = 1 ORDER BY id",
        )
        .fetch_all(&f.db)
        .await
        .unwrap();
        assert_eq!(transitions, vec!["redemption", "revocation"]);
    }

    #[tokio::test]
    async fn test_revoke_after_deactivate_forces_free_plan() {
        let f = setup().await;
        let first = issue(&f, "BASIC").await;
        let second = issue(&f, "PRO").await;
        f.ledger.get_or_create(1, "Alice", None).await.unwrap();

        f.engine.redeem(1, &first).await.unwrap();
        f.engine.deactivate(1).await.unwrap();
        f.engine.redeem(1, &second).await.unwrap();

        let result = f.engine.revoke_key(&first).await.unwrap();
        assert!(result.account_downgraded);

        let alice = f.ledger.get_account(1).await.unwrap().unwrap();
        assert_eq!(alice.bound_key_id, None);
        assert_eq!(alice.quota_limit, 50);
    }

    #[tokio::test]
    async fn test_revoke_released_key_keeps_free_quota() {
        let f = setup().await;
        let code = issue(&f, "BASIC").await;
        f.ledger.get_or_create(1, "Alice", None).await.unwrap();

        f.engine.redeem(1, &code).await.unwrap();
        f.engine.deactivate(1).await.unwrap();
        for _ in 0..40 {
            f.ledger.increment_usage(1).await.unwrap();
        }
        let before = f.ledger.get_account(1).await.unwrap().unwrap();

        let result = f.engine.revoke_key(&code).await.unwrap();
        assert_eq!(result.released_account_id, Some(1));
        assert!(!result.account_downgraded);

        let after = f.ledger.get_account(1).await.unwrap().unwrap();
        assert_eq!(after.used_count, 40);
        assert_eq!(after.plan_id, before.plan_id);
        assert_eq!(after.window_start, before.window_start);
        assert_eq!(after.window_end, before.window_end);

        let transitions: Vec<String> = sqlx::query_scalar(
            "SELECT transition FROM subscription_events WHERE account_id = 1 ORDER BY id",
        )
        .fetch_all(&f.db)
        .await
        .unwrap();
        assert_eq!(transitions, vec!["redemption", "deactivation"]);

        assert!(!f.engine.validate(&code).await.unwrap().used);
    }

    #[tokio::test]
    async fn test_revoke_unbound_and_unknown() {
        let f = setup().await;
        let code = issue(&f, "BASIC").await;

        let result = f.engine.revoke_key(&code).await.unwrap();
        assert_eq!(result.released_account_id, None);
        assert!(!result.account_downgraded);

        assert!(matches!(
            f.engine.revoke_key("AAAA-BBBB-CCCC-DDDD").await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            f.engine.revoke_key("nope").await,
            Err(EngineError::MalformedInput(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_paths() {
        let f = setup().await;
        let code = issue(&f, "ENTERPRISE").await;

        let info = f.engine.validate(&code).await.unwrap();
        assert_eq!(info.plan_name, "ENTERPRISE");
        assert!(!info.used);

        let by_hash = f
            .engine
            .validate_by_hash(&keys::digest(&code).to_uppercase())
            .await
            .unwrap();
        assert_eq!(by_hash.code, code);

        assert!(matches!(
            f.engine.validate("ABCD").await,
            Err(EngineError::MalformedInput(_))
        ));
        assert!(matches!(
            f.engine.validate_by_hash("xyz").await,
            Err(EngineError::MalformedInput(_))
        ));
        assert!(matches!(
            f.engine.validate_by_hash(&keys::digest("AAAA-BBBB-CCCC-DDDD")).await,
            Err(EngineError::ExpiredOrInvalid)
        ));

        let keys: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM activation_keys WHERE used = 1")
            .fetch_one(&f.db)
            .await
            .unwrap();
        assert_eq!(keys, 0);
    }

    #[tokio::test]
    async fn test_corrupt_key_is_refused() {
        let f = setup().await;
        let code = issue(&f, "BASIC").await;
        f.ledger.get_or_create(1, "Alice", None).await.unwrap();

        sqlx::query("UPDATE activation_keys SET used = 1 WHERE code = ?")
            .bind(&code)
            .execute(&f.db)
            .await
            .unwrap();

        assert!(matches!(
            f.engine.redeem(1, &code).await,
            Err(EngineError::StateCorruption(_))
        ));
        assert!(matches!(
            f.engine.revoke_key(&code).await,
            Err(EngineError::StateCorruption(_))
        ));
    }

    #[test]
    fn test_rejection_mapping() {
        assert!(matches!(
            EngineError::from(RedeemRejection::BoundToOther),
            EngineError::Conflict(_)
        ));
        assert!(matches!(
            EngineError::from(RedeemRejection::InvalidOrExpired),
            EngineError::ExpiredOrInvalid
        ));
        assert!(matches!(
            EngineError::from(RedeemRejection::AccountNotRegistered),
            EngineError::NotFound(_)
        ));
        assert_eq!(RedeemRejection::AlreadyHasKey.kind(), "Conflict");
        assert_ne!(
            RedeemRejection::AlreadyBoundToSelf.reason(),
            RedeemRejection::BoundToOther.reason()
        );
    }
}
