/// Application context and dependency injection
use crate::{
    catalog::PlanCatalog,
    config::ServerConfig,
    db,
    error::EngineResult,
    keys::KeyIssuer,
    ledger::AccountLedger,
    rate_limit::{RateLimitConfig, RateLimiter},
    redemption::RedemptionEngine,
    sweeper::ExpirySweeper,
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub catalog: Arc<PlanCatalog>,
    pub issuer: Arc<KeyIssuer>,
    pub redemption: Arc<RedemptionEngine>,
    pub ledger: Arc<AccountLedger>,
    pub sweeper: Arc<ExpirySweeper>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> EngineResult<Self> {
        config.validate()?;

        let options = db::DatabaseOptions {
            max_connections: config.storage.max_connections,
            enable_wal: config.storage.enable_wal,
            ..db::DatabaseOptions::default()
        };
        let pool = db::create_pool(&config.storage.database_path, options).await?;

        db::run_migrations(&pool).await?;
        db::test_connection(&pool).await?;

        Self::with_pool(config, pool).await
    }

    /// Build the services over an already migrated pool and seed the catalog
    pub async fn with_pool(config: ServerConfig, pool: SqlitePool) -> EngineResult<Self> {
        let store_timeout = config.storage.store_timeout();

        let catalog = PlanCatalog::new(pool.clone());
        catalog.seed_defaults().await?;

        let issuer = KeyIssuer::new(
            pool.clone(),
            catalog.clone(),
            config.issuance.clone(),
            store_timeout,
        );
        let redemption = RedemptionEngine::new(pool.clone(), catalog.clone(), store_timeout);
        let ledger = AccountLedger::new(
            pool.clone(),
            catalog.clone(),
            config.auth.bootstrap_admin_ids.clone(),
            store_timeout,
        );
        let sweeper = ExpirySweeper::new(pool.clone(), catalog.clone(), store_timeout);

        let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig::from(&config.rate_limit)));

        Ok(Self {
            config: Arc::new(config),
            db: pool,
            catalog: Arc::new(catalog),
            issuer: Arc::new(issuer),
            redemption: Arc::new(redemption),
            ledger: Arc::new(ledger),
            sweeper: Arc::new(sweeper),
            rate_limiter,
        })
    }

    /// Get service URL
    pub fn service_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }
}
