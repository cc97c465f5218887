/// Configuration management for Tollgate
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub issuance: IssuanceConfig,
    pub jobs: JobsConfig,
    pub rate_limit: RateLimitSettings,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub version: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,
    pub enable_wal: bool,
    /// Upper bound for a single transactional store operation, in seconds
    pub store_timeout_secs: u64,
}

impl StorageConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

/// Longest validity an issued key may carry, in days
pub const MAX_VALIDITY_DAYS: u32 = 36_500;

/// Key issuance limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceConfig {
    pub max_keys_per_request: u32,
    pub max_attempts_per_key: u32,
    /// 0 means issued keys never expire
    pub default_validity_days: u32,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            max_keys_per_request: 100,
            max_attempts_per_key: 10,
            default_validity_days: 365,
        }
    }
}

/// Background job intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub sweep_interval_secs: u64,
    pub health_check_interval_secs: u64,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub requests_per_second: u32,
    pub burst_size: u32,
}

/// Credentials for the non-public HTTP surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared token the chat front end presents on /bot routes
    pub bot_api_token: Option<String>,
    /// Accounts treated as privileged regardless of their stored flag
    pub bootstrap_admin_ids: Vec<i64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> EngineResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("TOLLGATE_HOSTNAME").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("TOLLGATE_PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .map_err(|_| EngineError::Validation("Invalid port number".to_string()))?;
        let version = env::var("TOLLGATE_VERSION")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

        let database_path = env::var("TOLLGATE_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/database.sqlite"));
        let max_connections = env::var("TOLLGATE_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);
        let enable_wal = env::var("TOLLGATE_DB_WAL")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);
        let store_timeout_secs = env::var("TOLLGATE_STORE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let defaults = IssuanceConfig::default();
        let max_keys_per_request = env::var("TOLLGATE_MAX_KEYS_PER_REQUEST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_keys_per_request);
        let max_attempts_per_key = env::var("TOLLGATE_KEY_GENERATION_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_attempts_per_key);
        let default_validity_days = env::var("TOLLGATE_KEY_VALIDITY_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.default_validity_days);

        let sweep_interval_secs = env::var("TOLLGATE_SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse()
            .unwrap_or(86400);
        let health_check_interval_secs = env::var("TOLLGATE_HEALTH_CHECK_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let rate_limit_enabled = env::var("TOLLGATE_RATE_LIMITS_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);
        let requests_per_second = env::var("TOLLGATE_RATE_LIMIT_RPS")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .unwrap_or(50);
        let burst_size = env::var("TOLLGATE_RATE_LIMIT_BURST")
            .unwrap_or_else(|_| "25".to_string())
            .parse()
            .unwrap_or(25);

        let bot_api_token = env::var("TOLLGATE_BOT_API_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty());

        // ADMIN_ID is accepted for compatibility with existing bot deployments
        let bootstrap_admin_ids = env::var("TOLLGATE_ADMIN_IDS")
            .or_else(|_| env::var("ADMIN_ID"))
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<i64>()
                    .map_err(|_| EngineError::Validation(format!("Invalid admin id: {}", s)))
            })
            .collect::<EngineResult<Vec<i64>>>()?;

        let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                version,
            },
            storage: StorageConfig {
                database_path,
                max_connections,
                enable_wal,
                store_timeout_secs,
            },
            issuance: IssuanceConfig {
                max_keys_per_request,
                max_attempts_per_key,
                default_validity_days,
            },
            jobs: JobsConfig {
                sweep_interval_secs,
                health_check_interval_secs,
            },
            rate_limit: RateLimitSettings {
                enabled: rate_limit_enabled,
                requests_per_second,
                burst_size,
            },
            auth: AuthConfig {
                bot_api_token,
                bootstrap_admin_ids,
            },
            logging: LoggingConfig { level: log_level },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> EngineResult<()> {
        if self.service.hostname.is_empty() {
            return Err(EngineError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.storage.max_connections == 0 {
            return Err(EngineError::Validation(
                "Database pool needs at least one connection".to_string(),
            ));
        }

        if self.storage.store_timeout_secs == 0 {
            return Err(EngineError::Validation(
                "Store timeout must be at least one second".to_string(),
            ));
        }

        if self.issuance.max_keys_per_request == 0 || self.issuance.max_attempts_per_key == 0 {
            return Err(EngineError::Validation(
                "Issuance limits must be positive".to_string(),
            ));
        }

        if self.issuance.default_validity_days > MAX_VALIDITY_DAYS {
            return Err(EngineError::Validation(format!(
                "Key validity cannot exceed {} days",
                MAX_VALIDITY_DAYS
            )));
        }

        if self.jobs.sweep_interval_secs == 0 || self.jobs.health_check_interval_secs == 0 {
            return Err(EngineError::Validation(
                "Job intervals must be positive".to_string(),
            ));
        }

        if let Some(token) = &self.auth.bot_api_token {
            if token.len() < 16 {
                return Err(EngineError::Validation(
                    "Bot API token must be at least 16 characters".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Configuration suitable for tests and local tooling
    pub fn for_database(database_path: PathBuf) -> Self {
        ServerConfig {
            service: ServiceConfig {
                hostname: "127.0.0.1".to_string(),
                port: 8000,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            storage: StorageConfig {
                database_path,
                max_connections: 10,
                enable_wal: true,
                store_timeout_secs: 5,
            },
            issuance: IssuanceConfig::default(),
            jobs: JobsConfig {
                sweep_interval_secs: 86400,
                health_check_interval_secs: 300,
            },
            rate_limit: RateLimitSettings {
                enabled: false,
                requests_per_second: 50,
                burst_size: 25,
            },
            auth: AuthConfig {
                bot_api_token: None,
                bootstrap_admin_ids: vec![],
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}
