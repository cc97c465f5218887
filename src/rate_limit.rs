/// Rate Limiting System
use crate::{
    api::middleware::has_credentials,
    config::RateLimitSettings,
    context::AppContext,
    error::{EngineError, EngineResult},
};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::{num::NonZeroU32, sync::Arc, time::Duration};

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests per second for callers presenting a credential
    pub credentialed_rps: u32,
    /// Requests per second for anonymous callers
    pub anonymous_rps: u32,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            credentialed_rps: 50,
            anonymous_rps: 10,
            burst_size: 25,
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            enabled: settings.enabled,
            credentialed_rps: settings.requests_per_second,
            anonymous_rps: (settings.requests_per_second / 5).max(1),
            burst_size: settings.burst_size,
        }
    }
}

fn nonzero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

/// Rate limiter manager
#[derive(Clone)]
pub struct RateLimiter {
    enabled: bool,
    credentialed: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    anonymous: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let credentialed_quota = Quota::per_second(nonzero(config.credentialed_rps))
            .allow_burst(nonzero(config.burst_size));
        let anonymous_quota = Quota::per_second(nonzero(config.anonymous_rps))
            .allow_burst(nonzero(config.burst_size / 5));

        Self {
            enabled: config.enabled,
            credentialed: Arc::new(GovernorLimiter::direct(credentialed_quota)),
            anonymous: Arc::new(GovernorLimiter::direct(anonymous_quota)),
        }
    }

    fn exceeded() -> EngineError {
        EngineError::RateLimitExceeded {
            retry_after: Duration::from_secs(1),
        }
    }

    pub fn check_credentialed(&self) -> EngineResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.credentialed.check().map_err(|_| Self::exceeded())
    }

    pub fn check_anonymous(&self) -> EngineResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.anonymous.check().map_err(|_| Self::exceeded())
    }
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(ctx): State<AppContext>,
    request: Request,
    next: Next,
) -> Result<Response, EngineError> {
    if has_credentials(request.headers()) {
        ctx.rate_limiter.check_credentialed()?;
    } else {
        ctx.rate_limiter.check_anonymous()?;
    }

    Ok(next.run(request).await)
}
