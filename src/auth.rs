/// Authentication extractors
use crate::{
    api::middleware::{extract_access_key, extract_bot_token},
    context::AppContext,
    db::models::Account,
    error::EngineError,
};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use sha2::{Digest, Sha256};

/// Account resolved from its access key
#[derive(Debug, Clone)]
pub struct AccessKeyAccount {
    pub account: Account,
}

#[async_trait]
impl FromRequestParts<AppContext> for AccessKeyAccount {
    type Rejection = EngineError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let key = extract_access_key(&parts.headers)
            .ok_or_else(|| EngineError::Authentication("Missing access key".to_string()))?;

        let account = state
            .ledger
            .get_account_by_access_key(&key)
            .await?
            .ok_or_else(|| EngineError::NotFound("Unknown access key".to_string()))?;

        Ok(AccessKeyAccount { account })
    }
}

/// Account allowed to run administrative operations
#[derive(Debug, Clone)]
pub struct PrivilegedAccount {
    pub account: Account,
}

#[async_trait]
impl FromRequestParts<AppContext> for PrivilegedAccount {
    type Rejection = EngineError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let key = extract_access_key(&parts.headers)
            .ok_or_else(|| EngineError::Authentication("Missing access key".to_string()))?;

        let account = state
            .ledger
            .get_account_by_access_key(&key)
            .await?
            .ok_or_else(|| EngineError::Authentication("Invalid access key".to_string()))?;

        let account = state.ledger.require_privileged(account.id).await.map_err(|e| {
            tracing::warn!(account_id = account.id, "Admin request from unprivileged account");
            e
        })?;

        Ok(PrivilegedAccount { account })
    }
}

/// Chat front end presenting the shared bot token
#[derive(Debug, Clone, Copy)]
pub struct BotGateway;

#[async_trait]
impl FromRequestParts<AppContext> for BotGateway {
    type Rejection = EngineError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let expected = state.config.auth.bot_api_token.as_deref().ok_or_else(|| {
            EngineError::Authorization("Bot gateway is not configured".to_string())
        })?;

        let presented = extract_bot_token(&parts.headers)
            .ok_or_else(|| EngineError::Authentication("Missing bot token".to_string()))?;

        if !tokens_match(&presented, expected) {
            tracing::warn!("Rejected bot gateway request with invalid token");
            return Err(EngineError::Authentication("Invalid bot token".to_string()));
        }

        Ok(BotGateway)
    }
}

/// Compare digests of both tokens without short-circuiting on the first mismatch
fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("bot-token-0123456789", "bot-token-0123456789"));
        assert!(!tokens_match("bot-token-0123456788", "bot-token-0123456789"));
        assert!(!tokens_match("bot-token", "bot-token-0123456789"));
        assert!(!tokens_match("", "bot-token-0123456789"));
    }
}
