/// Row models for the entitlement schema
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Subscription tier
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub price: f64,
    /// Maximum requests per quota window
    pub quota_ceiling: i64,
    pub window_days: i64,
    pub max_keys_per_plan: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Window bounds for a subscription starting on `start`
    pub fn window_from(&self, start: NaiveDate) -> (NaiveDate, NaiveDate) {
        (start, start + Duration::days(self.window_days))
    }
}

/// Single-use activation key
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ActivationKey {
    pub id: i64,
    pub plan_id: i64,
    pub code: String,
    pub code_hash: String,
    pub used: bool,
    pub bound_account_id: Option<i64>,
    pub bound_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ActivationKey {
    /// An unredeemed key past its expiry is dead
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// `used` must be set exactly when a bound account is recorded
    pub fn ensure_consistent(&self) -> EngineResult<()> {
        if self.used != self.bound_account_id.is_some() {
            tracing::error!(
                key_id = self.id,
                used = self.used,
                bound_account_id = ?self.bound_account_id,
                "activation key used/bound invariant violated"
            );
            return Err(EngineError::StateCorruption(format!(
                "activation key {} has used={} but bound_account_id={:?}",
                self.id, self.used, self.bound_account_id
            )));
        }
        Ok(())
    }
}

/// Per-account subscription and quota state
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Account {
    /// External identity (chat platform user id)
    pub id: i64,
    pub display_name: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub access_key: String,
    pub plan_id: i64,
    pub bound_key_id: Option<i64>,
    pub used_count: i64,
    pub quota_limit: i64,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub active: bool,
    pub is_privileged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cause of a plan transition recorded in the subscription history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Redemption,
    Deactivation,
    Revocation,
    Sweep,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Redemption => "redemption",
            Transition::Deactivation => "deactivation",
            Transition::Revocation => "revocation",
            Transition::Sweep => "sweep",
        }
    }
}

/// Append-only plan transition history
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub id: i64,
    pub account_id: i64,
    pub plan_id: i64,
    pub key_id: Option<i64>,
    pub transition: String,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// Append-only billable action log
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub account_id: i64,
    pub kind: String,
    pub request_summary: String,
    pub response_summary: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(used: bool, bound: Option<i64>) -> ActivationKey {
        ActivationKey {
            id: 7,
            plan_id: 2,
            code: "ABCD-EFGH-JKMN-PQRS".to_string(),
            code_hash: String::new(),
            used,
            bound_account_id: bound,
            bound_at: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn test_key_invariant() {
        assert!(key(false, None).ensure_consistent().is_ok());
        assert!(key(true, Some(42)).ensure_consistent().is_ok());
        assert!(matches!(
            key(true, None).ensure_consistent(),
            Err(EngineError::StateCorruption(_))
        ));
        assert!(matches!(
            key(false, Some(42)).ensure_consistent(),
            Err(EngineError::StateCorruption(_))
        ));
    }

    #[test]
    fn test_key_expiry() {
        let now = Utc::now();
        let mut k = key(false, None);
        assert!(!k.is_expired(now));

        k.expires_at = Some(now - Duration::days(1));
        assert!(k.is_expired(now));

        k.expires_at = Some(now + Duration::days(1));
        assert!(!k.is_expired(now));
    }

    #[test]
    fn test_plan_window() {
        let plan = Plan {
            id: 1,
            name: "BASIC".to_string(),
            description: String::new(),
            price: 10.0,
            quota_ceiling: 500,
            window_days: 30,
            max_keys_per_plan: 1,
            active: true,
            created_at: Utc::now(),
        };
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let (from, to) = plan.window_from(start);
        assert_eq!(from, start);
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
    }
}
