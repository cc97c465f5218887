/// Access Decision
///
/// Combines an account's active flag, subscription window and quota counter
/// into an allow/deny verdict. The verdict carries all three conditions so
/// callers can render them, plus one fixed reason string.
use crate::{db::models::Account, error::EngineError};
use chrono::NaiveDate;
use serde::Serialize;

/// Why access was granted or denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    Granted,
    AccountNotFound,
    AccountInactive,
    SubscriptionExpired,
    QuotaExhausted,
}

impl AccessReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessReason::Granted => "access granted",
            AccessReason::AccountNotFound => "account not found",
            AccessReason::AccountInactive => "account is inactive",
            AccessReason::SubscriptionExpired => "subscription expired",
            AccessReason::QuotaExhausted => "request quota exhausted",
        }
    }

    /// Stable label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            AccessReason::Granted => "granted",
            AccessReason::AccountNotFound => "account_not_found",
            AccessReason::AccountInactive => "account_inactive",
            AccessReason::SubscriptionExpired => "subscription_expired",
            AccessReason::QuotaExhausted => "quota_exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessVerdict {
    pub allowed: bool,
    pub reason: AccessReason,
    pub active: bool,
    pub subscription_active: bool,
    pub has_quota: bool,
}

impl AccessVerdict {
    fn not_found() -> Self {
        Self {
            allowed: false,
            reason: AccessReason::AccountNotFound,
            active: false,
            subscription_active: false,
            has_quota: false,
        }
    }

    /// Turn a denial into an error; `None` when allowed
    pub fn denial(&self) -> Option<EngineError> {
        match self.reason {
            AccessReason::Granted => None,
            AccessReason::AccountNotFound => {
                Some(EngineError::NotFound(self.reason.as_str().to_string()))
            }
            reason => Some(EngineError::AccessDenied(reason.as_str().to_string())),
        }
    }
}

/// Evaluate access for `account` as of `today`
///
/// When several conditions fail the reported reason follows the order
/// inactive, expired, exhausted.
pub fn check_access(account: Option<&Account>, today: NaiveDate) -> AccessVerdict {
    let Some(account) = account else {
        return AccessVerdict::not_found();
    };

    let active = account.active;
    let subscription_active = account.window_end >= today;
    let has_quota = account.used_count < account.quota_limit;

    let reason = if !active {
        AccessReason::AccountInactive
    } else if !subscription_active {
        AccessReason::SubscriptionExpired
    } else if !has_quota {
        AccessReason::QuotaExhausted
    } else {
        AccessReason::Granted
    };

    AccessVerdict {
        allowed: reason == AccessReason::Granted,
        reason,
        active,
        subscription_active,
        has_quota,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn account(active: bool, window_end: NaiveDate, used: i64, limit: i64) -> Account {
        let now = Utc::now();
        Account {
            id: 1,
            display_name: "Alice".to_string(),
            username: None,
            access_key: "k".to_string(),
            plan_id: 1,
            bound_key_id: None,
            used_count: used,
            quota_limit: limit,
            window_start: window_end - chrono::Duration::days(30),
            window_end,
            active,
            is_privileged: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_missing_account() {
        let verdict = check_access(None, day(1));
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, AccessReason::AccountNotFound);
        assert_eq!(verdict.reason.as_str(), "account not found");
        assert!(matches!(verdict.denial(), Some(EngineError::NotFound(_))));
    }

    #[test]
    fn test_granted_on_last_day_of_window() {
        let verdict = check_access(Some(&account(true, day(10), 0, 1)), day(10));
        assert!(verdict.allowed);
        assert_eq!(verdict.reason, AccessReason::Granted);
        assert!(verdict.denial().is_none());
    }

    #[test]
    fn test_single_failures() {
        let today = day(10);

        let v = check_access(Some(&account(false, day(20), 0, 5)), today);
        assert_eq!(v.reason, AccessReason::AccountInactive);
        assert!(!v.active && v.subscription_active && v.has_quota);

        let v = check_access(Some(&account(true, day(9), 0, 5)), today);
        assert_eq!(v.reason, AccessReason::SubscriptionExpired);
        assert!(v.active && !v.subscription_active && v.has_quota);

        let v = check_access(Some(&account(true, day(20), 5, 5)), today);
        assert_eq!(v.reason, AccessReason::QuotaExhausted);
        assert!(matches!(v.denial(), Some(EngineError::AccessDenied(_))));
    }

    #[test]
    fn test_reason_precedence() {
        let today = day(10);

        let v = check_access(Some(&account(false, day(1), 9, 5)), today);
        assert_eq!(v.reason, AccessReason::AccountInactive);

        let v = check_access(Some(&account(true, day(1), 9, 5)), today);
        assert_eq!(v.reason, AccessReason::SubscriptionExpired);
        assert!(!v.has_quota);
    }
}
