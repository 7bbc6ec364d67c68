//! Dunning policy
//!
//! What happens to a subscription as renewal payments keep failing. The
//! schedule is deployment policy, not business logic, so every knob is read
//! from the environment:
//!
//! - `DUNNING_PAST_DUE_AFTER_ATTEMPTS`: failed attempts before the
//!   subscription is marked past_due (default: 3)
//! - `DUNNING_SUSPEND_AFTER_ATTEMPTS`: failed attempts before the terminal
//!   action (default: 6)
//! - `DUNNING_RETRY_INTERVAL_HOURS`: spacing between renewal retries
//!   (default: 24)
//! - `DUNNING_SUSPEND_ON_EXHAUST`: `true` pauses the subscription on
//!   exhaustion, `false` cancels it (default: true)

use serde::Serialize;

use crate::error::{BillingError, BillingResult};

/// Next step after a failed payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DunningAction {
    /// Keep the subscription as-is and retry later.
    Retry,
    /// Move the subscription to past_due; access policy downstream may
    /// degrade service.
    MarkPastDue,
    /// Attempts exhausted: pause or cancel per policy.
    Suspend,
}

/// Configurable collection-escalation policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DunningPolicy {
    pub past_due_after_attempts: i32,
    pub suspend_after_attempts: i32,
    pub retry_interval_hours: i64,
    pub pause_on_exhaust: bool,
}

impl Default for DunningPolicy {
    fn default() -> Self {
        Self {
            past_due_after_attempts: 3,
            suspend_after_attempts: 6,
            retry_interval_hours: 24,
            pause_on_exhaust: true,
        }
    }
}

impl DunningPolicy {
    /// Load the policy from environment variables, falling back to defaults.
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        let policy = Self {
            past_due_after_attempts: env_parse(
                "DUNNING_PAST_DUE_AFTER_ATTEMPTS",
                defaults.past_due_after_attempts,
            ),
            suspend_after_attempts: env_parse(
                "DUNNING_SUSPEND_AFTER_ATTEMPTS",
                defaults.suspend_after_attempts,
            ),
            retry_interval_hours: env_parse(
                "DUNNING_RETRY_INTERVAL_HOURS",
                defaults.retry_interval_hours,
            ),
            pause_on_exhaust: env_parse("DUNNING_SUSPEND_ON_EXHAUST", defaults.pause_on_exhaust),
        };

        if policy.past_due_after_attempts < 1 {
            return Err(BillingError::Config(
                "DUNNING_PAST_DUE_AFTER_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if policy.suspend_after_attempts < policy.past_due_after_attempts {
            return Err(BillingError::Config(
                "DUNNING_SUSPEND_AFTER_ATTEMPTS must not be below DUNNING_PAST_DUE_AFTER_ATTEMPTS"
                    .to_string(),
            ));
        }

        Ok(policy)
    }

    /// Decide the step after `attempt_count` consecutive failed attempts.
    pub fn next_action(&self, attempt_count: i32) -> DunningAction {
        if attempt_count >= self.suspend_after_attempts {
            DunningAction::Suspend
        } else if attempt_count >= self.past_due_after_attempts {
            DunningAction::MarkPastDue
        } else {
            DunningAction::Retry
        }
    }

    /// Dunning stage stored on the subscription row for reporting.
    pub fn stage_for(&self, attempt_count: i32) -> i32 {
        match self.next_action(attempt_count) {
            DunningAction::Retry => 1,
            DunningAction::MarkPastDue => 2,
            DunningAction::Suspend => 3,
        }
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn escalation_thresholds() {
        let policy = DunningPolicy::default();
        assert_eq!(policy.next_action(0), DunningAction::Retry);
        assert_eq!(policy.next_action(2), DunningAction::Retry);
        assert_eq!(policy.next_action(3), DunningAction::MarkPastDue);
        assert_eq!(policy.next_action(5), DunningAction::MarkPastDue);
        assert_eq!(policy.next_action(6), DunningAction::Suspend);
        assert_eq!(policy.next_action(100), DunningAction::Suspend);
    }

    #[test]
    fn stages_follow_actions() {
        let policy = DunningPolicy::default();
        assert_eq!(policy.stage_for(1), 1);
        assert_eq!(policy.stage_for(4), 2);
        assert_eq!(policy.stage_for(7), 3);
    }

    #[test]
    #[serial]
    fn from_env_overrides_defaults() {
        std::env::set_var("DUNNING_PAST_DUE_AFTER_ATTEMPTS", "2");
        std::env::set_var("DUNNING_SUSPEND_AFTER_ATTEMPTS", "4");
        std::env::set_var("DUNNING_SUSPEND_ON_EXHAUST", "false");

        let policy = DunningPolicy::from_env().unwrap();
        assert_eq!(policy.past_due_after_attempts, 2);
        assert_eq!(policy.suspend_after_attempts, 4);
        assert!(!policy.pause_on_exhaust);

        std::env::remove_var("DUNNING_PAST_DUE_AFTER_ATTEMPTS");
        std::env::remove_var("DUNNING_SUSPEND_AFTER_ATTEMPTS");
        std::env::remove_var("DUNNING_SUSPEND_ON_EXHAUST");
    }

    #[test]
    #[serial]
    fn from_env_rejects_inverted_thresholds() {
        std::env::set_var("DUNNING_PAST_DUE_AFTER_ATTEMPTS", "5");
        std::env::set_var("DUNNING_SUSPEND_AFTER_ATTEMPTS", "2");

        let err = DunningPolicy::from_env().unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));

        std::env::remove_var("DUNNING_PAST_DUE_AFTER_ATTEMPTS");
        std::env::remove_var("DUNNING_SUSPEND_AFTER_ATTEMPTS");
    }
}
