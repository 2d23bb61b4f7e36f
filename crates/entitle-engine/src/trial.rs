//! Free-trial policy

use chrono::{DateTime, Utc};
use entitle_common::Account;
use serde::{Deserialize, Serialize};

/// Trial state of an account at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Active { ends_at: DateTime<Utc> },
    Expired { ended_at: DateTime<Utc> },
    NotStarted,
}

impl TrialStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

/// Fixed-window trial predicate
#[derive(Debug, Clone, Copy)]
pub struct TrialPolicy {
    window: chrono::Duration,
}

impl TrialPolicy {
    pub fn new(window: chrono::Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> chrono::Duration {
        self.window
    }

    /// Active while `now - start <= window`
    pub fn is_trial_active(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - start <= self.window
    }

    pub fn trial_ends_at(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + self.window
    }

    pub fn status(&self, account: &Account, now: DateTime<Utc>) -> TrialStatus {
        match account.trial_start {
            None => TrialStatus::NotStarted,
            Some(start) if self.is_trial_active(start, now) => TrialStatus::Active {
                ends_at: self.trial_ends_at(start),
            },
            Some(start) => TrialStatus::Expired {
                ended_at: self.trial_ends_at(start),
            },
        }
    }
}

impl Default for TrialPolicy {
    fn default() -> Self {
        Self::new(chrono::Duration::days(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use entitle_common::{ChainId, WalletAddress};

    fn account() -> Account {
        Account::new(
            WalletAddress::parse("0x00000000000000000000000000000000000000aa").unwrap(),
            ChainId::new("ethereum").unwrap(),
        )
    }

    #[test]
    fn test_window_boundary() {
        let policy = TrialPolicy::default();
        let start = Utc::now();
        assert!(policy.is_trial_active(start, start + Duration::days(5)));
        assert!(!policy.is_trial_active(start, start + Duration::days(5) + Duration::seconds(1)));
    }

    #[test]
    fn test_status() {
        let policy = TrialPolicy::default();
        let now = Utc::now();

        assert_eq!(policy.status(&account(), now), TrialStatus::NotStarted);

        let fresh = account().with_trial_start(now - Duration::days(1));
        assert!(policy.status(&fresh, now).is_active());

        let stale = account().with_trial_start(now - Duration::days(6));
        assert_eq!(
            policy.status(&stale, now),
            TrialStatus::Expired { ended_at: now - Duration::days(1) }
        );
    }
}
