//! Usage Ledger
//!
//! Two windowing modes:
//! - Free trial: usage records inside the trial's rolling window
//! - Paid tiers: one counter per (account, UTC month); organization members
//!   on a shared tier are compared against the sum of all members' counters
//!
//! Consumption always increments the caller's own counter, never an
//! aggregate. The limit comparison and the increment happen in one store
//! call, so concurrent consumers cannot push a window past its limit.

use crate::error::{EntitlementError, EntitlementResult};
use crate::plans::EffectivePlan;
use crate::trial::TrialPolicy;
use chrono::{DateTime, Utc};
use entitle_common::{Account, AccountId, BillingMonth, EntitlementStore, OrganizationId, PlanTier, UsageKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Whose usage a snapshot measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageScope {
    FreeTrial,
    Individual { period: BillingMonth },
    Organization { organization_id: OrganizationId, period: BillingMonth, members: u32 },
}

/// Usage context handed to downstream consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub trial_active: bool,
    pub scope: UsageScope,
}

impl UsageSnapshot {
    fn new(used: u64, limit: u64, trial_active: bool, scope: UsageScope) -> Self {
        Self {
            used,
            limit,
            remaining: limit.saturating_sub(used),
            trial_active,
            scope,
        }
    }

    /// Strict: reaching the limit blocks the next unit
    pub fn can_consume(&self) -> bool {
        self.used < self.limit
    }
}

enum Window {
    Trial { since: DateTime<Utc> },
    Individual(UsageKey),
    Shared { key: UsageKey, organization_id: OrganizationId, members: Vec<AccountId> },
}

/// Usage ledger
pub struct UsageLedger {
    store: Arc<dyn EntitlementStore>,
    trial: TrialPolicy,
    shared_tiers: Vec<PlanTier>,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn EntitlementStore>, trial: TrialPolicy, shared_tiers: Vec<PlanTier>) -> Self {
        Self { store, trial, shared_tiers }
    }

    /// Read-only usage context
    pub async fn snapshot(&self, account: &Account, plan: &EffectivePlan, now: DateTime<Utc>) -> EntitlementResult<UsageSnapshot> {
        let window = self.window(account, plan, now).await?;
        self.measure(account, plan, &window, now).await
    }

    /// Admit one unit or reject; nothing is written
    pub async fn check(&self, account: &Account, plan: &EffectivePlan, now: DateTime<Utc>) -> EntitlementResult<UsageSnapshot> {
        let window = self.window(account, plan, now).await?;
        self.check_window(account, plan, &window, now).await
    }

    /// Admit one unit and record it
    pub async fn consume(&self, account: &Account, plan: &EffectivePlan, now: DateTime<Utc>) -> EntitlementResult<UsageSnapshot> {
        let window = self.window(account, plan, now).await?;
        let before = self.check_window(account, plan, &window, now).await?;
        let limit = before.limit;

        let admitted = match &window {
            Window::Trial { since } => self.store.record_usage_event(account.id, now, *since, limit).await?,
            Window::Individual(key) => self.store.increment_usage(*key, limit).await?,
            Window::Shared { key, members, .. } => self.store.increment_pooled_usage(*key, members, limit).await?,
        };

        let Some(used) = admitted else {
            // Another consumer took the last unit between check and write
            let after = self.measure(account, plan, &window, now).await?;
            tracing::warn!(account_id = %account.id, used = after.used, limit, "usage limit reached under contention");
            return Err(EntitlementError::QuotaExceeded { used: after.used, limit });
        };

        tracing::debug!(account_id = %account.id, used, limit, "usage consumed");
        Ok(UsageSnapshot::new(used, limit, before.trial_active, before.scope))
    }

    /// Administrative reset of one account's period counter
    pub async fn reset(&self, account_id: AccountId, period: BillingMonth) -> EntitlementResult<()> {
        self.store.reset_usage(UsageKey::new(account_id, period)).await?;
        tracing::info!(%account_id, %period, "usage counter reset");
        Ok(())
    }

    async fn check_window(
        &self,
        account: &Account,
        plan: &EffectivePlan,
        window: &Window,
        now: DateTime<Utc>,
    ) -> EntitlementResult<UsageSnapshot> {
        if let Window::Trial { .. } = window {
            if !self.trial.status(account, now).is_active() {
                return Err(EntitlementError::TrialExpired { account_id: account.id });
            }
        }

        let snapshot = self.measure(account, plan, window, now).await?;
        if !snapshot.can_consume() {
            return Err(EntitlementError::QuotaExceeded {
                used: snapshot.used,
                limit: snapshot.limit,
            });
        }
        Ok(snapshot)
    }

    async fn measure(
        &self,
        account: &Account,
        plan: &EffectivePlan,
        window: &Window,
        now: DateTime<Utc>,
    ) -> EntitlementResult<UsageSnapshot> {
        let trial_active = self.trial.status(account, now).is_active();
        let snapshot = match window {
            Window::Trial { since } => {
                let used = self.store.count_usage_events(account.id, *since, now).await?;
                UsageSnapshot::new(used, plan.query_limit, trial_active, UsageScope::FreeTrial)
            }
            Window::Individual(key) => {
                let used = self.store.usage(*key).await?;
                UsageSnapshot::new(used, plan.query_limit, trial_active, UsageScope::Individual { period: key.period })
            }
            Window::Shared { key, organization_id, members } => {
                let used = self.store.sum_usage(members, key.period).await?;
                let scope = UsageScope::Organization {
                    organization_id: *organization_id,
                    period: key.period,
                    members: members.len() as u32,
                };
                UsageSnapshot::new(used, plan.query_limit, trial_active, scope)
            }
        };
        Ok(snapshot)
    }

    async fn window(&self, account: &Account, plan: &EffectivePlan, now: DateTime<Utc>) -> EntitlementResult<Window> {
        if plan.is_free() {
            return Ok(Window::Trial { since: now - self.trial.window() });
        }

        let key = UsageKey::new(account.id, BillingMonth::containing(now));
        match plan.organization_id() {
            Some(organization_id) if self.shared_tiers.contains(&plan.tier) => {
                let mut members = self.store.organization_members(organization_id).await?;
                if !members.contains(&account.id) {
                    members.push(account.id);
                }
                Ok(Window::Shared { key, organization_id, members })
            }
            _ => Ok(Window::Individual(key)),
        }
    }
}
