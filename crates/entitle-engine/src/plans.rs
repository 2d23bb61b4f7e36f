//! Plan Resolution
//!
//! Precedence is fixed and first match wins:
//! 1. the organization's plan, when the account is a member of one that has a plan
//! 2. the account's individually assigned plan
//! 3. the Free tier from the static tier table
//!
//! Every join path is normalized here into one [`EffectivePlan`]; nothing
//! downstream inspects tier names or plan rows again.

use crate::config::TierTable;
use crate::error::{EntitlementError, EntitlementResult};
use entitle_common::{Account, AccountId, EntitlementStore, OrganizationId, PlanId, PlanTier, TierLimits, TransactionKind, VolumeCap};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where the effective plan came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Organization { organization_id: OrganizationId, member_count: u32 },
    Individual,
    Free,
}

/// Canonical effective plan of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePlan {
    pub tier: PlanTier,
    /// `None` for the built-in Free defaults
    pub plan_id: Option<PlanId>,
    pub query_limit: u64,
    pub wallet_limit: u32,
    /// `None` is unlimited
    pub txn_limit: Option<Decimal>,
    pub source: PlanSource,
}

impl EffectivePlan {
    fn from_limits(tier: PlanTier, plan_id: Option<PlanId>, limits: &TierLimits, source: PlanSource) -> Self {
        Self {
            tier,
            plan_id,
            query_limit: limits.query_limit,
            wallet_limit: limits.wallet_limit,
            txn_limit: limits.txn_limit,
            source,
        }
    }

    pub fn is_free(&self) -> bool {
        self.tier == PlanTier::Free
    }

    pub fn member_count(&self) -> u32 {
        match self.source {
            PlanSource::Organization { member_count, .. } => member_count,
            _ => 1,
        }
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        match self.source {
            PlanSource::Organization { organization_id, .. } => Some(organization_id),
            _ => None,
        }
    }

    /// Volume ceiling for one transaction class.
    ///
    /// Free and Basic carry a flat invoice cap but no cross-chain allowance.
    pub fn volume_cap(&self, kind: TransactionKind) -> VolumeCap {
        match (self.tier, kind) {
            (PlanTier::Free | PlanTier::Basic, TransactionKind::CrossChainTransfer) => VolumeCap::Limited(Decimal::ZERO),
            _ => match self.txn_limit {
                Some(limit) => VolumeCap::Limited(limit),
                None => VolumeCap::Unlimited,
            },
        }
    }
}

/// Plan resolver
pub struct PlanResolver {
    store: Arc<dyn EntitlementStore>,
    tiers: TierTable,
}

impl PlanResolver {
    pub fn new(store: Arc<dyn EntitlementStore>, tiers: TierTable) -> Self {
        Self { store, tiers }
    }

    /// Resolve by account id
    pub async fn resolve(&self, account_id: AccountId) -> EntitlementResult<EffectivePlan> {
        let account = self
            .store
            .account(account_id)
            .await?
            .ok_or(EntitlementError::AccountNotFound(account_id))?;
        self.resolve_account(&account).await
    }

    /// Resolve for an already-loaded account
    pub async fn resolve_account(&self, account: &Account) -> EntitlementResult<EffectivePlan> {
        if let Some(organization_id) = account.organization_id {
            if let Some(plan) = self.organization_plan(organization_id).await? {
                return Ok(plan);
            }
        }

        if let Some(plan_id) = account.plan_id {
            match self.store.plan(plan_id).await? {
                Some(plan) => {
                    return Ok(EffectivePlan::from_limits(plan.tier, Some(plan.id), &plan.limits, PlanSource::Individual));
                }
                None => tracing::warn!(account_id = %account.id, %plan_id, "individual plan missing, falling back"),
            }
        }

        self.free_plan()
    }

    /// The static Free defaults; absence is fatal misconfiguration
    pub fn free_plan(&self) -> EntitlementResult<EffectivePlan> {
        match self.tiers.get(PlanTier::Free) {
            Some(limits) => Ok(EffectivePlan::from_limits(PlanTier::Free, None, limits, PlanSource::Free)),
            None => {
                tracing::error!("tier table defines no Free tier");
                metrics::counter!("entitlement_misconfiguration_total", "reason" => "free_plan_missing").increment(1);
                Err(EntitlementError::PlanUnavailable("no Free tier configured".into()))
            }
        }
    }

    async fn organization_plan(&self, organization_id: OrganizationId) -> EntitlementResult<Option<EffectivePlan>> {
        let Some(organization) = self.store.organization(organization_id).await? else {
            tracing::warn!(%organization_id, "organization missing, falling back");
            return Ok(None);
        };
        let Some(plan_id) = organization.plan_id else {
            return Ok(None);
        };
        let Some(plan) = self.store.plan(plan_id).await? else {
            tracing::warn!(%organization_id, %plan_id, "organization plan missing, falling back");
            return Ok(None);
        };

        let member_count = self.store.organization_members(organization_id).await?.len() as u32;
        Ok(Some(EffectivePlan::from_limits(
            plan.tier,
            Some(plan.id),
            &plan.limits,
            PlanSource::Organization { organization_id, member_count },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitle_common::{ChainId, InMemoryStore, Organization, Plan, WalletAddress};
    use rust_decimal_macros::dec;

    fn account(n: u8) -> Account {
        Account::new(
            WalletAddress::parse(format!("0x{}", format!("{n:02x}").repeat(20))).unwrap(),
            ChainId::new("ethereum").unwrap(),
        )
    }

    fn plan(tier: PlanTier) -> Plan {
        Plan::new(tier, TierTable::default().get(tier).cloned().unwrap())
    }

    #[tokio::test]
    async fn test_free_default() {
        let store = Arc::new(InMemoryStore::new());
        let a = account(1);
        store.insert_account(a.clone()).unwrap();
        let resolver = PlanResolver::new(store, TierTable::default());

        let plan = resolver.resolve(a.id).await.unwrap();
        assert_eq!(plan.tier, PlanTier::Free);
        assert_eq!(plan.source, PlanSource::Free);
        assert_eq!(plan.member_count(), 1);
    }

    #[tokio::test]
    async fn test_organization_beats_individual() {
        let store = Arc::new(InMemoryStore::new());
        let basic = plan(PlanTier::Basic);
        let pro = plan(PlanTier::Pro);
        store.insert_plan(basic.clone());
        store.insert_plan(pro.clone());

        let owner = account(1);
        let org = Organization::new(owner.id, Some(pro.id));
        store.insert_organization(org.clone());
        store.insert_account(owner.with_organization(org.id)).unwrap();
        let member = account(2).with_plan(basic.id).with_organization(org.id);
        store.insert_account(member.clone()).unwrap();

        let resolver = PlanResolver::new(store, TierTable::default());
        let resolved = resolver.resolve(member.id).await.unwrap();
        assert_eq!(resolved.tier, PlanTier::Pro);
        assert_eq!(resolved.source, PlanSource::Organization { organization_id: org.id, member_count: 2 });
    }

    #[tokio::test]
    async fn test_org_without_plan_uses_individual() {
        let store = Arc::new(InMemoryStore::new());
        let basic = plan(PlanTier::Basic);
        store.insert_plan(basic.clone());
        let member = account(1).with_plan(basic.id);
        let org = Organization::new(member.id, None);
        store.insert_organization(org.clone());
        let member = member.with_organization(org.id);
        store.insert_account(member.clone()).unwrap();

        let resolver = PlanResolver::new(store, TierTable::default());
        let resolved = resolver.resolve(member.id).await.unwrap();
        assert_eq!(resolved.tier, PlanTier::Basic);
        assert_eq!(resolved.source, PlanSource::Individual);
    }

    #[tokio::test]
    async fn test_dangling_plan_falls_through() {
        let store = Arc::new(InMemoryStore::new());
        let a = account(1).with_plan(PlanId::new_v4());
        store.insert_account(a.clone()).unwrap();
        let resolver = PlanResolver::new(store, TierTable::default());
        assert_eq!(resolver.resolve(a.id).await.unwrap().source, PlanSource::Free);
    }

    #[tokio::test]
    async fn test_missing_free_tier_is_fatal() {
        let store = Arc::new(InMemoryStore::new());
        let a = account(1);
        store.insert_account(a.clone()).unwrap();
        let resolver = PlanResolver::new(store, TierTable::default().without(PlanTier::Free));

        let err = resolver.resolve(a.id).await.unwrap_err();
        assert!(matches!(err, EntitlementError::PlanUnavailable(_)));
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let pro = plan(PlanTier::Pro);
        store.insert_plan(pro.clone());
        let a = account(1).with_plan(pro.id);
        store.insert_account(a.clone()).unwrap();
        let resolver = PlanResolver::new(store, TierTable::default());

        let first = resolver.resolve(a.id).await.unwrap();
        let second = resolver.resolve(a.id).await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_volume_caps() {
        let limits = TierTable::default();
        let basic = EffectivePlan::from_limits(PlanTier::Basic, None, limits.get(PlanTier::Basic).unwrap(), PlanSource::Individual);
        assert_eq!(basic.volume_cap(TransactionKind::CrossChainTransfer), VolumeCap::Limited(dec!(0)));
        assert_eq!(basic.volume_cap(TransactionKind::Invoice), VolumeCap::Limited(dec!(1000)));

        let premium = EffectivePlan::from_limits(PlanTier::Premium, None, limits.get(PlanTier::Premium).unwrap(), PlanSource::Individual);
        assert_eq!(premium.volume_cap(TransactionKind::CrossChainTransfer), VolumeCap::Unlimited);
    }
}
