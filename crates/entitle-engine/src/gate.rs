//! Entitlement Gate
//!
//! One pass per request:
//!
//! ```text
//!   Unresolved ──identity──▶ Resolved ──plan + ledgers──▶ Authorized
//!        │                      │
//!        └──────────────────────┴──────────────────────────▶ Rejected(kind)
//!                                                                 │
//!                                          lenient route ─────────┴──▶ PassedThrough(kind)
//! ```
//!
//! A rejection on a lenient route is downgraded to a pass-through when the
//! error kind allows it. The whole chain runs under one deadline.

use crate::error::{EntitlementError, EntitlementResult, Severity};
use crate::identity::{IdentityResolver, ResolvedIdentity};
use crate::plans::{EffectivePlan, PlanResolver};
use crate::transactions::{TransactionLedger, VolumeSnapshot};
use crate::trial::{TrialPolicy, TrialStatus};
use crate::usage::{UsageLedger, UsageSnapshot};
use chrono::{DateTime, Utc};
use entitle_common::{Account, AccountId, EntitlementStore, RouteId, TransactionKind};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Request
// =============================================================================

/// What the caller wants to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Metered API query, consumes one usage unit
    Query,
    /// Value transfer checked against the monthly volume cap
    Transaction { amount: Decimal, kind: TransactionKind },
    /// Wallet-less back-office action
    Administrative,
}

/// One request to authorize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub route: RouteId,
    pub wallet_address: Option<String>,
    pub chain_id: Option<String>,
    /// Used when the request carries no wallet
    pub account_id: Option<AccountId>,
    pub action: ActionKind,
}

impl ActionRequest {
    /// Request identified by a wallet
    pub fn from_wallet(route: RouteId, address: impl Into<String>, chain: impl Into<String>, action: ActionKind) -> Self {
        Self {
            route,
            wallet_address: Some(address.into()),
            chain_id: Some(chain.into()),
            account_id: None,
            action,
        }
    }

    /// Request naming its account directly
    pub fn from_account(route: RouteId, account_id: AccountId, action: ActionKind) -> Self {
        Self {
            route,
            wallet_address: None,
            chain_id: None,
            account_id: Some(account_id),
            action,
        }
    }
}

// =============================================================================
// Policy & outcome
// =============================================================================

/// Routes whose non-fatal rejections pass through
#[derive(Debug, Clone, Default)]
pub struct LeniencyPolicy {
    routes: HashSet<RouteId>,
}

impl LeniencyPolicy {
    pub fn new(routes: impl IntoIterator<Item = RouteId>) -> Self {
        Self {
            routes: routes.into_iter().collect(),
        }
    }

    pub fn is_lenient(&self, route: &RouteId) -> bool {
        self.routes.contains(route)
    }

    /// Downgrade decision for one failure
    pub fn downgrades(&self, route: &RouteId, err: &EntitlementError) -> bool {
        self.is_lenient(route) && err.is_lenient_downgradable()
    }
}

/// Request-scoped progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Unresolved,
    Resolved,
    Authorized,
    Rejected(&'static str),
    /// Rejection of `kind` swallowed on a lenient route; the caller proceeds
    /// without context
    PassedThrough(&'static str),
}

/// Context attached to an authorized request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementContext {
    pub identity: ResolvedIdentity,
    pub plan: EffectivePlan,
    pub trial: TrialStatus,
    /// Set for queries, after the admitted unit
    pub usage: Option<UsageSnapshot>,
    /// Set for transactions
    pub volume: Option<VolumeSnapshot>,
}

/// Gate verdict for an admitted request
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Authorized(Box<EntitlementContext>),
    /// Lenient route, rejection of `kind` swallowed; no context
    PassThrough { kind: &'static str },
}

impl GateDecision {
    pub fn context(&self) -> Option<&EntitlementContext> {
        match self {
            Self::Authorized(context) => Some(context.as_ref()),
            Self::PassThrough { .. } => None,
        }
    }

    /// Final state of the request
    pub fn state(&self) -> GateState {
        match self {
            Self::Authorized(_) => GateState::Authorized,
            Self::PassThrough { kind } => GateState::PassedThrough(*kind),
        }
    }
}

// =============================================================================
// Gate
// =============================================================================

/// Entitlement gate
pub struct EntitlementGate {
    store: Arc<dyn EntitlementStore>,
    identity: Arc<IdentityResolver>,
    plans: Arc<PlanResolver>,
    usage: Arc<UsageLedger>,
    transactions: Arc<TransactionLedger>,
    trial: TrialPolicy,
    leniency: LeniencyPolicy,
    deadline: Duration,
}

impl EntitlementGate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        identity: Arc<IdentityResolver>,
        plans: Arc<PlanResolver>,
        usage: Arc<UsageLedger>,
        transactions: Arc<TransactionLedger>,
        trial: TrialPolicy,
        leniency: LeniencyPolicy,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            identity,
            plans,
            usage,
            transactions,
            trial,
            leniency,
            deadline,
        }
    }

    /// Authorize at the current time
    pub async fn authorize(&self, request: &ActionRequest) -> EntitlementResult<GateDecision> {
        self.authorize_at(request, Utc::now()).await
    }

    /// Authorize against an explicit clock
    pub async fn authorize_at(&self, request: &ActionRequest, now: DateTime<Utc>) -> EntitlementResult<GateDecision> {
        let outcome = match tokio::time::timeout(self.deadline, self.run(request, now)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EntitlementError::DeadlineExceeded(self.deadline)),
        };

        match outcome {
            Ok(context) => {
                tracing::info!(
                    route = %request.route,
                    account_id = %context.identity.account_id,
                    tier = context.plan.tier.as_str(),
                    "request authorized"
                );
                counter!("entitlement_decisions_total", "outcome" => "authorized").increment(1);
                Ok(GateDecision::Authorized(Box::new(context)))
            }
            Err(err) if self.leniency.downgrades(&request.route, &err) => {
                tracing::warn!(route = %request.route, kind = err.kind(), error = %err, "lenient route, rejection downgraded");
                counter!("entitlement_decisions_total", "outcome" => "pass_through").increment(1);
                Ok(GateDecision::PassThrough { kind: err.kind() })
            }
            Err(err) => {
                match err.severity() {
                    Severity::Fatal => tracing::error!(route = %request.route, error = %err, "entitlement misconfiguration"),
                    _ => tracing::warn!(route = %request.route, kind = err.kind(), error = %err, "request rejected"),
                }
                counter!("entitlement_decisions_total", "outcome" => "rejected").increment(1);
                counter!("entitlement_rejections_total", "kind" => err.kind()).increment(1);
                Err(err)
            }
        }
    }

    async fn run(&self, request: &ActionRequest, now: DateTime<Utc>) -> EntitlementResult<EntitlementContext> {
        let mut state = GateState::Unresolved;
        let result = self.resolve_and_dispatch(request, now, &mut state).await;
        if let Err(err) = &result {
            tracing::debug!(route = %request.route, from = ?state, kind = err.kind(), "gate rejected");
        }
        result
    }

    async fn resolve_and_dispatch(
        &self,
        request: &ActionRequest,
        now: DateTime<Utc>,
        state: &mut GateState,
    ) -> EntitlementResult<EntitlementContext> {
        let identity = self.resolve_identity(request).await?;
        let account = self.load_account(identity.account_id).await?;
        *state = GateState::Resolved;
        tracing::debug!(route = %request.route, account_id = %account.id, source = ?identity.source, "identity resolved");

        let plan = self.plans.resolve_account(&account).await?;
        let trial = self.trial.status(&account, now);
        if plan.is_free() && !trial.is_active() {
            return Err(EntitlementError::TrialExpired { account_id: account.id });
        }

        let mut context = EntitlementContext {
            identity,
            plan,
            trial,
            usage: None,
            volume: None,
        };
        match request.action {
            ActionKind::Query => {
                context.usage = Some(self.usage.consume(&account, &context.plan, now).await?);
            }
            ActionKind::Transaction { amount, kind } => {
                context.volume = Some(self.transactions.check(account.id, &context.plan, amount, kind, now).await?);
            }
            ActionKind::Administrative => {
                self.transactions.authorize_administrative(&account, &context.plan, now).await?;
            }
        }

        *state = GateState::Authorized;
        Ok(context)
    }

    async fn resolve_identity(&self, request: &ActionRequest) -> EntitlementResult<ResolvedIdentity> {
        match (&request.wallet_address, &request.chain_id, request.account_id) {
            (Some(address), Some(chain), _) => self.identity.resolve_raw(address, chain).await,
            (None, None, Some(account_id)) => self.identity.resolve_account(account_id).await,
            (Some(_), None, _) | (None, Some(_), _) => {
                Err(EntitlementError::InvalidInput("wallet address and chain id must be given together".into()))
            }
            (None, None, None) => Err(EntitlementError::InvalidInput("request carries no wallet or account".into())),
        }
    }

    async fn load_account(&self, account_id: AccountId) -> EntitlementResult<Account> {
        self.store
            .account(account_id)
            .await?
            .ok_or(EntitlementError::AccountNotFound(account_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierTable;
    use chrono::Duration as TrialDuration;
    use entitle_common::{BillingMonth, ChainId, InMemoryStore, Plan, PlanTier, UsageKey, WalletAddress};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    const CHAIN: &str = "ethereum";

    fn hex(n: u8) -> String {
        format!("0x{}", format!("{n:02x}").repeat(20))
    }

    fn route(name: &str) -> RouteId {
        RouteId::new(name).unwrap()
    }

    fn gate_with(store: Arc<InMemoryStore>, tiers: TierTable, lenient: &[&str], deadline: Duration) -> EntitlementGate {
        let trial = TrialPolicy::default();
        let plans = Arc::new(PlanResolver::new(store.clone(), tiers));
        EntitlementGate::new(
            store.clone(),
            Arc::new(IdentityResolver::new(store.clone())),
            plans,
            Arc::new(UsageLedger::new(store.clone(), trial, vec![PlanTier::Pro, PlanTier::Premium])),
            Arc::new(TransactionLedger::new(store, trial)),
            trial,
            LeniencyPolicy::new(lenient.iter().map(|r| route(r))),
            deadline,
        )
    }

    fn gate(store: Arc<InMemoryStore>, lenient: &[&str]) -> EntitlementGate {
        gate_with(store, TierTable::default(), lenient, Duration::from_secs(3))
    }

    fn account(store: &InMemoryStore, n: u8, tier: Option<PlanTier>) -> Account {
        let mut account = Account::new(WalletAddress::parse(hex(n)).unwrap(), ChainId::new(CHAIN).unwrap());
        if let Some(tier) = tier {
            let limits = TierTable::default().get(tier).cloned().unwrap();
            let plan = Plan::new(tier, limits);
            store.insert_plan(plan.clone());
            account = account.with_plan(plan.id);
        }
        store.insert_account(account.clone()).unwrap();
        account
    }

    #[tokio::test]
    async fn test_query_attaches_usage_after_consumption() {
        let store = Arc::new(InMemoryStore::new());
        let pro = account(&store, 1, Some(PlanTier::Pro));
        let gate = gate(store, &[]);

        let request = ActionRequest::from_wallet(route("/v1/query"), hex(1), CHAIN, ActionKind::Query);
        let decision = gate.authorize(&request).await.unwrap();
        assert_eq!(decision.state(), GateState::Authorized);

        let context = decision.context().unwrap();
        assert_eq!(context.identity.account_id, pro.id);
        assert_eq!(context.plan.tier, PlanTier::Pro);
        let usage = context.usage.unwrap();
        assert_eq!((usage.used, usage.remaining), (1, 14_999));
        assert!(context.volume.is_none());
    }

    #[tokio::test]
    async fn test_expired_trial_rejected_before_usage() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let free = Account::new(WalletAddress::parse(hex(2)).unwrap(), ChainId::new(CHAIN).unwrap())
            .with_trial_start(now - TrialDuration::days(6));
        store.insert_account(free.clone()).unwrap();
        let gate = gate(store.clone(), &[]);

        for action in [
            ActionKind::Query,
            ActionKind::Transaction { amount: dec!(1), kind: TransactionKind::Invoice },
            ActionKind::Administrative,
        ] {
            let request = ActionRequest::from_wallet(route("/v1/query"), hex(2), CHAIN, action);
            let err = gate.authorize_at(&request, now).await.unwrap_err();
            assert_eq!(err, EntitlementError::TrialExpired { account_id: free.id });
        }
        // Nothing recorded on the rejection path
        let events = store.count_usage_events(free.id, now - TrialDuration::days(30), now).await.unwrap();
        assert_eq!(events, 0);
    }

    #[tokio::test]
    async fn test_quota_rejection_leaves_counter_untouched() {
        let store = Arc::new(InMemoryStore::new());
        let basic = account(&store, 3, Some(PlanTier::Basic));
        let now = Utc::now();
        let key = UsageKey::new(basic.id, BillingMonth::containing(now));
        store.set_usage(key, 1_000);
        let gate = gate(store.clone(), &[]);

        let request = ActionRequest::from_wallet(route("/v1/query"), hex(3), CHAIN, ActionKind::Query);
        let err = gate.authorize_at(&request, now).await.unwrap_err();
        assert_eq!(err, EntitlementError::QuotaExceeded { used: 1_000, limit: 1_000 });
        assert_eq!(store.usage(key).await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn test_transaction_attaches_volume() {
        let store = Arc::new(InMemoryStore::new());
        account(&store, 4, Some(PlanTier::Pro));
        let gate = gate(store, &[]);

        let action = ActionKind::Transaction { amount: dec!(1200), kind: TransactionKind::CrossChainTransfer };
        let request = ActionRequest::from_wallet(route("/v1/transfer"), hex(4), CHAIN, action);
        let decision = gate.authorize(&request).await.unwrap();
        let volume = decision.context().unwrap().volume.unwrap();
        assert_eq!(volume.remaining, Some(dec!(5000)));
        assert!(decision.context().unwrap().usage.is_none());

        let action = ActionKind::Transaction { amount: dec!(6000), kind: TransactionKind::Invoice };
        let request = ActionRequest::from_wallet(route("/v1/transfer"), hex(4), CHAIN, action);
        assert_eq!(gate.authorize(&request).await.unwrap_err().status_code(), 429);
    }

    #[tokio::test]
    async fn test_lenient_admin_route_with_unknown_wallet_passes() {
        let store = Arc::new(InMemoryStore::new());
        let gate = gate(store, &["/admin/invoices"]);

        let request = ActionRequest::from_wallet(route("/admin/invoices"), hex(9), CHAIN, ActionKind::Administrative);
        let decision = gate.authorize(&request).await.unwrap();
        assert_eq!(decision, GateDecision::PassThrough { kind: "identity_not_found" });
        assert!(decision.context().is_none());

        // Same request elsewhere is a 404
        let request = ActionRequest::from_wallet(route("/v1/invoices"), hex(9), CHAIN, ActionKind::Administrative);
        assert_eq!(gate.authorize(&request).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn test_lenient_route_swallows_invalid_input() {
        let store = Arc::new(InMemoryStore::new());
        let gate = gate(store, &["/hooks/stripe"]);

        let request = ActionRequest::from_wallet(route("/hooks/stripe"), "not-a-wallet", CHAIN, ActionKind::Query);
        let decision = gate.authorize(&request).await.unwrap();
        assert_eq!(decision.state(), GateState::PassedThrough("invalid_input"));
        assert_ne!(decision.state(), GateState::Rejected("invalid_input"));
        assert!(decision.context().is_none());
    }

    #[tokio::test]
    async fn test_missing_free_tier_never_downgraded() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let free = Account::new(WalletAddress::parse(hex(5)).unwrap(), ChainId::new(CHAIN).unwrap()).with_trial_start(now);
        store.insert_account(free).unwrap();
        let gate = gate_with(store, TierTable::default().without(PlanTier::Free), &["/hooks/stripe"], Duration::from_secs(3));

        let request = ActionRequest::from_wallet(route("/hooks/stripe"), hex(5), CHAIN, ActionKind::Query);
        let err = gate.authorize_at(&request, now).await.unwrap_err();
        assert!(matches!(err, EntitlementError::PlanUnavailable(_)));
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[tokio::test]
    async fn test_store_outage_is_retryable_and_not_downgraded() {
        let store = Arc::new(InMemoryStore::new());
        account(&store, 6, Some(PlanTier::Pro));
        store.set_offline(true);
        let gate = gate(store, &["/hooks/stripe"]);

        let request = ActionRequest::from_wallet(route("/hooks/stripe"), hex(6), CHAIN, ActionKind::Query);
        let err = gate.authorize(&request).await.unwrap_err();
        assert!(matches!(err, EntitlementError::StoreUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let store = Arc::new(InMemoryStore::new());
        account(&store, 7, Some(PlanTier::Pro));
        store.set_latency(Duration::from_millis(200));
        let gate = gate_with(store, TierTable::default(), &[], Duration::from_millis(20));

        let request = ActionRequest::from_wallet(route("/v1/query"), hex(7), CHAIN, ActionKind::Query);
        let err = gate.authorize(&request).await.unwrap_err();
        assert_eq!(err, EntitlementError::DeadlineExceeded(Duration::from_millis(20)));
        assert_eq!(err.status_code(), 503);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_wallet_less_request_by_account() {
        let store = Arc::new(InMemoryStore::new());
        let premium = account(&store, 8, Some(PlanTier::Premium));
        let gate = gate(store, &[]);

        let request = ActionRequest::from_account(route("/admin/report"), premium.id, ActionKind::Administrative);
        let context = gate.authorize(&request).await.unwrap();
        assert_eq!(context.context().unwrap().identity.account_id, premium.id);

        let request = ActionRequest::from_account(route("/admin/report"), AccountId::new_v4(), ActionKind::Administrative);
        assert!(matches!(gate.authorize(&request).await.unwrap_err(), EntitlementError::AccountNotFound(_)));

        let mut request = ActionRequest::from_account(route("/admin/report"), premium.id, ActionKind::Query);
        request.account_id = None;
        assert!(matches!(gate.authorize(&request).await.unwrap_err(), EntitlementError::InvalidInput(_)));
    }

    proptest! {
        #[test]
        fn prop_lenient_route_never_surfaces_quota(prior in 0u64..3_000, queries in 1usize..5) {
            let store = Arc::new(InMemoryStore::new());
            let basic = account(&store, 10, Some(PlanTier::Basic));
            let now = Utc::now();
            store.set_usage(UsageKey::new(basic.id, BillingMonth::containing(now)), prior);
            let gate = gate(store, &["/hooks/billing"]);
            let request = ActionRequest::from_wallet(route("/hooks/billing"), hex(10), CHAIN, ActionKind::Query);

            for _ in 0..queries {
                let decision = tokio_test::block_on(gate.authorize_at(&request, now));
                prop_assert!(decision.is_ok());
            }
        }
    }
}
