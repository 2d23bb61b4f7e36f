//! Entitlement Engine
//!
//! Decides, per request, whether the caller may proceed and under which
//! limits:
//! - Identity resolution (primary or linked wallet → account)
//! - Plan resolution (organization → individual → Free)
//! - Wallet dedup and guarded wallet linking
//! - Usage metering (free-trial window, monthly, organization pool)
//! - Monthly transaction volume caps
//! - A gate tying the above into one admit/reject decision
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      ENTITLEMENT ENGINE                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │   ActionRequest ──▶ ┌──────────────────────────────────────┐    │
//! │                     │           EntitlementGate            │    │
//! │                     │  leniency policy │ deadline │ metrics │   │
//! │                     └──────────────────────────────────────┘    │
//! │                          │            │             │           │
//! │                 ┌────────┴───┐  ┌─────┴─────┐  ┌────┴────────┐  │
//! │                 │  Identity  │  │   Plan    │  │   Ledgers   │  │
//! │                 │  Resolver  │─▶│  Resolver │─▶│ usage │ txn │  │
//! │                 └────────────┘  └───────────┘  └─────────────┘  │
//! │                                       │                         │
//! │                               ┌───────┴────────┐                │
//! │                               │ WalletLinker + │                │
//! │                               │  DedupCounter  │                │
//! │                               └────────────────┘                │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                 EntitlementStore (async)                  │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod dedup;
pub mod error;
pub mod gate;
pub mod identity;
pub mod plans;
pub mod transactions;
pub mod trial;
pub mod usage;
pub mod wallets;

pub use config::{ChainBinding, EngineConfig, TierTable};
pub use dedup::{DedupEntry, DedupReport, WalletDedupCounter};
pub use error::{EntitlementError, EntitlementResult, Severity};
pub use gate::{ActionKind, ActionRequest, EntitlementContext, EntitlementGate, GateDecision, GateState, LeniencyPolicy};
pub use identity::{IdentityResolver, ResolvedIdentity, SourceKind};
pub use plans::{EffectivePlan, PlanResolver, PlanSource};
pub use transactions::{TransactionLedger, VolumeSnapshot};
pub use trial::{TrialPolicy, TrialStatus};
pub use usage::{UsageLedger, UsageScope, UsageSnapshot};
pub use wallets::WalletLinker;

use chrono::{DateTime, Utc};
use entitle_common::{Account, AccountId, EntitlementStore, PlanTier, StoreError};
use std::sync::Arc;

/// All components wired to one store
pub struct EntitlementEngine {
    config: EngineConfig,
    store: Arc<dyn EntitlementStore>,
    trial: TrialPolicy,
    identity: Arc<IdentityResolver>,
    plans: Arc<PlanResolver>,
    wallets: Arc<WalletLinker>,
    usage: Arc<UsageLedger>,
    transactions: Arc<TransactionLedger>,
    gate: Arc<EntitlementGate>,
}

impl EntitlementEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn EntitlementStore>) -> Self {
        if config.tiers.get(PlanTier::Free).is_none() {
            tracing::error!("tier table defines no Free tier; unplanned accounts will be refused");
        }

        let trial = TrialPolicy::new(config.trial_window());
        let identity = Arc::new(IdentityResolver::new(store.clone()));
        let plans = Arc::new(PlanResolver::new(store.clone(), config.tiers.clone()));
        let dedup = WalletDedupCounter::new(config.chain_binding());
        let wallets = Arc::new(WalletLinker::new(store.clone(), plans.clone(), dedup));
        let usage = Arc::new(UsageLedger::new(store.clone(), trial, config.shared_usage_tiers.clone()));
        let transactions = Arc::new(TransactionLedger::new(store.clone(), trial));
        let gate = Arc::new(EntitlementGate::new(
            store.clone(),
            identity.clone(),
            plans.clone(),
            usage.clone(),
            transactions.clone(),
            trial,
            LeniencyPolicy::new(config.lenient_routes.iter().cloned()),
            config.deadline(),
        ));

        tracing::info!(
            lenient_routes = config.lenient_routes.len(),
            chain_bound = config.chain_bound_chains.len(),
            deadline_ms = config.deadline_ms,
            "entitlement engine ready"
        );

        Self {
            config,
            store,
            trial,
            identity,
            plans,
            wallets,
            usage,
            transactions,
            gate,
        }
    }

    /// Authorize one request
    pub async fn authorize(&self, request: &ActionRequest) -> EntitlementResult<GateDecision> {
        self.gate.authorize(request).await
    }

    /// Start the free trial once per account
    pub async fn start_trial(&self, account_id: AccountId, now: DateTime<Utc>) -> EntitlementResult<Account> {
        let account = self.store.start_trial(account_id, now).await.map_err(|err| match err {
            StoreError::NotFound(_) => EntitlementError::AccountNotFound(account_id),
            other => other.into(),
        })?;
        tracing::info!(%account_id, ends_at = %self.trial.trial_ends_at(now), "trial started");
        Ok(account)
    }

    /// Trial state of an account
    pub async fn trial_status(&self, account_id: AccountId, now: DateTime<Utc>) -> EntitlementResult<TrialStatus> {
        let account = self
            .store
            .account(account_id)
            .await?
            .ok_or(EntitlementError::AccountNotFound(account_id))?;
        Ok(self.trial.status(&account, now))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn plans(&self) -> &PlanResolver {
        &self.plans
    }

    pub fn wallets(&self) -> &WalletLinker {
        &self.wallets
    }

    pub fn usage(&self) -> &UsageLedger {
        &self.usage
    }

    pub fn transactions(&self) -> &TransactionLedger {
        &self.transactions
    }

    pub fn gate(&self) -> &EntitlementGate {
        &self.gate
    }
}
