//! Engine Configuration

use entitle_common::{ChainId, PlanTier, RouteId, TierLimits};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Limits per tier; Free doubles as the default plan
    pub tiers: TierTable,
    /// Free-trial rolling window
    pub trial_window_days: u32,
    /// Routes whose non-fatal failures pass through silently
    pub lenient_routes: Vec<RouteId>,
    /// Chains whose wallets carry a per-chain identity assertion
    pub chain_bound_chains: Vec<ChainId>,
    /// Deadline for one resolution chain
    pub deadline_ms: u64,
    /// Tiers whose organization members draw from one shared pool
    pub shared_usage_tiers: Vec<PlanTier>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tiers: TierTable::default(),
            trial_window_days: 5,
            lenient_routes: Vec::new(),
            chain_bound_chains: Vec::new(),
            deadline_ms: 3_000,
            shared_usage_tiers: vec![PlanTier::Pro, PlanTier::Premium],
        }
    }
}

impl EngineConfig {
    /// Load from JSON file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Parse from a JSON document
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn trial_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.trial_window_days))
    }

    pub fn chain_binding(&self) -> ChainBinding {
        ChainBinding::new(self.chain_bound_chains.iter().cloned())
    }

    pub fn with_lenient_route(mut self, route: RouteId) -> Self {
        self.lenient_routes.push(route);
        self
    }

    pub fn with_chain_bound(mut self, chain: ChainId) -> Self {
        self.chain_bound_chains.push(chain);
        self
    }
}

/// Static tier table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierTable(BTreeMap<PlanTier, TierLimits>);

impl TierTable {
    pub fn new(entries: impl IntoIterator<Item = (PlanTier, TierLimits)>) -> Self {
        Self(entries.into_iter().collect())
    }

    pub fn get(&self, tier: PlanTier) -> Option<&TierLimits> {
        self.0.get(&tier)
    }

    pub fn without(mut self, tier: PlanTier) -> Self {
        self.0.remove(&tier);
        self
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::new([
            (
                PlanTier::Free,
                TierLimits {
                    query_limit: 100,
                    wallet_limit: 1,
                    txn_limit: Some(Decimal::ZERO),
                    price: Decimal::ZERO,
                },
            ),
            (
                PlanTier::Basic,
                TierLimits {
                    query_limit: 1_000,
                    wallet_limit: 3,
                    txn_limit: Some(Decimal::from(1_000)),
                    price: Decimal::new(999, 2),
                },
            ),
            (
                PlanTier::Pro,
                TierLimits {
                    query_limit: 15_000,
                    wallet_limit: 10,
                    txn_limit: Some(Decimal::from(5_000)),
                    price: Decimal::new(4_999, 2),
                },
            ),
            (
                PlanTier::Premium,
                TierLimits {
                    query_limit: 100_000,
                    wallet_limit: 50,
                    txn_limit: None,
                    price: Decimal::new(19_999, 2),
                },
            ),
        ])
    }
}

/// Which chains assert a verifiable per-chain identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainBinding {
    bound: HashSet<ChainId>,
}

impl ChainBinding {
    pub fn new(chains: impl IntoIterator<Item = ChainId>) -> Self {
        Self { bound: chains.into_iter().collect() }
    }

    pub fn is_bound(&self, chain: &ChainId) -> bool {
        self.bound.contains(chain)
    }
}
