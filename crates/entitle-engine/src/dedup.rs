//! Wallet Deduplication
//!
//! Counts how many of an account's wallets are billable. The same address
//! registered on several chains is one identity unless a chain asserts a
//! per-chain binding:
//! - a lone address counts once
//! - within a same-address group, every chain-bound member counts
//! - the group's non-bound members collapse into the earliest-created one
//!
//! The count is always recomputed over the full wallet set, so the result
//! does not depend on the order wallets were linked in.

use crate::config::ChainBinding;
use entitle_common::{WalletAddress, WalletRecord, WalletSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One wallet with its billing verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub wallet: WalletRecord,
    pub chain_bound: bool,
    pub is_unique: bool,
}

/// Dedup verdicts for a wallet set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupReport {
    pub entries: Vec<DedupEntry>,
    pub unique_count: u32,
}

impl DedupReport {
    /// Verdict for one wallet source
    pub fn is_unique(&self, source: WalletSource) -> Option<bool> {
        self.entries.iter().find(|e| e.wallet.source == source).map(|e| e.is_unique)
    }
}

/// Wallet dedup counter
#[derive(Debug, Clone, Default)]
pub struct WalletDedupCounter {
    binding: ChainBinding,
}

impl WalletDedupCounter {
    pub fn new(binding: ChainBinding) -> Self {
        Self { binding }
    }

    /// Classify every wallet; entries keep input order
    pub fn evaluate(&self, wallets: &[WalletRecord]) -> DedupReport {
        let mut groups: BTreeMap<&WalletAddress, Vec<usize>> = BTreeMap::new();
        for (idx, wallet) in wallets.iter().enumerate() {
            groups.entry(&wallet.wallet_address).or_default().push(idx);
        }

        let bound: Vec<bool> = wallets.iter().map(|w| self.binding.is_bound(&w.chain_id)).collect();
        let mut unique = vec![false; wallets.len()];

        for members in groups.values() {
            if let [only] = members.as_slice() {
                unique[*only] = true;
                continue;
            }
            for &idx in members.iter().filter(|&&i| bound[i]) {
                unique[idx] = true;
            }
            let representative = members
                .iter()
                .copied()
                .filter(|&i| !bound[i])
                .min_by(|&a, &b| creation_order(&wallets[a], &wallets[b]));
            if let Some(idx) = representative {
                unique[idx] = true;
            }
        }

        let entries: Vec<DedupEntry> = wallets
            .iter()
            .zip(bound.iter().zip(unique.iter()))
            .map(|(wallet, (&chain_bound, &is_unique))| DedupEntry {
                wallet: wallet.clone(),
                chain_bound,
                is_unique,
            })
            .collect();
        let unique_count = entries.iter().filter(|e| e.is_unique).count() as u32;

        DedupReport { entries, unique_count }
    }

    /// Billable wallet count
    pub fn unique_count(&self, wallets: &[WalletRecord]) -> u32 {
        self.evaluate(wallets).unique_count
    }

    /// True if the set (candidate included) stays within `wallet_limit`
    pub fn admits(&self, wallets: &[WalletRecord], wallet_limit: u32) -> bool {
        self.unique_count(wallets) <= wallet_limit
    }
}

fn creation_order(a: &WalletRecord, b: &WalletRecord) -> std::cmp::Ordering {
    fn rank(source: &WalletSource) -> (u8, Option<uuid::Uuid>) {
        match source {
            WalletSource::Primary => (0, None),
            WalletSource::Linked(id) => (1, Some(*id)),
        }
    }
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| rank(&a.source).cmp(&rank(&b.source)))
}
