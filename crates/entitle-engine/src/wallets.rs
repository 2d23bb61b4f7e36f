//! Wallet Linking
//!
//! Linking runs the dedup count inside the store's insert critical section,
//! so two concurrent links for one account cannot both pass the limit.

use crate::dedup::{DedupReport, WalletDedupCounter};
use crate::error::{EntitlementError, EntitlementResult};
use crate::identity::parse_wallet;
use crate::plans::PlanResolver;
use entitle_common::{AccountId, EntitlementStore, LinkOutcome, LinkedWallet, UnlinkOutcome, WalletId};
use std::sync::Arc;

/// Links and unlinks secondary wallets
pub struct WalletLinker {
    store: Arc<dyn EntitlementStore>,
    plans: Arc<PlanResolver>,
    dedup: WalletDedupCounter,
}

impl WalletLinker {
    pub fn new(store: Arc<dyn EntitlementStore>, plans: Arc<PlanResolver>, dedup: WalletDedupCounter) -> Self {
        Self { store, plans, dedup }
    }

    /// Link `(address, chain)` to `account_id`
    pub async fn link_wallet(&self, account_id: AccountId, address: &str, chain: &str, proof: &str) -> EntitlementResult<LinkedWallet> {
        let (address, chain) = parse_wallet(address, chain)?;
        if proof.trim().is_empty() {
            return Err(EntitlementError::InvalidInput("ownership proof is empty".into()));
        }

        let plan = self.plans.resolve(account_id).await?;
        let wallet_limit = plan.wallet_limit;
        let candidate = LinkedWallet::new(account_id, address, chain, proof);

        let dedup = &self.dedup;
        let guard = move |set: &[entitle_common::WalletRecord]| dedup.admits(set, wallet_limit);

        match self.store.link_wallet(candidate.clone(), &guard).await? {
            LinkOutcome::Linked(wallet) => {
                tracing::info!(
                    %account_id,
                    wallet_id = %wallet.id,
                    address = %wallet.wallet_address,
                    chain = %wallet.chain_id,
                    "wallet linked"
                );
                Ok(wallet)
            }
            LinkOutcome::Refused => {
                // Recount outside the critical section for the error payload only
                let mut set = self.store.account_wallets(account_id).await?;
                set.push(entitle_common::WalletRecord::linked(&candidate));
                let unique = self.dedup.unique_count(&set);
                tracing::warn!(%account_id, unique, limit = wallet_limit, "wallet limit exceeded");
                Err(EntitlementError::WalletLimitExceeded { unique, limit: wallet_limit })
            }
        }
    }

    /// Remove a linked wallet that no transaction references
    pub async fn unlink_wallet(&self, wallet_id: WalletId) -> EntitlementResult<()> {
        match self.store.unlink_wallet(wallet_id).await? {
            UnlinkOutcome::Removed => {
                tracing::info!(%wallet_id, "wallet unlinked");
                Ok(())
            }
            UnlinkOutcome::HasHistory => Err(EntitlementError::WalletHasHistory),
        }
    }

    /// Dedup verdicts for the account's current wallets
    pub async fn wallet_summary(&self, account_id: AccountId) -> EntitlementResult<DedupReport> {
        let wallets = self.store.account_wallets(account_id).await?;
        Ok(self.dedup.evaluate(&wallets))
    }
}
