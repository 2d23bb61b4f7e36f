//! Identity Resolution
//!
//! Maps `(wallet address, chain)` to the one canonical account it bills
//! against. The primary-wallet index is consulted first; the linked-wallet
//! index only on a miss, so the resolution order is deterministic even if
//! the uniqueness invariant were ever violated.

use crate::error::{EntitlementError, EntitlementResult};
use entitle_common::{AccountId, ChainId, EntitlementStore, WalletAddress, WalletId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which index matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Primary,
    Linked,
}

/// Resolved identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub account_id: AccountId,
    pub source: SourceKind,
    pub linked_wallet_id: Option<WalletId>,
}

/// Identity resolver
pub struct IdentityResolver {
    store: Arc<dyn EntitlementStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    /// Validate raw input, then resolve
    pub async fn resolve_raw(&self, address: &str, chain: &str) -> EntitlementResult<ResolvedIdentity> {
        let (address, chain) = parse_wallet(address, chain)?;
        self.resolve(&address, &chain).await
    }

    /// Resolve an already-validated wallet
    pub async fn resolve(&self, address: &WalletAddress, chain: &ChainId) -> EntitlementResult<ResolvedIdentity> {
        if let Some(account) = self.store.account_by_primary_wallet(address, chain).await? {
            tracing::debug!(account_id = %account.id, %address, %chain, "resolved primary wallet");
            return Ok(ResolvedIdentity {
                account_id: account.id,
                source: SourceKind::Primary,
                linked_wallet_id: None,
            });
        }

        if let Some(wallet) = self.store.linked_wallet(address, chain).await? {
            tracing::debug!(account_id = %wallet.account_id, %address, %chain, "resolved linked wallet");
            return Ok(ResolvedIdentity {
                account_id: wallet.account_id,
                source: SourceKind::Linked,
                linked_wallet_id: Some(wallet.id),
            });
        }

        Err(EntitlementError::IdentityNotFound {
            address: address.clone(),
            chain: chain.clone(),
        })
    }

    /// Resolve a wallet-less request naming its account directly
    pub async fn resolve_account(&self, account_id: AccountId) -> EntitlementResult<ResolvedIdentity> {
        match self.store.account(account_id).await? {
            Some(account) => Ok(ResolvedIdentity {
                account_id: account.id,
                source: SourceKind::Primary,
                linked_wallet_id: None,
            }),
            None => Err(EntitlementError::AccountNotFound(account_id)),
        }
    }
}

/// Validate a raw `(address, chain)` pair before any lookup
pub fn parse_wallet(address: &str, chain: &str) -> EntitlementResult<(WalletAddress, ChainId)> {
    Ok((WalletAddress::parse(address)?, ChainId::new(chain)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitle_common::{Account, InMemoryStore, LinkedWallet};

    const PRIMARY: &str = "0x1111111111111111111111111111111111111111";
    const SECONDARY: &str = "0x2222222222222222222222222222222222222222";

    fn setup() -> (Arc<InMemoryStore>, Account) {
        let store = Arc::new(InMemoryStore::new());
        let account = Account::new(WalletAddress::parse(PRIMARY).unwrap(), ChainId::new("ethereum").unwrap());
        store.insert_account(account.clone()).unwrap();
        (store, account)
    }

    #[tokio::test]
    async fn test_primary_and_linked_resolve_to_same_account() {
        let (store, account) = setup();
        let wallet = LinkedWallet::new(
            account.id,
            WalletAddress::parse(SECONDARY).unwrap(),
            ChainId::new("polygon").unwrap(),
            "proof",
        );
        store.link_wallet(wallet.clone(), &|_| true).await.unwrap();
        let resolver = IdentityResolver::new(store);

        let primary = resolver.resolve_raw(PRIMARY, "ethereum").await.unwrap();
        assert_eq!(primary.account_id, account.id);
        assert_eq!(primary.source, SourceKind::Primary);

        let linked = resolver.resolve_raw(SECONDARY, "polygon").await.unwrap();
        assert_eq!(linked.account_id, account.id);
        assert_eq!(linked.source, SourceKind::Linked);
        assert_eq!(linked.linked_wallet_id, Some(wallet.id));
    }

    #[tokio::test]
    async fn test_case_insensitive_address() {
        let (store, account) = setup();
        let resolver = IdentityResolver::new(store);
        let upper = "0x1111111111111111111111111111111111111111".to_uppercase().replacen("0X", "0x", 1);
        let resolved = resolver.resolve_raw(&upper, "ethereum").await.unwrap();
        assert_eq!(resolved.account_id, account.id);
    }

    #[tokio::test]
    async fn test_not_found_and_invalid_input() {
        let (store, _) = setup();
        let resolver = IdentityResolver::new(store.clone());

        let err = resolver.resolve_raw(PRIMARY, "solana").await.unwrap_err();
        assert!(matches!(err, EntitlementError::IdentityNotFound { .. }));

        // Validation runs before any lookup, even with the store down
        store.set_offline(true);
        let err = resolver.resolve_raw("0xnothex", "ethereum").await.unwrap_err();
        assert!(matches!(err, EntitlementError::InvalidInput(_)));
        let err = resolver.resolve_raw(PRIMARY, "").await.unwrap_err();
        assert!(matches!(err, EntitlementError::InvalidInput(_)));
    }
}
