//! Store - persistence abstraction for the entitlement engine
//!
//! The engine issues no queries of its own; everything it needs is one of
//! the primitives below:
//! - point lookups by unique key
//! - range aggregation (usage sums, event counts, volume sums)
//! - atomic primitives (increment-or-insert, guarded wallet insert,
//!   capped transaction insert, status compare-and-set)
//!
//! Atomic primitives must hold in any backend: a SQL implementation maps
//! them to `INSERT .. ON CONFLICT DO UPDATE`, a serializable transaction and
//! `UPDATE .. WHERE status = 'pending'` respectively.

use crate::error::{StoreError, StoreResult};
use crate::model::*;
use crate::value_objects::{ChainId, WalletAddress};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Predicate evaluated over an account's wallet set (existing wallets plus
/// the candidate, candidate last) inside the insert's critical section
pub type WalletGuard<'a> = &'a (dyn Fn(&[WalletRecord]) -> bool + Send + Sync);

/// Volume admission rule for a capped insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeGuard {
    /// Ceiling for the month of the record
    pub cap: VolumeCap,
    /// Restrict the measured volume to one class, `None` measures all
    pub kind: Option<TransactionKind>,
}

/// Result of a guarded wallet insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Guard admitted, row written
    Linked(LinkedWallet),
    /// Guard refused, nothing written
    Refused,
}

/// Result of a wallet removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkOutcome {
    /// Wallet deleted
    Removed,
    /// A transaction references the wallet; nothing removed
    HasHistory,
}

/// Result of a capped transaction insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CappedInsert {
    /// Record written; `prior_volume` excludes it
    Inserted { prior_volume: Decimal },
    /// Cap reached, nothing written
    Refused { prior_volume: Decimal },
}

/// Persistent store consumed by the engine
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Account by id
    async fn account(&self, id: AccountId) -> StoreResult<Option<Account>>;

    /// Account owning `(address, chain)` as its primary wallet
    async fn account_by_primary_wallet(&self, address: &WalletAddress, chain: &ChainId) -> StoreResult<Option<Account>>;

    /// Linked wallet registered as `(address, chain)`
    async fn linked_wallet(&self, address: &WalletAddress, chain: &ChainId) -> StoreResult<Option<LinkedWallet>>;

    /// Primary wallet plus every linked wallet of the account
    async fn account_wallets(&self, account_id: AccountId) -> StoreResult<Vec<WalletRecord>>;

    /// Plan by id
    async fn plan(&self, id: PlanId) -> StoreResult<Option<Plan>>;

    /// Organization by id
    async fn organization(&self, id: OrganizationId) -> StoreResult<Option<Organization>>;

    /// Accounts whose organization id equals `id`
    async fn organization_members(&self, id: OrganizationId) -> StoreResult<Vec<AccountId>>;

    /// Set the trial start once; `Conflict` if the trial was already used
    async fn start_trial(&self, account_id: AccountId, at: DateTime<Utc>) -> StoreResult<Account>;

    /// Insert a linked wallet if `guard` admits, atomically with the check.
    /// `Conflict` if `(address, chain)` is already registered anywhere.
    async fn link_wallet(&self, wallet: LinkedWallet, guard: WalletGuard<'_>) -> StoreResult<LinkOutcome>;

    /// Remove a linked wallet unless a transaction references it
    async fn unlink_wallet(&self, wallet_id: WalletId) -> StoreResult<UnlinkOutcome>;

    /// Counter value, zero when the row does not exist
    async fn usage(&self, key: UsageKey) -> StoreResult<u64>;

    /// Sum of the period counters of `accounts`
    async fn sum_usage(&self, accounts: &[AccountId], period: BillingMonth) -> StoreResult<u64>;

    /// Atomic increment-or-insert unless the counter already reached
    /// `limit`; returns the new value, `None` when refused
    async fn increment_usage(&self, key: UsageKey, limit: u64) -> StoreResult<Option<u64>>;

    /// Increment `key` unless the summed period counters of `members`
    /// (which include the key's account) already reached `limit`. Sum and
    /// increment form one critical section per pool; returns the new pool
    /// total, `None` when refused.
    async fn increment_pooled_usage(&self, key: UsageKey, members: &[AccountId], limit: u64) -> StoreResult<Option<u64>>;

    /// Administrative reset of one counter
    async fn reset_usage(&self, key: UsageKey) -> StoreResult<()>;

    /// Append a usage record at `at` unless `limit` records already fall
    /// in `[since, at]`, atomically with the count. Records older than
    /// `since` are pruned. Returns the new in-window count, `None` when refused.
    async fn record_usage_event(
        &self,
        account_id: AccountId,
        at: DateTime<Utc>,
        since: DateTime<Utc>,
        limit: u64,
    ) -> StoreResult<Option<u64>>;

    /// Usage records in `[since, until]`
    async fn count_usage_events(&self, account_id: AccountId, since: DateTime<Utc>, until: DateTime<Utc>) -> StoreResult<u64>;

    /// Sum of volume-counting amounts created in `[from, to)`
    async fn transaction_volume(
        &self,
        account_id: AccountId,
        kind: Option<TransactionKind>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Decimal>;

    /// Insert a record if its month's volume plus its amount fits the guard
    async fn insert_transaction(&self, record: TransactionRecord, guard: VolumeGuard) -> StoreResult<CappedInsert>;

    /// Transaction by id
    async fn transaction(&self, id: TransactionId) -> StoreResult<Option<TransactionRecord>>;

    /// Compare-and-set the status; `Conflict` when the current status is not `expected`
    async fn update_transaction_status(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        next: TransactionStatus,
    ) -> StoreResult<TransactionRecord>;
}

#[derive(Default)]
struct AccountTable {
    rows: HashMap<AccountId, Account>,
    by_primary: HashMap<(WalletAddress, ChainId), AccountId>,
}

#[derive(Default)]
struct WalletTable {
    rows: HashMap<WalletId, LinkedWallet>,
    by_key: HashMap<(WalletAddress, ChainId), WalletId>,
}

/// In-memory store (for testing and development)
///
/// Lock order is accounts → wallets → transactions everywhere.
pub struct InMemoryStore {
    accounts: RwLock<AccountTable>,
    wallets: RwLock<WalletTable>,
    plans: RwLock<HashMap<PlanId, Plan>>,
    organizations: RwLock<HashMap<OrganizationId, Organization>>,
    usage: DashMap<UsageKey, u64>,
    usage_events: DashMap<AccountId, Vec<DateTime<Utc>>>,
    transactions: RwLock<HashMap<TransactionId, TransactionRecord>>,
    /// Serializes pooled increments
    pool: Mutex<()>,
    offline: AtomicBool,
    latency: RwLock<Duration>,
}

impl InMemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(AccountTable::default()),
            wallets: RwLock::new(WalletTable::default()),
            plans: RwLock::new(HashMap::new()),
            organizations: RwLock::new(HashMap::new()),
            usage: DashMap::new(),
            usage_events: DashMap::new(),
            transactions: RwLock::new(HashMap::new()),
            pool: Mutex::new(()),
            offline: AtomicBool::new(false),
            latency: RwLock::new(Duration::ZERO),
        }
    }

    /// Register an account; `Conflict` if its primary wallet is taken
    pub fn insert_account(&self, account: Account) -> StoreResult<()> {
        let mut accounts = self.accounts.write();
        let key = (account.wallet_address.clone(), account.chain_id.clone());
        if accounts.by_primary.contains_key(&key) || self.wallets.read().by_key.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{} on {} already registered", key.0, key.1)));
        }
        accounts.by_primary.insert(key, account.id);
        accounts.rows.insert(account.id, account);
        Ok(())
    }

    /// Register a plan
    pub fn insert_plan(&self, plan: Plan) {
        self.plans.write().insert(plan.id, plan);
    }

    /// Register an organization
    pub fn insert_organization(&self, organization: Organization) {
        self.organizations.write().insert(organization.id, organization);
    }

    /// Seed a counter value directly
    pub fn set_usage(&self, key: UsageKey, used: u64) {
        self.usage.insert(key, used);
    }

    /// Simulate a backend outage
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every call, to exercise caller deadlines
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    async fn enter(&self) -> StoreResult<()> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }

    fn counter(&self, key: &UsageKey) -> u64 {
        self.usage.get(key).map(|v| *v).unwrap_or(0)
    }

    fn volume_of(
        transactions: &HashMap<TransactionId, TransactionRecord>,
        account_id: AccountId,
        kind: Option<TransactionKind>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Decimal {
        transactions
            .values()
            .filter(|t| t.account_id == account_id)
            .filter(|t| kind.map_or(true, |k| t.kind == k))
            .filter(|t| t.status.counts_toward_volume())
            .filter(|t| t.created_at >= from && t.created_at < to)
            .fold(Decimal::ZERO, |total, t| total.saturating_add(t.amount))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntitlementStore for InMemoryStore {
    async fn account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        self.enter().await?;
        Ok(self.accounts.read().rows.get(&id).cloned())
    }

    async fn account_by_primary_wallet(&self, address: &WalletAddress, chain: &ChainId) -> StoreResult<Option<Account>> {
        self.enter().await?;
        let accounts = self.accounts.read();
        let id = accounts.by_primary.get(&(address.clone(), chain.clone()));
        Ok(id.and_then(|id| accounts.rows.get(id)).cloned())
    }

    async fn linked_wallet(&self, address: &WalletAddress, chain: &ChainId) -> StoreResult<Option<LinkedWallet>> {
        self.enter().await?;
        let wallets = self.wallets.read();
        let id = wallets.by_key.get(&(address.clone(), chain.clone()));
        Ok(id.and_then(|id| wallets.rows.get(id)).cloned())
    }

    async fn account_wallets(&self, account_id: AccountId) -> StoreResult<Vec<WalletRecord>> {
        self.enter().await?;
        let accounts = self.accounts.read();
        let account = accounts
            .rows
            .get(&account_id)
            .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))?;
        let mut records = vec![WalletRecord::primary(account)];
        records.extend(
            self.wallets
                .read()
                .rows
                .values()
                .filter(|w| w.account_id == account_id)
                .map(WalletRecord::linked),
        );
        Ok(records)
    }

    async fn plan(&self, id: PlanId) -> StoreResult<Option<Plan>> {
        self.enter().await?;
        Ok(self.plans.read().get(&id).cloned())
    }

    async fn organization(&self, id: OrganizationId) -> StoreResult<Option<Organization>> {
        self.enter().await?;
        Ok(self.organizations.read().get(&id).cloned())
    }

    async fn organization_members(&self, id: OrganizationId) -> StoreResult<Vec<AccountId>> {
        self.enter().await?;
        Ok(self
            .accounts
            .read()
            .rows
            .values()
            .filter(|a| a.organization_id == Some(id))
            .map(|a| a.id)
            .collect())
    }

    async fn start_trial(&self, account_id: AccountId, at: DateTime<Utc>) -> StoreResult<Account> {
        self.enter().await?;
        let mut accounts = self.accounts.write();
        let account = accounts
            .rows
            .get_mut(&account_id)
            .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))?;
        if account.trial_used {
            return Err(StoreError::Conflict(format!("trial already used by {account_id}")));
        }
        account.trial_start = Some(at);
        account.trial_used = true;
        Ok(account.clone())
    }

    async fn link_wallet(&self, wallet: LinkedWallet, guard: WalletGuard<'_>) -> StoreResult<LinkOutcome> {
        self.enter().await?;
        let accounts = self.accounts.read();
        let owner = accounts
            .rows
            .get(&wallet.account_id)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", wallet.account_id)))?;

        // Held for check and insert: concurrent links serialize here.
        let mut wallets = self.wallets.write();
        let key = (wallet.wallet_address.clone(), wallet.chain_id.clone());
        if accounts.by_primary.contains_key(&key) || wallets.by_key.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{} on {} already registered", key.0, key.1)));
        }

        let mut set = vec![WalletRecord::primary(owner)];
        set.extend(
            wallets
                .rows
                .values()
                .filter(|w| w.account_id == wallet.account_id)
                .map(WalletRecord::linked),
        );
        set.push(WalletRecord::linked(&wallet));
        if !guard(&set) {
            return Ok(LinkOutcome::Refused);
        }

        wallets.by_key.insert(key, wallet.id);
        wallets.rows.insert(wallet.id, wallet.clone());
        Ok(LinkOutcome::Linked(wallet))
    }

    async fn unlink_wallet(&self, wallet_id: WalletId) -> StoreResult<UnlinkOutcome> {
        self.enter().await?;
        let mut wallets = self.wallets.write();
        if !wallets.rows.contains_key(&wallet_id) {
            return Err(StoreError::NotFound(format!("linked wallet {wallet_id}")));
        }
        if self.transactions.read().values().any(|t| t.wallet_id == Some(wallet_id)) {
            return Ok(UnlinkOutcome::HasHistory);
        }
        if let Some(wallet) = wallets.rows.remove(&wallet_id) {
            wallets.by_key.remove(&(wallet.wallet_address, wallet.chain_id));
        }
        Ok(UnlinkOutcome::Removed)
    }

    async fn usage(&self, key: UsageKey) -> StoreResult<u64> {
        self.enter().await?;
        Ok(self.counter(&key))
    }

    async fn sum_usage(&self, accounts: &[AccountId], period: BillingMonth) -> StoreResult<u64> {
        self.enter().await?;
        Ok(accounts
            .iter()
            .map(|id| self.counter(&UsageKey::new(*id, period)))
            .sum())
    }

    async fn increment_usage(&self, key: UsageKey, limit: u64) -> StoreResult<Option<u64>> {
        self.enter().await?;
        // Entry holds the shard lock across compare and write.
        match self.usage.entry(key) {
            Entry::Occupied(mut used) => {
                if *used.get() >= limit {
                    return Ok(None);
                }
                *used.get_mut() += 1;
                Ok(Some(*used.get()))
            }
            Entry::Vacant(slot) if limit > 0 => {
                slot.insert(1);
                Ok(Some(1))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn increment_pooled_usage(&self, key: UsageKey, members: &[AccountId], limit: u64) -> StoreResult<Option<u64>> {
        self.enter().await?;
        let _pool = self.pool.lock();
        let total: u64 = members
            .iter()
            .map(|id| self.counter(&UsageKey::new(*id, key.period)))
            .sum();
        if total >= limit {
            return Ok(None);
        }
        *self.usage.entry(key).or_insert(0) += 1;
        Ok(Some(total + 1))
    }

    async fn reset_usage(&self, key: UsageKey) -> StoreResult<()> {
        self.enter().await?;
        self.usage.remove(&key);
        Ok(())
    }

    async fn record_usage_event(
        &self,
        account_id: AccountId,
        at: DateTime<Utc>,
        since: DateTime<Utc>,
        limit: u64,
    ) -> StoreResult<Option<u64>> {
        self.enter().await?;
        let mut events = self.usage_events.entry(account_id).or_default();
        events.retain(|t| *t >= since);
        let in_window = events.iter().filter(|t| **t <= at).count() as u64;
        if in_window >= limit {
            return Ok(None);
        }
        events.push(at);
        Ok(Some(in_window + 1))
    }

    async fn count_usage_events(&self, account_id: AccountId, since: DateTime<Utc>, until: DateTime<Utc>) -> StoreResult<u64> {
        self.enter().await?;
        Ok(self
            .usage_events
            .get(&account_id)
            .map(|events| events.iter().filter(|t| **t >= since && **t <= until).count() as u64)
            .unwrap_or(0))
    }

    async fn transaction_volume(
        &self,
        account_id: AccountId,
        kind: Option<TransactionKind>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Decimal> {
        self.enter().await?;
        Ok(Self::volume_of(&self.transactions.read(), account_id, kind, from, to))
    }

    async fn insert_transaction(&self, record: TransactionRecord, guard: VolumeGuard) -> StoreResult<CappedInsert> {
        self.enter().await?;
        let mut transactions = self.transactions.write();
        if transactions.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!("transaction {} exists", record.id)));
        }
        let (from, to) = BillingMonth::containing(record.created_at).bounds();
        let prior_volume = Self::volume_of(&transactions, record.account_id, guard.kind, from, to);
        if !guard.cap.admits(prior_volume, record.amount) {
            return Ok(CappedInsert::Refused { prior_volume });
        }
        transactions.insert(record.id, record);
        Ok(CappedInsert::Inserted { prior_volume })
    }

    async fn transaction(&self, id: TransactionId) -> StoreResult<Option<TransactionRecord>> {
        self.enter().await?;
        Ok(self.transactions.read().get(&id).cloned())
    }

    async fn update_transaction_status(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        next: TransactionStatus,
    ) -> StoreResult<TransactionRecord> {
        self.enter().await?;
        let mut transactions = self.transactions.write();
        let record = transactions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {id}")))?;
        if record.status != expected {
            return Err(StoreError::Conflict(format!(
                "transaction {id} is {:?}, expected {:?}",
                record.status, expected
            )));
        }
        record.status = next;
        Ok(record.clone())
    }
}
