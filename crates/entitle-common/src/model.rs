//! Billing / Identity Data Model

use crate::error::DomainError;
use crate::value_objects::{ChainId, WalletAddress};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Account ID
pub type AccountId = Uuid;
/// Organization ID
pub type OrganizationId = Uuid;
/// Plan ID
pub type PlanId = Uuid;
/// Linked wallet ID
pub type WalletId = Uuid;
/// Transaction record ID
pub type TransactionId = Uuid;

/// Registered principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account ID
    pub id: AccountId,
    /// Primary wallet address
    pub wallet_address: WalletAddress,
    /// Chain of the primary wallet
    pub chain_id: ChainId,
    /// Individually assigned plan
    pub plan_id: Option<PlanId>,
    /// Organization membership
    pub organization_id: Option<OrganizationId>,
    /// Start of the free trial
    pub trial_start: Option<DateTime<Utc>>,
    /// Trial has been consumed
    pub trial_used: bool,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Create new account on its primary wallet
    pub fn new(wallet_address: WalletAddress, chain_id: ChainId) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_address,
            chain_id,
            plan_id: None,
            organization_id: None,
            trial_start: None,
            trial_used: false,
            created_at: Utc::now(),
        }
    }

    /// Assign an individual plan
    pub fn with_plan(mut self, plan_id: PlanId) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    /// Join an organization
    pub fn with_organization(mut self, organization_id: OrganizationId) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    /// Mark the trial as started at `at`
    pub fn with_trial_start(mut self, at: DateTime<Utc>) -> Self {
        self.trial_start = Some(at);
        self.trial_used = true;
        self
    }
}

/// Secondary wallet billed against its owner's account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedWallet {
    /// Unique wallet ID
    pub id: WalletId,
    /// Owning account
    pub account_id: AccountId,
    /// Wallet address
    pub wallet_address: WalletAddress,
    /// Chain the address is registered on
    pub chain_id: ChainId,
    /// Ownership proof presented at link time
    pub proof: String,
    /// Link time
    pub created_at: DateTime<Utc>,
}

impl LinkedWallet {
    /// Create new linked wallet
    pub fn new(account_id: AccountId, wallet_address: WalletAddress, chain_id: ChainId, proof: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            wallet_address,
            chain_id,
            proof: proof.into(),
            created_at: Utc::now(),
        }
    }
}

/// Where a wallet in an account's wallet set comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletSource {
    /// The account's own wallet
    Primary,
    /// A linked wallet
    Linked(WalletId),
}

/// One entry of an account's full wallet set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    /// Primary or linked
    pub source: WalletSource,
    /// Wallet address
    pub wallet_address: WalletAddress,
    /// Chain the address is registered on
    pub chain_id: ChainId,
    /// Registration or link time
    pub created_at: DateTime<Utc>,
}

impl WalletRecord {
    /// Primary wallet of an account
    pub fn primary(account: &Account) -> Self {
        Self {
            source: WalletSource::Primary,
            wallet_address: account.wallet_address.clone(),
            chain_id: account.chain_id.clone(),
            created_at: account.created_at,
        }
    }

    /// Linked wallet entry
    pub fn linked(wallet: &LinkedWallet) -> Self {
        Self {
            source: WalletSource::Linked(wallet.id),
            wallet_address: wallet.wallet_address.clone(),
            chain_id: wallet.chain_id.clone(),
            created_at: wallet.created_at,
        }
    }
}

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlanTier {
    /// Trial-gated default
    Free,
    /// Entry paid tier
    Basic,
    /// Team tier
    Pro,
    /// Unlimited volume
    Premium,
}

impl PlanTier {
    /// All tiers, cheapest first
    pub const ALL: [PlanTier; 4] = [Self::Free, Self::Basic, Self::Pro, Self::Premium];

    /// Tier name as stored
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Basic => "Basic",
            Self::Pro => "Pro",
            Self::Premium => "Premium",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric limits carried by a tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Queries per period
    pub query_limit: u64,
    /// Billable (deduplicated) wallets
    pub wallet_limit: u32,
    /// Monthly transaction volume, `None` is unlimited
    pub txn_limit: Option<Decimal>,
    /// Monthly price
    pub price: Decimal,
}

/// Transaction volume ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeCap {
    /// At most this much per month
    Limited(Decimal),
    /// No ceiling
    Unlimited,
}

impl VolumeCap {
    /// True when `current + proposed` stays within the cap; a sum past
    /// `Decimal::MAX` never fits a limited cap
    pub fn admits(&self, current: Decimal, proposed: Decimal) -> bool {
        match self {
            Self::Limited(cap) => current.checked_add(proposed).map_or(false, |sum| sum <= *cap),
            Self::Unlimited => true,
        }
    }

    /// Headroom left, `None` when unlimited
    pub fn remaining(&self, current: Decimal) -> Option<Decimal> {
        match self {
            Self::Limited(cap) => Some(cap.checked_sub(current).map_or(Decimal::ZERO, |left| left.max(Decimal::ZERO))),
            Self::Unlimited => None,
        }
    }
}

/// Purchasable plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan ID
    pub id: PlanId,
    /// Tier the plan sells
    pub tier: PlanTier,
    /// Limits granted
    pub limits: TierLimits,
}

impl Plan {
    /// Create new plan
    pub fn new(tier: PlanTier, limits: TierLimits) -> Self {
        Self { id: Uuid::new_v4(), tier, limits }
    }
}

/// Organization sharing one plan across member accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    /// Unique organization ID
    pub id: OrganizationId,
    /// Owning account
    pub owner_account_id: AccountId,
    /// Plan shared by every member
    pub plan_id: Option<PlanId>,
}

impl Organization {
    /// Create new organization
    pub fn new(owner_account_id: AccountId, plan_id: Option<PlanId>) -> Self {
        Self { id: Uuid::new_v4(), owner_account_id, plan_id }
    }
}

/// UTC calendar month
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillingMonth {
    /// Calendar year
    pub year: i32,
    /// Month, 1-12
    pub month: u32,
}

impl BillingMonth {
    /// Create validated month; both bounds must be representable
    pub fn new(year: i32, month: u32) -> Result<Self, DomainError> {
        if !(1..=12).contains(&month) {
            return Err(DomainError::InvalidPeriod(format!("month {month} out of range")));
        }
        let period = Self { year, month };
        let (next_year, next_month) = period.following();
        if month_start(year, month).is_none() || next_year.and_then(|y| month_start(y, next_month)).is_none() {
            return Err(DomainError::InvalidPeriod(format!("{year}-{month:02} out of supported range")));
        }
        Ok(period)
    }

    /// Month containing `at`
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self { year: at.year(), month: at.month() }
    }

    /// Half-open `[start, end)` bounds of the month
    ///
    /// Saturates at chrono's representable range, reachable only for the
    /// last supported month.
    pub fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let (next_year, next_month) = self.following();
        let start = month_start(self.year, self.month).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = next_year
            .and_then(|y| month_start(y, next_month))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (start, end)
    }

    fn following(&self) -> (Option<i32>, u32) {
        if self.month == 12 {
            (self.year.checked_add(1), 1)
        } else {
            (Some(self.year), self.month + 1)
        }
    }

    /// True when `at` falls inside the month
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at.year() == self.year && at.month() == self.month
    }
}

impl fmt::Display for BillingMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

fn month_start(year: i32, month: u32) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)))
}

/// Usage counter key: one row per account per billing month
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageKey {
    /// Counted account
    pub account_id: AccountId,
    /// Billing month
    pub period: BillingMonth,
}

impl UsageKey {
    /// Key for one account's month
    pub fn new(account_id: AccountId, period: BillingMonth) -> Self {
        Self { account_id, period }
    }
}

/// Transaction class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Invoice settled on a single chain
    Invoice,
    /// Transfer spanning two chains
    CrossChainTransfer,
}

/// Transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Submitted, counts toward volume
    Pending,
    /// Settled, counts toward volume
    Completed,
    /// Terminal, no longer counted
    Failed,
    /// Terminal, no longer counted
    Cancelled,
}

impl TransactionStatus {
    /// Only `Pending` may move, and only to a terminal status
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Completed) | (Self::Pending, Self::Failed) | (Self::Pending, Self::Cancelled)
        )
    }

    /// Counts toward monthly volume
    pub fn counts_toward_volume(&self) -> bool {
        matches!(self, Self::Pending | Self::Completed)
    }
}

/// Submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Unique record ID
    pub id: TransactionId,
    /// Submitting account
    pub account_id: AccountId,
    /// Originating linked wallet, if any
    pub wallet_id: Option<WalletId>,
    /// Transaction class
    pub kind: TransactionKind,
    /// Positive amount
    pub amount: Decimal,
    /// Lifecycle status
    pub status: TransactionStatus,
    /// Submission time, decides the billing month
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Create new pending record
    pub fn pending(account_id: AccountId, kind: TransactionKind, amount: Decimal, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            wallet_id: None,
            kind,
            amount,
            status: TransactionStatus::Pending,
            created_at,
        }
    }

    /// Attribute the record to a linked wallet
    pub fn from_wallet(mut self, wallet_id: WalletId) -> Self {
        self.wallet_id = Some(wallet_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_billing_month_bounds() {
        let dec_month = BillingMonth::new(2025, 12).unwrap();
        let (start, end) = dec_month.bounds();
        assert_eq!(start.to_rfc3339(), "2025-12-01T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2026-01-01T00:00:00+00:00");
        assert!(dec_month.contains(start));
        assert!(!dec_month.contains(end));
        assert!(BillingMonth::new(2025, 13).is_err());
    }

    #[test]
    fn test_billing_month_outside_calendar_range() {
        assert!(matches!(BillingMonth::new(i32::MAX, 12), Err(DomainError::InvalidPeriod(_))));
        assert!(matches!(BillingMonth::new(i32::MIN, 1), Err(DomainError::InvalidPeriod(_))));
        assert!(BillingMonth::new(9999, 12).is_ok());
    }

    #[test]
    fn test_status_transitions() {
        assert!(TransactionStatus::Pending.can_transition_to(TransactionStatus::Completed));
        assert!(TransactionStatus::Pending.can_transition_to(TransactionStatus::Cancelled));
        assert!(!TransactionStatus::Completed.can_transition_to(TransactionStatus::Failed));
        assert!(!TransactionStatus::Pending.can_transition_to(TransactionStatus::Pending));
    }

    #[test]
    fn test_volume_cap() {
        let cap = VolumeCap::Limited(dec!(5000));
        assert!(cap.admits(dec!(0), dec!(5000)));
        assert!(!cap.admits(dec!(0), dec!(6000)));
        assert_eq!(cap.remaining(dec!(7000)), Some(dec!(0)));
        assert!(VolumeCap::Unlimited.admits(dec!(1_000_000), dec!(1)));
        assert_eq!(VolumeCap::Unlimited.remaining(dec!(1)), None);
    }

    #[test]
    fn test_volume_cap_sum_past_decimal_max() {
        let cap = VolumeCap::Limited(dec!(5000));
        assert!(!cap.admits(dec!(10), Decimal::MAX));
        assert!(!cap.admits(Decimal::MAX, Decimal::MAX));
        assert!(VolumeCap::Unlimited.admits(Decimal::MAX, Decimal::MAX));
    }
}
