//! Transaction Ledger
//!
//! Caps monthly transaction volume per tier. Volume is the sum of pending
//! and completed amounts created in the UTC calendar month.

use crate::error::{EntitlementError, EntitlementResult};
use crate::plans::EffectivePlan;
use crate::trial::TrialPolicy;
use chrono::{DateTime, Utc};
use entitle_common::{
    Account, AccountId, BillingMonth, CappedInsert, EntitlementStore, TransactionId, TransactionKind, TransactionRecord,
    TransactionStatus, VolumeCap, VolumeGuard, WalletId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Volume context handed to downstream consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub period: BillingMonth,
    pub current: Decimal,
    pub cap: VolumeCap,
    /// `None` when unlimited
    pub remaining: Option<Decimal>,
}

/// Transaction ledger
pub struct TransactionLedger {
    store: Arc<dyn EntitlementStore>,
    trial: TrialPolicy,
}

impl TransactionLedger {
    pub fn new(store: Arc<dyn EntitlementStore>, trial: TrialPolicy) -> Self {
        Self { store, trial }
    }

    /// Volume across all transaction classes for one calendar month
    pub async fn monthly_volume(&self, account_id: AccountId, year: i32, month: u32) -> EntitlementResult<Decimal> {
        let period = BillingMonth::new(year, month)?;
        self.volume(account_id, None, period).await
    }

    /// Admission check; nothing is written
    pub async fn check(
        &self,
        account_id: AccountId,
        plan: &EffectivePlan,
        amount: Decimal,
        kind: TransactionKind,
        now: DateTime<Utc>,
    ) -> EntitlementResult<VolumeSnapshot> {
        validate_amount(amount)?;
        let guard = volume_guard(plan, kind);
        let period = BillingMonth::containing(now);
        let current = self.volume(account_id, guard.kind, period).await?;

        if !guard.cap.admits(current, amount) {
            return Err(limit_exceeded(guard.cap, current, amount));
        }
        Ok(VolumeSnapshot {
            period,
            current,
            cap: guard.cap,
            remaining: guard.cap.remaining(current),
        })
    }

    /// Check and create a pending record in one store call
    pub async fn submit(
        &self,
        account_id: AccountId,
        plan: &EffectivePlan,
        amount: Decimal,
        kind: TransactionKind,
        wallet_id: Option<WalletId>,
        now: DateTime<Utc>,
    ) -> EntitlementResult<TransactionRecord> {
        validate_amount(amount)?;
        let guard = volume_guard(plan, kind);
        let mut record = TransactionRecord::pending(account_id, kind, amount, now);
        record.wallet_id = wallet_id;

        match self.store.insert_transaction(record.clone(), guard).await? {
            CappedInsert::Inserted { prior_volume } => {
                tracing::info!(%account_id, transaction_id = %record.id, %amount, %prior_volume, "transaction submitted");
                Ok(record)
            }
            CappedInsert::Refused { prior_volume } => {
                tracing::warn!(%account_id, %amount, %prior_volume, "transaction volume cap reached");
                Err(limit_exceeded(guard.cap, prior_volume, amount))
            }
        }
    }

    /// Move a pending record to a terminal status
    pub async fn advance(&self, id: TransactionId, next: TransactionStatus) -> EntitlementResult<TransactionRecord> {
        let record = self
            .store
            .transaction(id)
            .await?
            .ok_or_else(|| EntitlementError::InvalidInput(format!("unknown transaction {id}")))?;
        if !record.status.can_transition_to(next) {
            return Err(EntitlementError::InvalidStatusTransition { from: record.status, to: next });
        }
        let updated = self.store.update_transaction_status(id, record.status, next).await?;
        tracing::info!(transaction_id = %id, status = ?next, "transaction status advanced");
        Ok(updated)
    }

    /// Wallet-less administrative action: no volume check, but a Free
    /// account still needs a live trial
    pub async fn authorize_administrative(&self, account: &Account, plan: &EffectivePlan, now: DateTime<Utc>) -> EntitlementResult<()> {
        if plan.is_free() && !self.trial.status(account, now).is_active() {
            return Err(EntitlementError::TrialExpired { account_id: account.id });
        }
        Ok(())
    }

    async fn volume(&self, account_id: AccountId, kind: Option<TransactionKind>, period: BillingMonth) -> EntitlementResult<Decimal> {
        let (from, to) = period.bounds();
        Ok(self.store.transaction_volume(account_id, kind, from, to).await?)
    }
}

/// A class the tier withholds is measured on its own
fn volume_guard(plan: &EffectivePlan, kind: TransactionKind) -> VolumeGuard {
    let cap = plan.volume_cap(kind);
    let withheld = cap != plan.volume_cap(TransactionKind::Invoice);
    VolumeGuard {
        cap,
        kind: withheld.then_some(kind),
    }
}

fn validate_amount(amount: Decimal) -> EntitlementResult<()> {
    if amount <= Decimal::ZERO {
        return Err(EntitlementError::InvalidInput(format!("amount must be positive, got {amount}")));
    }
    Ok(())
}

fn limit_exceeded(cap: VolumeCap, current: Decimal, proposed: Decimal) -> EntitlementError {
    let limit = match cap {
        VolumeCap::Limited(limit) => limit,
        VolumeCap::Unlimited => Decimal::MAX,
    };
    EntitlementError::TransactionLimitExceeded {
        current,
        proposed,
        cap: limit,
        remaining: cap.remaining(current).unwrap_or(Decimal::MAX),
    }
}
