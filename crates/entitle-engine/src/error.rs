//! Entitlement error taxonomy

use entitle_common::{AccountId, ChainId, DomainError, StoreError, TransactionStatus, WalletAddress};
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

/// Engine result type
pub type EntitlementResult<T> = Result<T, EntitlementError>;

/// Rejection class, mapped onto HTTP-like status codes by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Caller sent something wrong or unknown
    Client,
    /// User-actionable: upgrade, wait for the period to roll, start a trial
    Limit,
    /// Misconfiguration; alert
    Fatal,
    /// Backend trouble; retry at the integration boundary
    Transient,
}

/// Entitlement error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EntitlementError {
    /// Malformed address, chain id or request shape
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No primary or linked wallet matches
    #[error("identity not found: {address} on {chain}")]
    IdentityNotFound { address: WalletAddress, chain: ChainId },

    /// Account id supplied directly does not exist
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    /// Free trial window has elapsed
    #[error("free trial expired for account {account_id}")]
    TrialExpired { account_id: AccountId },

    /// Query quota reached for the period
    #[error("query quota exceeded: {used}/{limit}")]
    QuotaExceeded { used: u64, limit: u64 },

    /// Monthly transaction volume would exceed the cap
    #[error("transaction limit exceeded: {current} + {proposed} > {cap} (remaining {remaining})")]
    TransactionLimitExceeded {
        current: Decimal,
        proposed: Decimal,
        cap: Decimal,
        remaining: Decimal,
    },

    /// Linking would push billable wallets past the plan limit
    #[error("wallet limit exceeded: {unique}/{limit} billable wallets")]
    WalletLimitExceeded { unique: u32, limit: u32 },

    /// Linked wallet is referenced by transaction history
    #[error("linked wallet has transaction history")]
    WalletHasHistory,

    /// Status may only move forward out of pending
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidStatusTransition { from: TransactionStatus, to: TransactionStatus },

    /// Uniqueness or state conflict reported by the store
    #[error("conflict: {0}")]
    Conflict(String),

    /// No Free plan defined
    #[error("plan unavailable: {0}")]
    PlanUnavailable(String),

    /// Store failed or unreachable
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Resolution chain did not finish in time
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl EntitlementError {
    /// Conventional HTTP status
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::TrialExpired { .. } => 403,
            Self::IdentityNotFound { .. } | Self::AccountNotFound(_) => 404,
            Self::WalletHasHistory | Self::InvalidStatusTransition { .. } | Self::Conflict(_) => 409,
            Self::QuotaExceeded { .. } | Self::TransactionLimitExceeded { .. } | Self::WalletLimitExceeded { .. } => 429,
            Self::PlanUnavailable(_) | Self::StoreUnavailable(_) => 500,
            Self::DeadlineExceeded(_) => 503,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::InvalidInput(_)
            | Self::IdentityNotFound { .. }
            | Self::AccountNotFound(_)
            | Self::WalletHasHistory
            | Self::InvalidStatusTransition { .. }
            | Self::Conflict(_) => Severity::Client,
            Self::TrialExpired { .. }
            | Self::QuotaExceeded { .. }
            | Self::TransactionLimitExceeded { .. }
            | Self::WalletLimitExceeded { .. } => Severity::Limit,
            Self::PlanUnavailable(_) => Severity::Fatal,
            Self::StoreUnavailable(_) | Self::DeadlineExceeded(_) => Severity::Transient,
        }
    }

    /// Lenient routes turn these into a silent pass
    pub fn is_lenient_downgradable(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::IdentityNotFound { .. }
                | Self::AccountNotFound(_)
                | Self::TrialExpired { .. }
                | Self::QuotaExceeded { .. }
                | Self::TransactionLimitExceeded { .. }
                | Self::WalletLimitExceeded { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.severity() == Severity::Transient
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::IdentityNotFound { .. } => "identity_not_found",
            Self::AccountNotFound(_) => "account_not_found",
            Self::TrialExpired { .. } => "trial_expired",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::TransactionLimitExceeded { .. } => "transaction_limit_exceeded",
            Self::WalletLimitExceeded { .. } => "wallet_limit_exceeded",
            Self::WalletHasHistory => "wallet_has_history",
            Self::InvalidStatusTransition { .. } => "invalid_status_transition",
            Self::Conflict(_) => "conflict",
            Self::PlanUnavailable(_) => "plan_unavailable",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
        }
    }
}

impl From<DomainError> for EntitlementError {
    fn from(err: DomainError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

impl From<StoreError> for EntitlementError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::InvalidInput(format!("unknown {what}")),
            StoreError::Conflict(what) => Self::Conflict(what),
            StoreError::Unavailable(why) => Self::StoreUnavailable(why),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_codes() {
        assert_eq!(EntitlementError::InvalidInput("x".into()).status_code(), 400);
        assert_eq!(EntitlementError::TrialExpired { account_id: AccountId::nil() }.status_code(), 403);
        assert_eq!(EntitlementError::QuotaExceeded { used: 1, limit: 1 }.status_code(), 429);
        assert_eq!(EntitlementError::PlanUnavailable("free".into()).status_code(), 500);
        assert_eq!(EntitlementError::StoreUnavailable("down".into()).status_code(), 500);
    }

    #[test]
    fn test_leniency_classes() {
        let limit = EntitlementError::TransactionLimitExceeded {
            current: dec!(0),
            proposed: dec!(6000),
            cap: dec!(5000),
            remaining: dec!(5000),
        };
        assert!(limit.is_lenient_downgradable());
        assert!(!limit.is_retryable());

        let fatal = EntitlementError::PlanUnavailable("no free tier".into());
        assert!(!fatal.is_lenient_downgradable());
        assert_eq!(fatal.severity(), Severity::Fatal);

        let transient = EntitlementError::StoreUnavailable("timeout".into());
        assert!(!transient.is_lenient_downgradable());
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_store_error_mapping() {
        let err: EntitlementError = StoreError::Unavailable("conn reset".into()).into();
        assert!(matches!(err, EntitlementError::StoreUnavailable(_)));
        let err: EntitlementError = StoreError::Conflict("dup".into()).into();
        assert_eq!(err.status_code(), 409);
    }
}
