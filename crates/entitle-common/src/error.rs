//! Error types shared by the domain model and the store

use thiserror::Error;

/// Value-object validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Wallet address is not `0x` followed by 40 hex digits
    #[error("invalid wallet address: {0}")]
    InvalidWalletAddress(String),

    /// Chain id is empty or malformed
    #[error("invalid chain id: {0}")]
    InvalidChainId(String),

    /// Route id is empty or malformed
    #[error("invalid route id: {0}")]
    InvalidRouteId(String),

    /// Calendar period out of range
    #[error("invalid period: {0}")]
    InvalidPeriod(String),
}

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Record addressed by id does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness or state constraint violated
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend unreachable or failed mid-call
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
