//! Value Objects - validated identity primitives
//!
//! Every constructor validates; once built, a value is known to be well
//! formed and the engine never re-checks it.

use crate::error::DomainError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("static address pattern"))
}

/// Wallet address (Value Object)
///
/// # Invariants
/// - `0x` followed by exactly 40 hex digits
/// - Stored lower-cased, so equality is case-insensitive
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    /// Parse and canonicalize an address
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, DomainError> {
        let raw = raw.as_ref().trim();
        if !address_pattern().is_match(raw) {
            return Err(DomainError::InvalidWalletAddress(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    /// Canonical lower-case form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chain identifier (Value Object)
///
/// # Invariants
/// - Non-empty, max 64 characters
/// - No whitespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainId(String);

impl ChainId {
    /// Create new chain id with validation
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DomainError::InvalidChainId("cannot be empty".into()));
        }
        if id.len() > 64 {
            return Err(DomainError::InvalidChainId("max 64 characters".into()));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidChainId(format!("whitespace in {id:?}")));
        }
        Ok(Self(id))
    }

    /// Raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChainId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChainId> for String {
    fn from(value: ChainId) -> Self {
        value.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Route identifier used by the leniency allow-list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RouteId(String);

impl RouteId {
    /// Create new route id
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DomainError::InvalidRouteId("cannot be empty".into()));
        }
        Ok(Self(id))
    }

    /// Raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RouteId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RouteId> for String {
    fn from(value: RouteId) -> Self {
        value.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_address_canonical() {
        let addr = WalletAddress::parse("0xAbCdEf0123456789abcdef0123456789ABCDEF01").unwrap();
        assert_eq!(addr.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");

        let same = WalletAddress::parse("0xabcdef0123456789ABCDEF0123456789abcdef01").unwrap();
        assert_eq!(addr, same);
    }

    #[test]
    fn test_wallet_address_rejects_malformed() {
        assert!(WalletAddress::parse("").is_err());
        assert!(WalletAddress::parse("0x1234").is_err());
        assert!(WalletAddress::parse("abcdef0123456789abcdef0123456789abcdef0101").is_err());
        assert!(WalletAddress::parse("0xzzcdef0123456789abcdef0123456789abcdef01").is_err());
        assert!(WalletAddress::parse("0xabcdef0123456789abcdef0123456789abcdef0100").is_err());
    }

    #[test]
    fn test_chain_id_validation() {
        assert!(ChainId::new("polygon").is_ok());
        assert!(ChainId::new("137").is_ok());
        assert!(ChainId::new("").is_err());
        assert!(ChainId::new("eth main").is_err());
        assert!(ChainId::new("x".repeat(65)).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let ok: Result<ChainId, _> = serde_json::from_str("\"base\"");
        assert!(ok.is_ok());
        let bad: Result<WalletAddress, _> = serde_json::from_str("\"0x12\"");
        assert!(bad.is_err());
    }
}
