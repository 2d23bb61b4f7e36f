//! Entitlement Common - shared types for the entitlement engine
//!
//! This crate provides the pieces every engine component agrees on:
//! - Validated value objects (wallet addresses, chain ids, route ids)
//! - The billing/identity data model (accounts, linked wallets, plans,
//!   organizations, usage keys, transaction records)
//! - The persistent-store abstraction and an in-memory reference store
//!
//! # Store contract
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      ENTITLEMENT STORE                           │
//! │                                                                  │
//! │  point lookups      primary wallet │ linked wallet │ account     │
//! │  aggregation        org members │ usage sums │ volume sums       │
//! │  atomic primitives  increment-or-insert │ guarded wallet insert  │
//! │                     capped transaction insert │ status CAS       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod model;
pub mod store;
pub mod value_objects;

pub use error::*;
pub use model::*;
pub use store::{CappedInsert, EntitlementStore, InMemoryStore, LinkOutcome, UnlinkOutcome, VolumeGuard, WalletGuard};
pub use value_objects::*;
