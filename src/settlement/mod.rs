//! Joint Account Settlement
//!
//! Periodic reconciliation ("apuração") of shared accounts:
//! 1. Share set validation (basis points, exact 10000 partition)
//! 2. Largest-remainder allocation of the balance in integer cents
//! 3. Keep-positive balance policy
//! 4. Settlement engine (one snapshot, optimistic append)
//! 5. Append-only settlement ledger (in-memory and SQLite)
//!
//! Accounts and contributions are read through `AccountSource` and
//! `ContributionSource`; ordinary CRUD lives outside this module.

pub mod allocation;
pub mod db;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod models;
pub mod policy;
pub mod shares;
pub mod sources;

pub use allocation::{allocate, Allocation};
pub use db::SettlementDb;
pub use engine::SettlementEngine;
pub use error::{LedgerError, SettlementError};
pub use ledger::{InMemoryLedger, SettlementLedger};
pub use models::*;
pub use policy::PolicyDecision;
pub use shares::{basis_points_from_percent, ShareSet, ShareSetViolation};
pub use sources::{AccountSource, ContributionCursor, ContributionSource, InMemoryDirectory};
