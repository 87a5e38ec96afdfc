//! Joint account settlement engine
//!
//! Exposes the settlement core and its storage adapters for the CLI and tests.

pub mod config;
pub mod settlement;

pub use settlement::{SettlementEngine, SettlementError, SettlementRun};
