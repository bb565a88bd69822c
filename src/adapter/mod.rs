//! Implementations of ports (hexagonal adapters).
//!
//! - [`memory`] - in-memory position store, transactions and payment ledger
//! - [`simulated`] - random-walk price feed
//! - [`inbound`] - command-line interface

pub mod inbound;
pub mod memory;
pub mod simulated;
