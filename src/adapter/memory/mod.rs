//! In-memory collaborators for the simulator and tests.

mod ledger;
mod store;

pub use ledger::MemoryLedger;
pub use store::MemoryPositionStore;
