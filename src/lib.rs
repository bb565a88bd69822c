//! Tripwire - stop-loss, take-profit and margin-call execution core.
//!
//! Watches open trading positions against a live price stream and closes
//! them when a threshold is crossed or a user's aggregate short exposure
//! goes underwater. Closing and paying out happen in one storage
//! transaction, guarded so that a position settles at most once.
//!
//! # Architecture
//!
//! - [`domain`] - positions, ticks, events, threshold and margin math
//! - [`port`] - collaborator traits: store, prices, payments, transactions
//! - [`application`] - watcher registry, margin aggregator, fan-out,
//!   settlement, trading service and the engine that runs them
//! - [`adapter`] - in-memory collaborators, simulated feed, CLI
//! - [`infrastructure`] - configuration, logging, composition root
//! - [`error`] - error types for the crate
//!
//! # Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use tripwire::infrastructure::{bootstrap, config::Config};
//!
//! # async fn demo() -> tripwire::error::Result<()> {
//! let config = Config::load("tripwire.toml")?;
//! config.init_logging();
//! bootstrap::run(config, CancellationToken::new()).await
//! # }
//! ```

pub mod adapter;
pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod port;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
