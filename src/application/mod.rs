//! Application services: the execution core.
//!
//! - [`watcher`]: stop-loss and take-profit watchers
//! - [`margin`]: per-user aggregate short P&L and forced liquidation
//! - [`fanout`]: tick relay into both registries
//! - [`settlement`]: close-and-pay orchestration
//! - [`lifecycle`]: change-feed driven watcher management
//! - [`trading`]: user-facing open, threshold and close operations
//! - [`engine`]: pumps tying the above to the collaborators

pub mod backoff;
pub mod config;
pub mod engine;
pub mod fanout;
pub mod lifecycle;
pub mod margin;
pub mod settlement;
pub mod trading;
pub mod watcher;

pub use config::{BackoffConfig, EngineConfig};
pub use engine::{Collaborators, Engine, ReportOutcome, SettlementReport};
pub use fanout::{FanoutStats, PriceFanout};
pub use margin::MarginAggregator;
pub use settlement::{SettlementOutcome, Settler};
pub use trading::TradingService;
pub use watcher::{DeliveryStats, ThresholdRegistry};
