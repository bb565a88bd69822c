//! Shared test utilities available to both unit and integration tests.
//!
//! Enabled via `#[cfg(test)]` (unit tests) or the `testkit` feature
//! (integration tests).
//!
//! # Modules
//!
//! - [`stream`] - Channel-backed price feed with an external control handle.
//! - [`domain`] - Builders for positions and ticks.
//! - [`config`] - Fast engine and backoff settings.

pub mod config;
pub mod domain;
pub mod stream;

pub use stream::{channel_feed, ChannelPriceFeed, PriceFeedHandle};
