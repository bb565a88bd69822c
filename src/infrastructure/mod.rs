//! Infrastructure layer.
//!
//! - [`bootstrap`] - composition root for the simulated runtime
//! - [`config`] - configuration loading, validation and logging setup

pub mod bootstrap;
pub mod config;
