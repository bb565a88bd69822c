//! Configuration: TOML file, environment overrides, logging setup.

pub mod logging;
pub mod settings;
pub mod simulation;

pub use logging::LoggingConfig;
pub use settings::Config;
pub use simulation::{InstrumentSeed, SeedPosition, SimulationConfig};
