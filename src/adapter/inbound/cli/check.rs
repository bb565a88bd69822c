//! Handler for the `check` command.

use std::fmt::Write as _;

use super::command::CheckArgs;
use crate::error::Result;
use crate::infrastructure::config::Config;

/// Validate the configuration file and print it.
pub fn execute(args: &CheckArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    println!("{}", render(&config, args.json)?);
    Ok(())
}

/// Effective configuration as pretty JSON or a short human summary.
pub fn render(config: &Config, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(config)?);
    }
    let mut out = String::from("Configuration is valid\n");
    let engine = &config.engine;
    let sim = &config.simulation;
    // Writing to a String cannot fail.
    let _ = writeln!(out, "  logging: {} ({})", config.logging.level, config.logging.format);
    let _ = writeln!(
        out,
        "  engine: closure_buffer={} control_buffer={} settlement_concurrency={} call_timeout_ms={}",
        engine.closure_buffer,
        engine.control_buffer,
        engine.settlement_concurrency,
        engine.call_timeout_ms
    );
    let _ = writeln!(
        out,
        "  backoff: {}ms..{}ms x{}",
        config.backoff.initial_delay_ms, config.backoff.max_delay_ms, config.backoff.multiplier
    );
    let names: Vec<&str> = sim.instruments.iter().map(|i| i.name.as_str()).collect();
    let _ = write!(
        out,
        "  simulation: {} instruments [{}], {} seed positions, tick every {}ms",
        names.len(),
        names.join(", "),
        sim.positions.len(),
        sim.tick_interval_ms
    );
    Ok(out)
}
