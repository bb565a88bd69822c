//! Configuration file loading.

use std::io::Write;

use tempfile::NamedTempFile;
use tripwire::adapter::inbound::cli::check;
use tripwire::error::{ConfigError, Error};
use tripwire::infrastructure::config::Config;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn loads_simulation_file() {
    let file = write_config(
        r#"
[engine]
settlement_concurrency = 2

[simulation]
tick_interval_ms = 100
instruments = [{ name = "BTC", price = "100" }]

[[simulation.positions]]
user = "alice"
instrument = "BTC"
amount = "1"
direction = "long"
take_profit = "110"
"#,
    );
    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.engine.settlement_concurrency, 2);
    assert_eq!(config.simulation.tick_interval_ms, 100);
    assert_eq!(config.simulation.positions.len(), 1);

    let summary = check::render(&config, false).unwrap();
    assert!(summary.contains("[BTC]"));
    assert!(summary.contains("1 seed positions"));
}

#[test]
fn missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::ReadFile(_))));
}

#[test]
fn invalid_file_is_rejected() {
    let file = write_config("[engine]\nsettlement_concurrency = 0\n");
    let err = Config::load(file.path()).unwrap_err();
    assert!(matches!(
        err,
        Error::Config(ConfigError::InvalidValue {
            field: "engine.settlement_concurrency",
            ..
        })
    ));
}

#[test]
fn bundled_sample_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tripwire.toml");
    let config = Config::load(path).unwrap();
    assert_eq!(config.simulation.instruments.len(), 2);
    assert_eq!(config.simulation.positions.len(), 3);
}
