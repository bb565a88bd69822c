//! Handler for the `run` command.

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::command::RunArgs;
use crate::error::Result;
use crate::infrastructure::bootstrap;
use crate::infrastructure::config::Config;

/// Load the configuration, install logging and run until `cancel` fires.
pub async fn execute(args: &RunArgs, cancel: CancellationToken) -> Result<()> {
    let mut config = Config::load(&args.config)?;
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if args.json_logs {
        config.logging.format = "json".into();
    }
    config.init_logging();
    info!(config = %args.config.display(), "tripwire starting");

    bootstrap::run(config, cancel).await?;

    info!("tripwire stopped");
    Ok(())
}
