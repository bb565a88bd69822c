use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tripwire::adapter::inbound::cli::command::{Cli, Commands};
use tripwire::adapter::inbound::cli::{check, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let cancel = CancellationToken::new();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                match signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Shutdown signal received");
                        shutdown.cancel();
                    }
                    Err(e) => warn!(error = %e, "Ctrl-C handler unavailable"),
                }
            });
            run::execute(&args, cancel).await?;
        }
        Commands::Check(args) => check::execute(&args)?,
    }
    Ok(())
}
