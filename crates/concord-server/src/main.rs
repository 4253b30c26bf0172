//! Main entry point for a Concord cluster node.

use clap::Parser;
use tracing::{error, info};

use concord_server::cli::Cli;
use concord_server::startup::{self, LoggingConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging_config = LoggingConfig::from_env(cli.log_dir.as_deref());
    let _logging_guard = startup::init_logging(&logging_config)?;

    concord_server::metrics::init_metrics();

    let configuration = cli.configuration()?;
    let backends = startup::connect_backends(&configuration).await?;

    let shutdown = startup::wait_for_shutdown_signal();
    if let Err(err) = startup::run_node(&configuration, backends, shutdown).await {
        error!("Concord node stopped with an error: {:#}", err);
        return Err(err);
    }

    info!("Concord node exited");
    Ok(())
}
