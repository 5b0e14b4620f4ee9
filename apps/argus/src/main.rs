use argus_core::app::{self, cli::Cli, error::CliError};
use argus_core::telemetry::logging;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())
        .map_err(|err| CliError::Logging(err.to_string()))?;

    if let Err(err) = app::run(cli).await {
        tracing::error!(target: "argus::cli", error = %err, "argus exited with an error");
        return Err(err.into());
    }
    Ok(())
}
