use anyhow::Result;
use clap::Parser;
use tracing::error;

use soqtt::{bridge, cli::Cli};

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.into_config()?;
    if let Err(err) = bridge::run(config).await {
        error!("{err:#}");
        return Err(err);
    }

    Ok(())
}
