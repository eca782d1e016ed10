use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use campaignd::bootstrap::Server;
use campaignd::config::Config;
use campaignd::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "campaignd")]
#[command(author, version, about = "SMS campaign dispatch engine")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    init_tracing(&TracingConfig::from(&config.telemetry))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting campaignd"
    );

    info!(
        address = %config.server.address,
        store = ?config.store.backend,
        gateway = ?config.gateway.mode,
        "configuration loaded"
    );

    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    Server::new(config).run().await
}
