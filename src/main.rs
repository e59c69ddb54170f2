// src/main.rs — streamcap entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;

use streamcap::collector::Collector;
use streamcap::infra::config::{Config, HelixCredentials, IrcCredentials};
use streamcap::infra::logger;
use streamcap::protocol::IrcClient;
use streamcap::status::HelixClient;
use streamcap::store::SessionStore;

/// Live-session capture pipeline: polls Helix for live status and records
/// per-session chat + stream snapshots.
#[derive(Parser)]
#[command(name = "streamcap", version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: PathBuf,

    /// Default log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logger::init_logging(&cli.log_level);

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load_from(&cli.config)?;
    if config.streams.channels.is_empty() {
        anyhow::bail!("no channels configured under [streams]");
    }

    // Startup failures are fatal before the loop starts: missing credentials
    // or an unwritable data root must never surface mid-run.
    let helix_creds = HelixCredentials::from_env()?;
    let irc_creds = IrcCredentials::from_env()?;

    let store = SessionStore::new(config.data_root.clone());
    store.ensure_root()?;

    tracing::info!(
        data_root = %config.data_root.display(),
        channels = config.streams.channels.len(),
        poll_seconds = config.helix.poll_seconds,
        "streamcap starting"
    );

    let helix = Arc::new(HelixClient::new(helix_creds, config.helix.batch_size));

    let (events_tx, events_rx) = mpsc::channel(1024);
    let irc = Arc::new(IrcClient::connect(&config.irc, &irc_creds, events_tx).await?);
    tracing::info!("connected to chat relay");

    Collector::new(config, helix, irc, store, events_rx)
        .run()
        .await
}
