mod config;
mod dispatch;
mod fetcher;
mod opml;
mod store;
mod sync;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::fetcher::Fetcher;
use crate::store::Store;

#[derive(Parser)]
#[command(name = "rss-actions", about = "Run commands when feeds update")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "rss-actions.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll feeds and dispatch actions on updates (the default)
    Run,
    /// Deregister a list and delete every feed derived from it
    DeleteList { url: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rss_actions=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration, creating it with defaults on first run
    Config::touch(&cli.config)?;
    let config = Config::load(&cli.config)?;
    info!("Loaded {} feeds from configuration", config.feeds.len());

    // Open the store
    let database_url = format!("sqlite:{}?mode=rwc", config.db);
    let store = Store::new(&database_url).await?;
    store.initialize().await?;

    match cli.command {
        Some(Commands::DeleteList { url }) => {
            sync::delete_list(&store, &url).await?;
            info!("Deleted list '{}'", url);
            Ok(())
        }
        Some(Commands::Run) | None => run(store, config).await,
    }
}

async fn run(store: Store, config: Config) -> anyhow::Result<()> {
    let fetcher = Fetcher::new();
    let dispatcher = Dispatcher::new(&config.feeds);

    sync::register_feeds(&store, &config.feeds).await?;

    let interval = Duration::from_secs(config.poll_interval * 60);
    loop {
        let cycle_start = Instant::now();

        if let Err(e) = run_cycle(&store, &fetcher, &dispatcher, &config.feeds).await {
            error!("Cycle failed: {}", e);
        }

        // Fixed interval from cycle start; an overrunning cycle rolls
        // straight into the next one without stacking a backlog.
        let elapsed = cycle_start.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
    }
}

/// One full pass: reconcile list membership, update every tracked feed,
/// dispatch actions for the updated ones.
async fn run_cycle(
    store: &Store,
    fetcher: &Fetcher,
    dispatcher: &Dispatcher,
    actions: &[config::FeedAction],
) -> anyhow::Result<()> {
    sync::reconcile_lists(store, fetcher.client(), actions).await?;
    let updates = fetcher.update_feeds(store).await?;
    dispatcher.dispatch_updates(store, &updates).await?;
    Ok(())
}
