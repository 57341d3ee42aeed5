use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use rates_pubsub::{AsyncClient, Config, MqttTransport, StatusStore, SubscriptionManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "rates-pubsub")]
#[command(about = "Grants rates topic subscriptions to trader sessions")]
struct Args {
    /// Config file, created with defaults if missing
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let store = StatusStore::new();
    setup(&store)?;

    let path = args.config.unwrap_or_else(Config::default_path);
    let config = Config::ensure_default(&path)
        .await
        .map_err(|e| eyre!("Failed to load config: {}", e))?;

    let client = AsyncClient::with_store(
        Arc::new(MqttTransport::new()),
        config.client_settings(),
        store,
    );
    client
        .connect(
            &config.broker.url,
            &config.broker.vpn_name,
            &config.broker.username,
            &config.broker.password,
        )
        .await?;

    let shutdown = CancellationToken::new();
    let service = SubscriptionManager::new(client.clone(), config.subscription_manager.clone())
        .start(shutdown.clone())
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("exiting...");
    shutdown.cancel();

    service
        .await
        .map_err(|e| eyre!("Subscription manager task failed: {}", e))?;
    client.disconnect().await?;
    Ok(())
}

fn setup(store: &StatusStore) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env(store);
    Ok(())
}

fn setup_logging_env(store: &StatusStore) {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .finish()
        .with(store.layer())
        .init();
}
