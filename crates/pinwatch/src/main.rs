use anyhow::{Context, Result};
use clap::Parser;
use pinwatch::api::{self, AppState};
use pinwatch::{
    register_listen_watcher, register_pin_watcher, ChainRpc, ContractRegistry, EventHandlers,
    HttpChainClient, KuboClient, StorageNetwork, Store, WatcherConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file; flags below override its values
    #[arg(long, env = "PINWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Chain node HTTP RPC URL
    #[arg(long, env = "PINWATCH_HTTP_URL")]
    http_url: Option<String>,

    /// IPFS (Kubo) HTTP API URL
    #[arg(long, env = "PINWATCH_IPFS_API_URL")]
    ipfs_api_url: Option<String>,

    /// Snapshot file for the durable collections (in-memory when omitted)
    #[arg(long, env = "PINWATCH_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "PINWATCH_API_ADDRESS")]
    api_address: Option<SocketAddr>,

    /// Listener contract to poll; repeatable
    #[arg(long = "listener-contract")]
    listener_contracts: Vec<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "pinwatch=info")]
    log_level: String,
}

impl Cli {
    async fn config(&self) -> Result<WatcherConfig> {
        let mut config = match &self.config {
            Some(path) => WatcherConfig::load_from_file(path).await?,
            None => WatcherConfig::default(),
        };
        if let Some(url) = &self.http_url {
            config.http_url = url.clone();
        }
        if let Some(url) = &self.ipfs_api_url {
            config.ipfs_api_url = url.clone();
        }
        if let Some(path) = &self.store_path {
            config.store_path = Some(path.clone());
        }
        if let Some(address) = self.api_address {
            config.api_address = address;
        }
        config
            .listener_contracts
            .extend(self.listener_contracts.iter().cloned());
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli.config().await?;
    tracing::info!(
        http_url = %config.http_url,
        ipfs_api_url = %config.ipfs_api_url,
        listen_interval_ms = config.listen_interval_ms,
        pin_interval_ms = config.pin_interval_ms,
        "config loaded"
    );

    let store = match &config.store_path {
        Some(path) => Store::open(path)
            .await
            .with_context(|| format!("open store {}", path.display()))?,
        None => {
            tracing::warn!("no store path configured, state is kept in memory only");
            Store::in_memory()
        }
    };
    let store = Arc::new(store);
    for address in &config.listener_contracts {
        if store.add_listener_contract(address).await? {
            tracing::info!(contract = %address, "listener contract added");
        }
    }

    let chain: Arc<dyn ChainRpc> = Arc::new(HttpChainClient::from_config(&config)?);
    let storage: Arc<dyn StorageNetwork> = Arc::new(KuboClient::from_config(&config)?);
    let registry = Arc::new(ContractRegistry::new());
    let handlers = EventHandlers::new(Arc::clone(&store), storage, Arc::clone(&registry));

    let listen = register_listen_watcher(
        Arc::clone(&chain),
        handlers.clone(),
        config.listen_interval(),
    )
    .await?;
    let pin = register_pin_watcher(chain, handlers, config.pin_interval()).await?;

    let served = api::serve(config.api_address, AppState { registry }, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(reason = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown requested");
    })
    .await;

    listen.stop().await;
    pin.stop().await;
    served
}
