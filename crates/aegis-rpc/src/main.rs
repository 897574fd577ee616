//! Aegis RPC Server - JSON-RPC front end for the resilience layer.
//!
//! This binary wraps the aegis-core client in a JSON-RPC 2.0 server so host
//! processes can drive text analyses and configuration without linking the
//! library directly.

mod handler;
mod server;

use aegis_core::{
    AreaKind, ClientConfig, CredentialProvider, Dispatcher, GatewayConfig, HttpTransport,
    LocalLockManager, NamedLock, QuotaManager, ResilientClient, SqliteStore, StaticCredentials,
    StorageArea, StorageCredentials, StorageKeys, TokenGate, TransportConfig,
};
use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "aegis-rpc")]
#[command(about = "JSON-RPC server for the Aegis gateway client")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Data directory for persistent state (defaults to the platform data dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Gateway base URL used until one is saved through the configuration API
    #[arg(long)]
    gateway_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Aegis RPC Server");

    // Determine the data directory
    let data_dir = match args.data_dir {
        Some(path) => path,
        None => dirs::data_dir()
            .map(|base| base.join("aegis"))
            .unwrap_or_else(|| PathBuf::from("aegis-data")),
    };

    info!("Data directory: {}", data_dir.display());

    // Open storage and carve out the two areas
    let store = SqliteStore::new(data_dir.join("storage.db"))?;
    let local: Arc<dyn StorageArea> = Arc::new(store.area(AreaKind::Local));
    let sync: Arc<dyn StorageArea> = Arc::new(store.area(AreaKind::Sync));
    let quota = Arc::new(QuotaManager::new(Arc::clone(&local), Arc::clone(&sync)));

    // A key from the environment pins the credential for this process;
    // otherwise the persisted central configuration is the source of truth.
    let provider: Arc<dyn CredentialProvider> = match std::env::var("AEGIS_API_KEY") {
        Ok(key) if !key.trim().is_empty() => Arc::new(StaticCredentials::new(key)),
        _ => Arc::new(StorageCredentials::new(Arc::clone(&sync))),
    };
    let locks: Arc<dyn NamedLock> = Arc::new(LocalLockManager::new());
    let tokens = TokenGate::new(provider, locks);

    let base_url = resolve_gateway_url(&sync, args.gateway_url.as_deref()).await;
    info!("Gateway base URL: {}", base_url);

    let transport = Arc::new(HttpTransport::new(
        TransportConfig::default().with_base_url(base_url.clone()),
    )?);

    // Assemble the client and restore persisted guard and config state
    let client = ResilientClient::new(transport, quota, tokens)
        .with_config(ClientConfig::default().with_base_url(base_url));
    client.load_state().await?;
    client.start_sweeper();

    let client = Arc::new(client);
    let dispatcher = Dispatcher::new(Arc::clone(&client));

    // Start the server
    let addr = server::start_server(dispatcher, &args.host, args.port).await?;

    // Print port for the host process to read (intentional stdout for IPC)
    println!("RPC_PORT={}", addr.port());

    info!("RPC server running on {}", addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    client.shutdown();

    Ok(())
}

/// Pick the gateway base URL: a stored configuration wins over the CLI flag,
/// which wins over the built-in default.
async fn resolve_gateway_url(sync: &Arc<dyn StorageArea>, flag: Option<&str>) -> String {
    let stored = match sync.get(&[StorageKeys::CENTRAL_CONFIG.to_string()]).await {
        Ok(mut entries) => entries
            .remove(StorageKeys::CENTRAL_CONFIG)
            .and_then(|record| {
                record
                    .get("gateway_url")
                    .and_then(Value::as_str)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
            }),
        Err(_) => None,
    };

    stored
        .or_else(|| flag.map(str::to_string))
        .unwrap_or_else(|| GatewayConfig::DEFAULT_BASE_URL.to_string())
}
