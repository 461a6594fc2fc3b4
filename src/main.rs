//! WolfStore - Peer-to-Peer Replicated Content Store
//!
//! Main entry point for the WolfStore binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfstore::config::WolfStoreConfig;
use wolfstore::error::{Error, Result};
use wolfstore::network::{TcpTransport, TcpTransportOpts};
use wolfstore::replication::{FileServer, FileServerOpts};
use wolfstore::store::DiskStore;

/// WolfStore - Peer-to-Peer Replicated Content Store
#[derive(Parser)]
#[command(name = "wolfstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfstore.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfStore node and run until interrupted
    Start,

    /// Store content locally and replicate it to the bootstrap peers
    Put {
        /// Key to store the content under
        #[arg(short, long)]
        key: String,

        /// File to read content from (defaults to stdin)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Print content stored locally under a key
    Get {
        /// Key to read
        #[arg(short, long)]
        key: String,

        /// Write the content to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete content stored locally under a key
    Delete {
        /// Key to delete
        #[arg(short, long)]
        key: String,
    },

    /// Remove all locally stored content
    Clear,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfstore.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it is readable
    let logging = WolfStoreConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(logging.level);
    init_logging(&level, &logging.format);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Put { key, file } => run_put(cli.config, key, file).await,
        Commands::Get { key, output } => run_get(cli.config, key, output).await,
        Commands::Delete { key } => run_delete(cli.config, key).await,
        Commands::Clear => run_clear(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

/// Load configuration and build a server on a TCP transport
fn build_server(config_path: &Path) -> Result<(WolfStoreConfig, Arc<FileServer>)> {
    let config = match WolfStoreConfig::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    if let Err(e) = std::fs::create_dir_all(config.storage_root()) {
        tracing::error!("Failed to create storage root {:?}: {}", config.storage_root(), e);
        return Err(e.into());
    }

    let transport = Arc::new(TcpTransport::new(TcpTransportOpts::from_config(&config)));
    let server = Arc::new(FileServer::new(FileServerOpts::from_config(&config, transport)));
    Ok((config, server))
}

/// Run a node until Ctrl+C
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfStore node...");

    let (config, server) = build_server(&config_path)?;
    tracing::info!(
        "Node {} listening on {} with {} bootstrap peer(s)",
        config.node.id,
        config.node.bind_address,
        config.bootstrap_nodes().len()
    );

    let runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            signal_server.stop();
        }
    });

    let result = join_runner(runner).await;
    let stats = server.stats();
    tracing::info!(
        "Node stopped: {} message(s) applied, {} dropped",
        stats.messages_applied,
        stats.messages_dropped
    );
    result
}

/// Store one piece of content and replicate it, then shut down
async fn run_put(config_path: PathBuf, key: String, file: Option<PathBuf>) -> Result<()> {
    let (_config, server) = build_server(&config_path)?;

    let runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };
    server.wait_bootstrap().await;
    tracing::info!("Bootstrap finished with {} peer(s)", server.peers().len());

    let stored = match file {
        Some(path) => {
            let reader = tokio::fs::File::open(&path).await?;
            server.store_data(&key, reader).await
        }
        None => server.store_data(&key, tokio::io::stdin()).await,
    };

    server.stop();
    let stopped = join_runner(runner).await;

    match stored {
        Ok(()) => {
            let peers = server.peers().ids();
            println!("✓ Stored {} and replicated to {} peer(s)", key, peers.len());
            for peer in peers {
                println!("  {}", peer);
            }
            stopped
        }
        Err(e) => {
            eprintln!("✗ Put failed: {}", e);
            for failure in e.failed_peers() {
                eprintln!("  {}", failure);
            }
            Err(e)
        }
    }
}

/// Open the local store described by the configuration
fn open_store(config_path: &Path) -> Result<DiskStore> {
    let config = WolfStoreConfig::from_file(config_path)?;
    Ok(DiskStore::new(config.storage_root().clone(), config.store.path_transform))
}

/// Read content from the local store
async fn run_get(config_path: PathBuf, key: String, output: Option<PathBuf>) -> Result<()> {
    let store = open_store(&config_path)?;
    let data = store.read(&key).await?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, &data).await?;
            println!("✓ Wrote {} bytes to {}", data.len(), path.display());
        }
        None => {
            use tokio::io::AsyncWriteExt;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

/// Delete content from the local store
async fn run_delete(config_path: PathBuf, key: String) -> Result<()> {
    let store = open_store(&config_path)?;
    if !store.has(&key).await {
        eprintln!("✗ Key not found: {}", key);
        return Err(Error::KeyNotFound(key));
    }

    store.delete(&key).await?;
    println!("✓ Deleted {}", key);
    Ok(())
}

/// Remove everything under the storage root
async fn run_clear(config_path: PathBuf) -> Result<()> {
    let store = open_store(&config_path)?;
    store.clear().await?;
    println!("✓ Cleared {}", store.root().display());
    Ok(())
}

async fn join_runner(runner: tokio::task::JoinHandle<Result<()>>) -> Result<()> {
    match runner.await {
        Ok(result) => result,
        Err(e) => Err(Error::Network(format!("server task failed: {}", e))),
    }
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# WolfStore Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7700"
storage_root = "/var/lib/wolfstore/{node_id}"

[store]
# "flat" uses the key as the file path, "cas" hashes it into segments
path_transform = "cas"

[cluster]
bootstrap_nodes = []
# bootstrap_nodes = ["node-2.example.com:7700", "node-3.example.com:7700"]
dial_timeout_ms = 5000
# Keep retrying failed bootstrap dials for this long (0 = single attempt)
dial_retry_max_elapsed_ms = 0
persist_inbound = true

[transport]
max_frame_bytes = 67108864
inbound_queue = 1024

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure storage and bootstrap peers.");
    println!("Then start with: wolfstore start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfStoreConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Storage Root: {}", config.storage_root().display());
            println!("  Path Transform: {:?}", config.store.path_transform);
            println!("  Bootstrap Peers: {}", config.bootstrap_nodes().len());
            println!("  Persist Inbound: {}", config.cluster.persist_inbound);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
