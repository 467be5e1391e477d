//! Chat Relay
//!
//! Multi-client chat server with file sharing, plus client commands.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay::config::Config;
use relay::{ChatClient, ChatServer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Default server address for client commands.
const DEFAULT_SERVER: &str = "127.0.0.1:12345";

/// Chat Relay - multi-client chat with file upload and download.
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the chat server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(long, short)]
        port: Option<u16>,

        /// Directory for uploaded files (overrides config)
        #[arg(long, value_name = "DIR")]
        store_dir: Option<PathBuf>,

        /// Address to bind (overrides config)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Send one chat message
    Say {
        /// Server address
        #[arg(long, short, default_value = DEFAULT_SERVER)]
        server: String,

        /// Message text
        message: String,
    },

    /// Upload a file
    Upload {
        /// Server address
        #[arg(long, short, default_value = DEFAULT_SERVER)]
        server: String,

        /// Local file to upload
        path: PathBuf,

        /// Name to store the file under (defaults to the file name)
        #[arg(long, short)]
        name: Option<String>,
    },

    /// List files stored on the server
    List {
        /// Server address
        #[arg(long, short, default_value = DEFAULT_SERVER)]
        server: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Download a file
    Download {
        /// Server address
        #[arg(long, short, default_value = DEFAULT_SERVER)]
        server: String,

        /// Name of the stored file
        name: String,

        /// Where to write the file (defaults to the name in the current directory)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing before config so override messages are emitted
    let log_filter = init_tracing(cli.verbose);

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    if let Some(handle) = log_filter {
        let directive = filter_directive(cli.verbose, &config.server.log_level);
        handle.reload(EnvFilter::new(directive))?;
    }

    match cli.command {
        Commands::Serve {
            port,
            store_dir,
            bind,
        } => {
            apply_serve_overrides(&mut config, port, store_dir, bind);
            config.validate()?;
            run_server(&config).await?;
        }
        Commands::Say { server, message } => {
            let mut client = ChatClient::connect(&server).await?;
            client.send_text(&message).await?;
            client.close().await?;
        }
        Commands::Upload { server, path, name } => {
            let name = match name {
                Some(name) => name,
                None => path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .with_context(|| format!("Cannot derive a file name from {}", path.display()))?,
            };
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;

            let mut client = ChatClient::connect(&server).await?;
            client.upload(&name, &bytes).await?;
            client.close().await?;
            println!("Uploaded {} ({} bytes)", name, bytes.len());
        }
        Commands::List { server, json } => {
            let mut client = ChatClient::connect(&server).await?;
            let names = client.list_files().await?;
            client.close().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else if names.is_empty() {
                println!("No files stored.");
            } else {
                for name in names {
                    println!("{}", name);
                }
            }
        }
        Commands::Download {
            server,
            name,
            output,
        } => {
            let mut client = ChatClient::connect(&server).await?;
            let bytes = client.download(&name).await?;
            client.close().await?;

            let output = output.unwrap_or_else(|| PathBuf::from(&name));
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Saved {} ({} bytes)", output.display(), bytes.len());
        }
    }

    Ok(())
}

/// Install the global subscriber.
///
/// Returns a reload handle unless `RUST_LOG` pins the filter, so the
/// configured log level can be applied once the config is loaded.
fn init_tracing(verbose: bool) -> Option<reload::Handle<EnvFilter, Registry>> {
    let pinned = EnvFilter::try_from_default_env().ok();
    let reloadable = pinned.is_none();
    let filter = pinned.unwrap_or_else(|| EnvFilter::new(filter_directive(verbose, "info")));

    let (layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    reloadable.then_some(handle)
}

/// Filter directive for the given verbosity and configured level.
fn filter_directive(verbose: bool, log_level: &str) -> String {
    if verbose {
        "debug".to_string()
    } else {
        log_level.to_lowercase()
    }
}

/// Apply `serve` flags on top of the loaded configuration.
fn apply_serve_overrides(
    config: &mut Config,
    port: Option<u16>,
    store_dir: Option<PathBuf>,
    bind: Option<String>,
) {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(dir) = store_dir {
        config.store.root = dir;
    }
    if let Some(bind) = bind {
        config.server.bind_address = bind;
    }
}

/// Run the server until a shutdown signal arrives.
async fn run_server(config: &Config) -> anyhow::Result<()> {
    let server = ChatServer::bind(config).await?;
    let token = server.shutdown_token();

    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => token.cancel(),
            Err(e) => tracing::error!("Signal handling unavailable: {:#}", e),
        }
    });

    server.run().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}
