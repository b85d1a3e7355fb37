use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod acp;
mod agent;
mod config;
mod daemon;
mod skills;

use acp::{AcpClient, ClientCapabilities, ClientHooks, TransportError};
use agent::ChatRuntime;
use config::{ConfigError, ServerConfig, DEFAULT_BIND};
use daemon::Daemon;

/// agentd: local agent server speaking the Agent Client Protocol.
#[derive(Parser, Debug)]
#[command(name = "agentd", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the protocol over TCP
    Serve {
        /// Address to listen on; overrides the config file
        #[arg(long, env = "AGENTD_BIND")]
        bind: Option<String>,

        /// Path to the server config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Serve a single connection over stdin/stdout
    Stdio {
        /// Path to the server config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the status of a running server
    Status {
        #[arg(long, default_value = DEFAULT_BIND)]
        addr: String,
    },

    /// Ask a running server to shut down
    Stop {
        #[arg(long, default_value = DEFAULT_BIND)]
        addr: String,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    // stdout carries protocol frames in stdio mode, so logs always go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli.command).await {
        eprintln!("agentd: {err}");
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Serve { bind, config } => {
            let mut config = load_config(config)?;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            let listener = tokio::net::TcpListener::bind(&config.bind)
                .await
                .map_err(|source| CliError::Bind {
                    addr: config.bind.clone(),
                    source,
                })?;

            let daemon = Arc::new(Daemon::new(config, Arc::new(ChatRuntime::new()))?);
            watch_ctrl_c(&daemon);
            daemon.serve_tcp(listener).await?;
        }
        Commands::Stdio { config } => {
            let config = load_config(config)?;
            let daemon = Arc::new(Daemon::new(config, Arc::new(ChatRuntime::new()))?);
            watch_ctrl_c(&daemon);
            daemon.serve_stdio().await;
        }
        Commands::Status { addr } => {
            let client = connect(&addr).await?;
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            client.close().await;
        }
        Commands::Stop { addr } => {
            let client = connect(&addr).await?;
            let response = client.shutdown().await?;
            println!("{}", response.message);
            client.close().await;
        }
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<ServerConfig, ConfigError> {
    let path = match path {
        Some(path) => path,
        None => ServerConfig::default_path()?,
    };
    let mut config = ServerConfig::load_or_create(&path)?;
    config.apply_env();
    tracing::debug!(path = %path.display(), ?config, "configuration loaded");
    Ok(config)
}

fn watch_ctrl_c(daemon: &Daemon) {
    let shutdown = daemon.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
            shutdown.cancel();
        }
    });
}

async fn connect(addr: &str) -> Result<AcpClient, CliError> {
    let client = AcpClient::connect_tcp(addr, ClientHooks::default()).await?;
    client.initialize(ClientCapabilities::default()).await?;
    Ok(client)
}
