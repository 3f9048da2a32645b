// crates/memvault-vault/src/main.rs
// memvault-vault - key vault daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memvault_vault::config::VaultConfig;
use memvault_vault::ipc::{self, VaultState};
use memvault_vault::keystore::{self, BackendKind};
use memvault_vault::protocol::{VaultRequest, VaultResponse};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "memvault-vault")]
#[command(about = "Key vault daemon: OS secret stores behind a local socket")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.memvault/vault.toml)
    #[arg(long, global = true, env = "MEMVAULT_VAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Serve {
        /// Socket path (named pipe name on Windows)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Key store back-end: native or memory
        #[arg(long)]
        backend: Option<BackendKind>,
    },

    /// Check that a daemon answers on the socket
    Ping {
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

fn log_level(command: &Option<Commands>, verbose: u8) -> Level {
    let base = match command {
        None | Some(Commands::Serve { .. }) => 1,
        Some(Commands::Ping { .. }) => 0,
    };
    match base + verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Some(home) = dirs::home_dir() {
        let _ = dotenvy::from_path(home.join(".memvault/.env"));
    }
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(&cli.command, cli.verbose))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = VaultConfig::load(cli.config.as_deref());

    match cli.command {
        None => serve(config).await,
        Some(Commands::Serve { socket, backend }) => {
            if socket.is_some() {
                config.socket = socket;
            }
            if let Some(backend) = backend {
                config.backend = backend;
            }
            serve(config).await
        }
        Some(Commands::Ping { socket }) => {
            let endpoint = socket
                .or(config.socket)
                .unwrap_or_else(ipc::default_endpoint);
            ping(endpoint).await
        }
    }
}

async fn serve(config: VaultConfig) -> Result<()> {
    config
        .validate()
        .into_result()
        .map_err(|e| anyhow::anyhow!("invalid vault config: {e}"))?;

    let store = keystore::open(config.backend, &config.service_name)?;
    let state = VaultState::new(store, Duration::from_secs(config.request_timeout_secs));
    let endpoint = config.socket.clone().unwrap_or_else(ipc::default_endpoint);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %endpoint.display(),
        "Starting memvault-vault"
    );

    ipc::run_listener(state, &endpoint, config.max_connections, shutdown_signal()).await
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn ping(endpoint: PathBuf) -> Result<()> {
    let resp = tokio::time::timeout(Duration::from_secs(2), async {
        #[cfg(unix)]
        let stream = tokio::net::UnixStream::connect(&endpoint).await?;
        #[cfg(windows)]
        let stream = tokio::net::windows::named_pipe::ClientOptions::new().open(&endpoint)?;
        Ok::<_, anyhow::Error>(ping_over(stream).await?)
    })
    .await
    .context("vault did not answer within 2s")?
    .with_context(|| format!("failed to reach vault at {}", endpoint.display()))?;

    match resp {
        VaultResponse::Pong => {
            println!("pong from {}", endpoint.display());
            Ok(())
        }
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}

async fn ping_over<S>(stream: S) -> Result<VaultResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut line = serde_json::to_vec(&VaultRequest::Ping)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;

    let mut buf = String::new();
    BufReader::new(reader).read_line(&mut buf).await?;
    Ok(serde_json::from_str(&buf)?)
}
