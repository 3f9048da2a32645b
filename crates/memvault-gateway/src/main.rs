// crates/memvault-gateway/src/main.rs
// memvault-gateway - encrypted memory API in front of the vault daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memvault_gateway::api::{self, AppState};
use memvault_gateway::auth::{self, Caller};
use memvault_gateway::config::GatewayConfig;
use memvault_gateway::db::DatabasePool;
use memvault_gateway::{MemoryService, VaultClient, embeddings, http};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "memvault-gateway")]
#[command(about = "Encrypted memory store with vector search, keyed by memvault-vault")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.memvault/gateway.toml)
    #[arg(long, global = true, env = "MEMVAULT_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API (default)
    Serve {
        /// Listen address, e.g. 127.0.0.1:50051
        #[arg(long)]
        bind: Option<String>,
    },

    /// Provision a new data key version for a scope
    RotateKey {
        #[arg(long)]
        scope: String,

        /// Re-encrypt the scope's records under the new key
        #[arg(long)]
        reencrypt: bool,
    },

    /// Re-encrypt a scope's records still sealed under retired keys
    Reencrypt {
        #[arg(long)]
        scope: String,
    },

    /// Validate configuration and ping the vault
    Check,
}

fn log_level(command: &Option<Commands>, verbose: u8) -> Level {
    let base = match command {
        None | Some(Commands::Serve { .. }) => 1,
        Some(_) => 0,
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

    let mut config = GatewayConfig::load(cli.config.as_deref());
    config.apply_env();

    match cli.command {
        None => serve(config).await,
        Some(Commands::Serve { bind }) => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            serve(config).await
        }
        Some(Commands::RotateKey { scope, reencrypt }) => {
            let service = build_service(&config, http::create_shared_client()).await?;
            let resp = service.rotate(&Caller(None), &scope, reencrypt).await?;
            println!(
                "{} active (retired: {}, re-encrypted: {})",
                resp.key_id,
                resp.retired_key_id.as_deref().unwrap_or("none"),
                resp.reencrypted
            );
            Ok(())
        }
        Some(Commands::Reencrypt { scope }) => {
            let service = build_service(&config, http::create_shared_client()).await?;
            let n = service.reencrypt(&Caller(None), &scope).await?;
            println!("re-encrypted {n} records in scope {scope}");
            Ok(())
        }
        Some(Commands::Check) => check(config).await,
    }
}

async fn build_service(config: &GatewayConfig, http: reqwest::Client) -> Result<Arc<MemoryService>> {
    config
        .validate()
        .into_result()
        .map_err(|e| anyhow::anyhow!("invalid gateway config: {e}"))?;

    let pool = DatabasePool::open(&config.database.path, config.embeddings.dimensions)
        .await
        .with_context(|| format!("failed to open {}", config.database.path.display()))?;
    let vault = VaultClient::new(config.vault.endpoint(), config.vault.client_config());
    let embedder = embeddings::from_config(&config.embeddings, http)?;

    Ok(Arc::new(MemoryService::new(
        Arc::new(pool),
        Arc::new(vault),
        embedder,
        config.limits.clone(),
    )))
}

async fn serve(config: GatewayConfig) -> Result<()> {
    let http = http::create_shared_client();
    let service = build_service(&config, http.clone()).await?;

    let validator = auth::from_config(&config.auth, http);
    if validator.is_none() {
        warn!("Authentication is DISABLED: every caller is treated as admin");
    }

    if !service.health().await.vault {
        warn!(
            endpoint = %config.vault.endpoint().display(),
            "Vault daemon not reachable yet; requests needing keys will fail until it is"
        );
    }

    let state = Arc::new(AppState {
        service,
        validator,
        default_timeout: Duration::from_secs(config.server.request_timeout_secs),
        max_timeout: Duration::from_secs(config.server.max_request_timeout_secs),
    });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.server.bind,
        db = %config.database.path.display(),
        embeddings = ?config.embeddings.provider,
        "Starting memvault-gateway"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Gateway stopped");
    Ok(())
}

async fn check(config: GatewayConfig) -> Result<()> {
    let validation = config.validate();
    println!("{}", validation.report());
    if !validation.is_valid() {
        anyhow::bail!("configuration has errors");
    }

    let vault = VaultClient::new(config.vault.endpoint(), config.vault.client_config());
    vault
        .ping()
        .await
        .with_context(|| format!("vault at {} did not answer", config.vault.endpoint().display()))?;
    println!("vault OK at {}", config.vault.endpoint().display());
    Ok(())
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
