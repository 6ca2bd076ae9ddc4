#![forbid(unsafe_code)]

//! `vault-intercom` — background intercom service binary.
//!
//! Loads configuration, wires the confirmation gate, broker, and operation
//! confirmer behind the request dispatcher, and serves front-ends over a
//! local socket until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use vault_intercom::config::GlobalConfig;
use vault_intercom::confirmation::ConfirmationBroker;
use vault_intercom::dispatch::{Dispatcher, NoKeystore};
use vault_intercom::gate::ConfirmationGate;
use vault_intercom::intercom::IntercomServer;
use vault_intercom::operation::rpc::RpcNetwork;
use vault_intercom::operation::{ConfirmStrategy, ConfirmerOptions, OperationConfirmer};
use vault_intercom::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "vault-intercom", about = "Wallet background intercom service", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured local socket name.
    #[arg(long)]
    ipc_name: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("vault-intercom bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::from_toml_str("")?,
    };
    if let Some(name) = args.ipc_name {
        if name.trim().is_empty() {
            return Err(AppError::Config("--ipc-name must not be empty".into()));
        }
        config.ipc_name = name;
    }
    // The binary ships no real-time feed.
    if config.operations.strategy != ConfirmStrategy::Poll {
        return Err(AppError::Config(format!(
            "operations.strategy {:?} needs an operation feed; use \"poll\"",
            config.operations.strategy
        )));
    }
    info!(ipc_name = %config.ipc_name, "configuration loaded");

    // ── Build services ──────────────────────────────────
    let ct = CancellationToken::new();
    let server = IntercomServer::new(ct.clone());
    let gate = Arc::new(ConfirmationGate::start(ct.child_token()));
    let broker = Arc::new(ConfirmationBroker::new(
        server.registry(),
        config.confirmation.timeout(),
    ));
    let network = Arc::new(RpcNetwork::from_config(&config.operations)?);
    let confirmer = Arc::new(OperationConfirmer::new(
        network,
        ConfirmerOptions::from(&config.operations),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        server.registry(),
        Arc::clone(&gate),
        Arc::clone(&broker),
        Arc::new(NoKeystore),
        confirmer,
    ));

    server.subscribe_to_requests(dispatcher).await;

    // ── Start listener ──────────────────────────────────
    let listener_handle = server.spawn_local_listener(&config.ipc_name)?;
    info!("vault-intercom ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    broker.expire_pending().await;
    gate.shutdown().await;
    ct.cancel();
    server.shutdown().await;

    if let Err(err) = listener_handle.await {
        error!(%err, "intercom listener task failed");
    }
    info!("vault-intercom shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
