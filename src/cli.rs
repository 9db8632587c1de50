//! CLI entry points. Trimmed to what the bridge actually needs to
//! operate: `serve` runs the webhook/media-stream listener plus the
//! Driver stdio RPC loop, `config` inspects or validates the on-disk
//! configuration. Grounded on the teacher's `cli.rs` clap layout and
//! `server/mod.rs`'s HTTPS/HTTP bind split.

use crate::config::Config;
use crate::manager::CallManager;
use crate::tools::default_tool_config;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "call-bridge")]
#[command(about = "Local bridge that lets an AI coding assistant place and hold a live phone call", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the webhook/media-stream HTTP listener and the Driver
    /// stdio RPC loop. Default when no subcommand is given.
    Serve,
    /// Print or validate the resolved configuration.
    Config {
        /// Validate only; enumerate every missing required field and
        /// exit non-zero instead of printing the resolved config.
        #[arg(long)]
        check: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Config { check } => config_cmd(check).await,
    }
}

async fn config_cmd(check: bool) -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    if check {
        match config.validate() {
            Ok(()) => println!("configuration is valid"),
            Err(e) => {
                eprintln!("configuration is incomplete: {e}");
                std::process::exit(1);
            }
        }
        return Ok(());
    }
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

async fn serve() -> Result<()> {
    let config = Arc::new(Config::load().context("failed to load configuration")?);
    let tools = Arc::new(default_tool_config());
    let manager = CallManager::new(config.clone(), tools)?;

    tracing::info!(
        backend = ?config.voice_backend,
        carrier = ?config.carrier.kind,
        "call bridge starting"
    );

    let http_manager = manager.clone();
    let http_config = config.clone();
    let http_task = tokio::spawn(async move { run_http_listener(http_config, http_manager).await });

    let rpc_manager = manager.clone();
    let rpc_task = tokio::spawn(async move { crate::rpc::run(rpc_manager).await });

    // Process shutdown cancels all sessions cooperatively with a grace
    // period (spec.md §5) whether the Driver closed stdin (rpc_task
    // finishes) or the operator sent a termination signal.
    tokio::select! {
        result = rpc_task => {
            http_task.abort();
            manager.shutdown().await;
            let rpc_result = result.map_err(anyhow::Error::from)?;
            return rpc_result.map_err(anyhow::Error::from);
        }
        _ = wait_for_termination_signal() => {
            tracing::info!("termination signal received, shutting down");
        }
    }

    http_task.abort();
    manager.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_http_listener(config: Arc<Config>, manager: Arc<CallManager>) -> Result<()> {
    let app = crate::manager::http::router(manager);
    let addr: std::net::SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    if config.server.https {
        if let (Some(cert_path), Some(key_path)) = (&config.server.tls_cert, &config.server.tls_key) {
            let cert_data = tokio::fs::read(cert_path).await.context("failed to read TLS certificate")?;
            let key_data = tokio::fs::read(key_path).await.context("failed to read TLS key")?;
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem(cert_data, key_data).await?;
            tracing::info!(%addr, "listening (https)");
            axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
            return Ok(());
        }
        tracing::warn!("server.https is set but tls_cert/tls_key are missing, falling back to http");
    }

    tracing::info!(%addr, "listening (http)");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
