//! Gateway entry point: configuration, wiring, transports, signals.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use scangate::config::{Config, Transport};
use scangate::gateway::Gateway;
use scangate::health::HealthMonitor;
use scangate::server::http::{self, AppState};
use scangate::server::stdio;

#[derive(Debug, Parser)]
#[command(
    name = "scangate",
    version,
    about = "Controlled-execution gateway for security scanners"
)]
struct Cli {
    /// Transport to run (stdio or http); overrides MCP_SERVER_TRANSPORT.
    #[arg(long)]
    transport: Option<String>,

    /// Bind host for the http transport; overrides MCP_SERVER_HOST.
    #[arg(long)]
    host: Option<String>,

    /// Bind port for the http transport; overrides MCP_SERVER_PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before tracing so LOG_LEVEL/LOG_FORMAT from the file apply.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(ref transport) = cli.transport {
        config.server.transport = transport
            .parse::<Transport>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let prometheus = if config.metrics.prometheus_enabled {
        scangate::metrics::install_prometheus()
    } else {
        None
    };

    let gateway = Gateway::new(&config);
    let tool_commands: Vec<String> = gateway
        .registry()
        .enabled_names()
        .iter()
        .map(|n| n.to_string())
        .collect();
    let health = HealthMonitor::with_builtin_checks(config.health.clone(), tool_commands);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    spawn_signal_listener(shutdown_tx.clone());

    let health_loop = Arc::clone(&health).spawn_loop(shutdown_rx.clone());
    let sweeper = gateway.metrics().spawn_sweeper(shutdown_rx.clone());

    match config.server.transport {
        Transport::Http => {
            let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
                .parse()
                .context("parsing bind address")?;
            let state = Arc::new(AppState {
                gateway: Arc::clone(&gateway),
                health: Arc::clone(&health),
                prometheus,
            });
            let (_bound, server) = http::start_server(addr, state, shutdown_rx.clone()).await?;

            let mut shutdown = shutdown_rx.clone();
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            let _ = server.await;
        }
        Transport::Stdio => {
            stdio::run(Arc::clone(&gateway), shutdown_rx.clone()).await?;
            // stdin EOF also means shutdown for the background loops
            let _ = shutdown_tx.send(true);
        }
    }

    tracing::info!(
        grace_sec = config.server.shutdown_grace.as_secs_f64(),
        "draining in-flight executions"
    );
    gateway.drain(config.server.shutdown_grace).await;

    health_loop.abort();
    sweeper.abort();
    tracing::info!("gateway stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    // Logs always go to stderr: stdout belongs to the stdio transport.
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Translate OS signals into the shutdown watch channel. Handlers never
/// touch gateway state directly.
fn spawn_signal_listener(tx: tokio::sync::watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(term) => term,
                Err(e) => {
                    tracing::error!("failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received, shutting down"),
                _ = term.recv() => tracing::info!("SIGTERM received, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Ctrl+C received, shutting down");
        }
        let _ = tx.send(true);
    });
}
