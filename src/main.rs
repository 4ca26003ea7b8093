//! pgaudit-proxy - Transparent PostgreSQL proxy with audit logging
//!
//! This binary runs a standalone proxy that:
//! - Routes PostgreSQL clients to backends by (database, user)
//! - Logs in to the backend with the route's credentials
//! - Relays all traffic transparently after authentication
//! - Writes a decoded audit trail of everything it relayed

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use pgaudit_proxy::{config, AnalysisService, Listener, Result};

#[derive(Parser)]
#[command(name = "pgaudit-proxy")]
#[command(version)]
#[command(about = "PostgreSQL proxy with credential substitution and audit logging")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override listen address (repeat or comma-separate for several)
    #[arg(long)]
    listen_address: Vec<String>,

    /// Override listen port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Write audit records as JSON Lines to this file or FIFO
    #[arg(long)]
    audit_output: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(&cli.config)?;

    // Initialize logging
    // Priority: --verbose flag, then RUST_LOG env var, then logging.level
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone())
    };
    tracing_subscriber::fmt().with_env_filter(&log_level).init();

    info!("Starting pgaudit-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", cli.config);

    // Apply CLI overrides
    if !cli.listen_address.is_empty() {
        config.server.listen_address = cli
            .listen_address
            .iter()
            .flat_map(|a| config::split_addresses(a))
            .collect();
    }
    if let Some(port) = cli.listen_port {
        config.server.listen_port = port;
    }
    if let Some(path) = cli.audit_output {
        config.analysis.output_path = Some(path);
    }

    let config = Arc::new(config);

    let (analysis, service) = match AnalysisService::start(&config.analysis) {
        Some((tx, service)) => (Some(tx), Some(service)),
        None => {
            info!("Audit analysis disabled");
            (None, None)
        }
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let listener = Listener::bind(Arc::clone(&config), analysis, shutdown_rx).await?;
    let stats = listener.stats();

    info!(
        "Proxy ready: listening on {} with {} route(s)",
        config.server.bind_addresses().join(", "),
        config.routes.len()
    );
    for route in &config.routes {
        info!(
            "  {}@{} -> {} as {}@{}",
            route.username,
            route.database,
            route.endpoint(),
            route.backend_username(),
            route.backend_database()
        );
    }

    // Spawn the listener task
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            error!("Listener error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Send shutdown signal
    let _ = shutdown_tx.send(());

    // Wait for listener to finish
    let _ = listener_handle.await;

    // The listener and every session have dropped their senders, so the
    // analysis task drains what is left and exits.
    if let Some(service) = service {
        let processed = service.finish().await;
        info!("Audit analysis processed {} chunk(s)", processed);
    }

    info!(
        "Shutdown complete. Total connections handled: {}",
        stats
            .connections_accepted
            .load(std::sync::atomic::Ordering::Relaxed)
    );

    Ok(())
}
