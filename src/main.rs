//! shellmux
//!
//! Named interactive shell sessions for tool-driven clients. Commands run with
//! a bounded wait; long-running ones keep going in the background and their
//! output can be collected later.

mod config;
mod process;
mod server;
mod shell;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::Settings;
use server::{serve_stdio, ConnectionHandler, ServerConfig, WebSocketServer};
use shell::Terminal;

/// Interactive shell-session manager
#[derive(Parser, Debug)]
#[command(name = "shellmux")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to ./.shellmux/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve tools over WebSocket
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = 9000)]
        port: u16,

        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Authentication token for remote connections
        #[arg(long)]
        token: Option<String>,
    },
    /// Serve tools as line-delimited JSON on stdin/stdout
    Stdio,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    info!("shellmux v{}", env!("CARGO_PKG_VERSION"));

    let settings = match &args.config {
        Some(path) => Settings::load_file(path)?,
        None => Settings::load(&std::env::current_dir()?)?,
    };
    let terminal = Arc::new(Terminal::with_config(settings.shell));

    match args.command {
        Command::Serve { port, bind, token } => {
            if token.is_some() {
                info!("Token authentication enabled");
            }

            let config = ServerConfig::new(bind, port).with_token(token);
            let server = Arc::new(WebSocketServer::new(config, terminal));
            let server_handle = Arc::clone(&server);

            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Initiating graceful shutdown...");
                server_handle.shutdown();
            });

            server.run().await?;
        }
        Command::Stdio => {
            let handler = ConnectionHandler::new(Arc::clone(&terminal));
            tokio::select! {
                result = serve_stdio(&handler) => result?,
                _ = shutdown_signal() => {
                    info!("Initiating graceful shutdown...");
                    terminal.shutdown_all();
                }
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Install the stderr log subscriber
///
/// `RUST_LOG` takes precedence over `--verbose` when set.
fn init_logging(verbose: bool) {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .init();
        return;
    }

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
