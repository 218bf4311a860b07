mod config;
mod proxy;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use llm_relay_core::{KeyChecker, KeyPool, Service};
use owo_colors::OwoColorize;
use reqwest::Client;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{RelayConfig, config_file_path, init_config_template, load_config};
use crate::proxy::{ProxyService, router as proxy_router};

#[derive(Parser, Debug)]
#[command(name = "llm-relay")]
#[command(about = "Multi-vendor LLM reverse proxy with a shared key pool and fair queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub enum CliError {
    /// Errors related to llm-relay's own config file
    Config(String),
    /// Generic fallback for other failures
    Other(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Config error: {}", msg),
            CliError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Other(format!("{e:#}"))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the relay (default when no command is given)
    Serve {
        /// Listen port (overrides `port` from config)
        #[arg(long)]
        port: Option<u16>,
        /// Write daily-rolling logs into this directory instead of stderr
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Manage the relay config file
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write a commented config.toml template
    Init {
        /// Overwrite an existing config.toml (a .bak copy is kept)
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("{}", err.to_string().red());
        std::process::exit(1);
    }
}

async fn real_main() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve {
        port: None,
        log_dir: None,
    }) {
        Command::Config { cmd } => {
            match cmd {
                ConfigCommand::Init { force } => {
                    let path = init_config_template(force)
                        .await
                        .map_err(|e| CliError::Config(format!("{e:#}")))?;
                    println!("Wrote {}", path.display());
                }
                ConfigCommand::Path => println!("{}", config_file_path().display()),
            }
            Ok(())
        }
        Command::Serve { port, log_dir } => {
            let mut cfg = load_config()
                .await
                .map_err(|e| CliError::Config(format!("{e:#}")))?;
            if let Some(port) = port {
                cfg.port = port;
            }
            if log_dir.is_some() {
                cfg.log_dir = log_dir;
            }
            let _log_guard = init_tracing(cfg.log_dir.as_deref());
            run_server(cfg).await?;
            Ok(())
        }
    }
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Default to info logs unless the user sets RUST_LOG.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let _ = std::fs::create_dir_all(dir);
            let file_appender = tracing_appender::rolling::daily(dir, "llm-relay.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(non_blocking)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    }
}

async fn run_server(cfg: RelayConfig) -> anyhow::Result<()> {
    let addr = cfg.bind_addr()?;
    let credentials = cfg.credentials();
    let pool = Arc::new(KeyPool::from_credentials(
        credentials.iter().map(|(svc, list)| (*svc, list.as_str())),
    ));
    pool.set_checks_enabled(cfg.check_keys);
    for svc in Service::ALL {
        let n = pool.store(svc).len();
        if n > 0 {
            info!(service = %svc, keys = n, "loaded keys");
        }
    }
    if pool.stores().all(|s| s.is_empty()) {
        warn!("no API keys configured; every request will fail until keys are added");
    }

    let client = Client::builder()
        .build()
        .context("build upstream HTTP client")?;
    let cfg = Arc::new(cfg);
    let proxy = ProxyService::new(client.clone(), cfg.clone(), pool.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if cfg.check_keys {
        for store in pool.stores().filter(|s| !s.is_empty()) {
            let base_url = cfg.base_url(store.service());
            KeyChecker::new(store.clone(), client.clone(), base_url).spawn(shutdown_rx.clone());
        }
    }
    proxy.queue().spawn_scheduler(shutdown_rx.clone());
    proxy.queue().spawn_sweeper(shutdown_rx.clone());

    let app = proxy_router(proxy);
    let listener = bind_listener_or_explain(addr).await?;
    info!("llm-relay listening on http://{addr}");

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutting down");
        let _ = shutdown_tx.send(true);
    });

    let server_shutdown = {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    };
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(server_shutdown)
    .await?;
    Ok(())
}

async fn bind_listener_or_explain(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        let help = listener_bind_help(addr, &err);
        anyhow::Error::new(err).context(help)
    })
}

fn listener_bind_help(addr: SocketAddr, err: &std::io::Error) -> String {
    let port = addr.port();
    let example_cmd = format!("llm-relay serve --port {}", port.saturating_add(1));
    match err.kind() {
        ErrorKind::AddrInUse => format!(
            "cannot listen on http://{addr}: port {port} is already in use.\n- stop the other process, or pick another port, e.g. `{example_cmd}`"
        ),
        ErrorKind::PermissionDenied => format!(
            "cannot listen on http://{addr}: permission denied for port {port}.\n- use a port above 1024, e.g. `{example_cmd}`"
        ),
        _ => format!("cannot listen on http://{addr}"),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = sigterm.recv() => {},
                }
            }
            _ => {
                // Fallback: at least handle Ctrl+C.
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_help_for_addr_in_use_suggests_next_port() {
        let addr: SocketAddr = "127.0.0.1:7860".parse().unwrap();
        let err = std::io::Error::from(ErrorKind::AddrInUse);
        let help = listener_bind_help(addr, &err);
        assert!(help.contains("already in use"));
        assert!(help.contains("--port 7861"));
    }

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::parse_from(["llm-relay"]);
        assert!(cli.command.is_none());
        let cli = Cli::parse_from(["llm-relay", "serve", "--port", "9000"]);
        assert!(matches!(
            cli.command,
            Some(Command::Serve { port: Some(9000), .. })
        ));
    }
}
