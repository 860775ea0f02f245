use anyhow::{Context, Result};
use callwire_core::auth::{Authenticator, TokenTableAuth, TrustedHeaderAuth};
use callwire_core::clock::SystemClock;
use callwire_core::config::{AuthMode, Config};
use callwire_core::durable::{CallHistoryStore, ContactDirectory, MemoryDurableStore, SqlDurableStore};
use callwire_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use callwire_core::metrics::init_metrics;
use callwire_core::orchestrator::{CallOrchestrator, Collaborators, SignalingSettings};
use callwire_core::shutdown::{install_signal_handlers, ShutdownCoordinator};
use callwire_core::store::MemoryStore;
use callwire_core::sweeper::ExpirySweeper;
use callwire_core::transport::ConnectionHub;
use callwire_core::types::UserId;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod error;
mod routes;
mod state;
mod ws;

use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "callwire")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<LogLevel>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Address to listen on
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// SQLite database for contacts and call history
    #[arg(long)]
    sqlite: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling server (default)
    Serve,
    /// Write the effective configuration as TOML
    Config {
        /// Output file
        output: PathBuf,
    },
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;

        if let Some(level) = self.log_level {
            config.logging.level = level.as_str().to_string();
        }
        if self.json_logs {
            config.logging.json_format = true;
        }
        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }
        if let Some(path) = &self.sqlite {
            config.storage.sqlite_path = Some(path.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

fn durable_store(config: &Config) -> Result<(Arc<dyn ContactDirectory>, Arc<dyn CallHistoryStore>)> {
    match &config.storage.sqlite_path {
        Some(path) => {
            let store = Arc::new(
                SqlDurableStore::open(path, config.storage.pool_size)
                    .with_context(|| format!("opening {}", path.display()))?,
            );
            info!(path = %path.display(), "Using SQLite durable store");
            let directory: Arc<dyn ContactDirectory> = store.clone();
            let history: Arc<dyn CallHistoryStore> = store;
            Ok((directory, history))
        }
        None => {
            info!("Using in-memory durable store");
            let store = Arc::new(MemoryDurableStore::new());
            let directory: Arc<dyn ContactDirectory> = store.clone();
            let history: Arc<dyn CallHistoryStore> = store;
            Ok((directory, history))
        }
    }
}

fn authenticator(config: &Config) -> Arc<dyn Authenticator> {
    match config.server.auth_mode {
        AuthMode::TrustedHeader => Arc::new(TrustedHeaderAuth),
        AuthMode::Tokens => Arc::new(
            config
                .server
                .tokens
                .iter()
                .map(|(token, user)| (token.clone(), UserId::new(user.as_str())))
                .collect::<TokenTableAuth>(),
        ),
    }
}

async fn serve(config: Config) -> Result<()> {
    if config.metrics.enabled {
        PrometheusBuilder::new()
            .with_http_listener(config.metrics.bind_address)
            .install()
            .context("installing Prometheus exporter")?;
        info!(address = %config.metrics.bind_address, "Prometheus metrics enabled");
    }
    init_metrics();

    let shutdown = Arc::new(ShutdownCoordinator::new(config.server.shutdown_timeout));
    let hub = Arc::new(ConnectionHub::new());
    let (directory, history) = durable_store(&config)?;

    let orchestrator = CallOrchestrator::new(
        Arc::new(MemoryStore::new()),
        Collaborators {
            directory: directory.clone(),
            history: history.clone(),
            sink: hub.clone(),
            clock: Arc::new(SystemClock),
        },
        SignalingSettings::from(&config.signaling),
    );

    let state = AppState {
        orchestrator: orchestrator.clone(),
        hub: hub.clone(),
        auth: authenticator(&config),
        directory,
        history,
        shutdown: shutdown.clone(),
        user_header: config.server.user_header.clone(),
        history_limit: config.server.history_limit,
    };

    let sweeper =
        ExpirySweeper::new(orchestrator.clone(), config.signaling.sweep_interval).spawn(shutdown.subscribe());
    install_signal_handlers(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(config.server.bind_address)
        .await
        .with_context(|| format!("binding {}", config.server.bind_address))?;
    info!(address = %config.server.bind_address, auth_mode = ?config.server.auth_mode, "Signaling server listening");

    let mut stop = shutdown.subscribe();
    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
        })
        .await?;

    orchestrator.shutdown();
    hub.close_all();
    sweeper.await?;
    info!("Signaling server stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    if let Some(Command::Config { output }) = &args.command {
        config.save_to_file(output)?;
        println!("Configuration written to {}", output.display());
        return Ok(());
    }

    init_logging_with_config(LogConfig::try_from(&config.logging)?)?;
    info!(version = env!("CARGO_PKG_VERSION"), "callwire starting");

    serve(config).await
}
