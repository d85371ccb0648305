//! # commitscan server
//!
//! Runs the scan worker pool against the job store and serves the operator
//! API next to it.
//!
//! ## Architecture
//!
//! - PostgreSQL for durable jobs, results and failure records (in-memory
//!   store when no database is configured)
//! - A tokio worker pool claiming jobs under leases
//! - Axum for the `/api/v1` operator endpoints

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commitscan_core::{
    InMemoryStore, InstancePool, PostgresStore, ScanExecutor, ScanRuntime,
    ScanStore, SonarScanExecutor,
};
use commitscan_server::{
    AppState,
    infra::config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions},
    routes,
};

#[derive(Parser, Debug)]
#[command(name = "commitscan-server")]
#[command(about = "Per-commit static analysis orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "COMMITSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Alternative `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,

    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Serve the API without running scan workers in this process.
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli.serve)?;

    match cli.command {
        Some(Command::Migrate) => run_migrate(&config).await,
        None => run_server(config, cli.serve.api_only).await,
    }
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let ConfigLoad {
        mut config,
        warnings,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    // Override via RUST_LOG.
                    "info,scan::worker=info,scan::housekeeper=info,tower_http=warn"
                        .into()
                }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    Ok(config)
}

async fn run_migrate(config: &Config) -> anyhow::Result<()> {
    let url = config
        .database
        .url
        .as_deref()
        .context("DATABASE_URL is required for migrations")?;
    let store = PostgresStore::connect(url, config.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL for migration")?;
    store.migrate().await.context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn ScanStore>> {
    match config.database.url.as_deref() {
        Some(url) => {
            let store =
                PostgresStore::connect(url, config.database.max_connections)
                    .await
                    .context("failed to connect to PostgreSQL")?;
            store.migrate().await.context("database migration failed")?;
            info!("using PostgreSQL job store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("no database configured; jobs are lost on restart");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

async fn run_server(config: Config, api_only: bool) -> anyhow::Result<()> {
    let orchestrator = config.orchestrator.clone();

    let store = open_store(&config).await?;
    let pool = InstancePool::from_config(&orchestrator.instances)
        .context("invalid analysis instance configuration")?;
    let executor: Arc<dyn ScanExecutor> = Arc::new(
        SonarScanExecutor::new(
            orchestrator.scanner.clone(),
            orchestrator.measures.clone(),
        )
        .context("failed to build scan executor")?,
    );

    let runtime = ScanRuntime::new(
        orchestrator,
        Arc::clone(&store),
        pool.clone(),
        executor,
    );
    if api_only {
        info!("api-only mode; scan workers are not started");
    } else {
        runtime.start().await.context("failed to start scan workers")?;
    }

    let app = routes::create_app(AppState::new(&config, store, pool));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    info!("Starting commitscan server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}
