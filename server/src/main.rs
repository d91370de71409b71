//! sheetload-server - HTTP front end and management commands

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sheetload::{load_config, Config, Database, FilesystemBucket, IngestService, JobStatus};
use tokio::signal;
use tracing::{info, warn};

use sheetload_server::logging::{init_logging, LogFormat};
use sheetload_server::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "sheetload-server")]
#[command(about = "Spreadsheet ingestion service")]
#[command(version)]
struct Cli {
    /// JSON config file; built-in defaults are used when omitted
    #[arg(short, long, env = "SHEETLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding `server.bind`
    #[arg(short, long, env = "SHEETLOAD_BIND")]
    bind: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "SHEETLOAD_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Create the database and bucket directory, apply migrations, and exit
    InitDb,
    /// Rebuild the analytics tables
    BuildAnalytics {
        /// Queue the rebuild as a job and wait for it instead of running inline
        #[arg(long = "async")]
        background: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    let mut config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::InitDb => init_db(config),
        Command::BuildAnalytics { background } => build_analytics(config, background).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting sheetload-server v{}", env!("CARGO_PKG_VERSION"));
    let bind = config.server.bind.clone();

    let service = tokio::task::spawn_blocking(move || IngestService::open(config))
        .await?
        .context("Failed to start ingestion service")?;
    let service = Arc::new(service);

    let app = build_router(AppState::new(Arc::clone(&service)));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("Listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    match Arc::try_unwrap(service) {
        Ok(service) => {
            info!("Waiting for running tasks to finish");
            tokio::task::spawn_blocking(move || service.shutdown()).await?;
        }
        Err(_) => warn!("Service still referenced at exit; workers not joined"),
    }

    info!("Server shutdown complete");
    Ok(())
}

fn init_db(config: Config) -> Result<()> {
    let db_path = config
        .resolved_database_path()
        .context("Could not determine database path")?;
    Database::open(&db_path).context("Failed to initialize database")?;
    info!("Database ready at {}", db_path.display());

    if let Some(bucket_dir) = config.resolved_bucket_directory() {
        FilesystemBucket::new(config.bucket_name.clone(), &bucket_dir)
            .context("Failed to initialize bucket directory")?;
        info!("Bucket '{}' ready at {}", config.bucket_name, bucket_dir.display());
    }

    Ok(())
}

async fn build_analytics(config: Config, background: bool) -> Result<()> {
    let wait = Duration::from_secs(config.task_timeout_secs + 5);

    tokio::task::spawn_blocking(move || -> Result<()> {
        let service = IngestService::open(config).context("Failed to start ingestion service")?;
        let result = if background {
            build_analytics_queued(&service, wait)
        } else {
            build_analytics_inline(&service)
        };
        service.shutdown();
        result
    })
    .await?
}

fn build_analytics_inline(service: &IngestService) -> Result<()> {
    let summary = service
        .build_analytics_sync()
        .context("Analytics build failed")?;
    info!(
        combined_rows = summary.combined_rows,
        hours_rows = summary.hours_rows,
        tables = summary.tables_processed.len(),
        "Analytics build finished"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn build_analytics_queued(service: &IngestService, wait: Duration) -> Result<()> {
    let job = service
        .build_analytics_async()
        .context("Failed to queue analytics build")?;
    info!(job_id = %job.id, "Analytics build queued");

    let job = service.wait_for_job(&job.id, wait)?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    if job.status != JobStatus::Completed {
        anyhow::bail!(
            "Analytics job {} ended as {}: {}",
            job.id,
            job.status,
            job.error.unwrap_or_default()
        );
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
