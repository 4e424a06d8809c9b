//! Kumo service entry point
//!
//! Starts the control API, opens the store, and rebinds any jobs left
//! `running` or `pending` by a previous process.

use clap::Parser;
use kumo::api::build_router;
use kumo::crawler::HttpFetcher;
use kumo::{JobManager, RuntimeConfig, SqliteStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Kumo: a durable, resumable, polite web crawler service
#[derive(Parser, Debug)]
#[command(name = "kumo")]
#[command(version)]
#[command(about = "A durable, resumable, polite web crawler service", long_about = None)]
struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "KUMO_DATABASE_PATH", default_value = "./kumo.db")]
    database_path: PathBuf,

    /// Address to bind the control API to
    #[arg(long, env = "KUMO_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, env = "KUMO_LOG", default_value = "kumo=info,warn")]
    log: String,

    /// Default worker concurrency for new jobs
    #[arg(long, env = "KUMO_DEFAULT_WORKERS", default_value_t = 10)]
    default_workers: u32,

    /// Default per-domain crawl delay in milliseconds
    #[arg(long, env = "KUMO_DEFAULT_CRAWL_DELAY_MS", default_value_t = 1000)]
    default_crawl_delay_ms: u64,

    /// Default page budget for new jobs
    #[arg(long, env = "KUMO_DEFAULT_MAX_PAGES", default_value_t = 100_000)]
    default_max_pages: u32,

    /// Per-request fetch timeout in milliseconds
    #[arg(long, env = "KUMO_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,

    /// Throttle window in seconds applied on 429/503 without Retry-After
    #[arg(long, env = "KUMO_THROTTLE_SECS", default_value_t = 60)]
    throttle_secs: u64,

    /// Contact URL advertised in the User-Agent header
    #[arg(
        long,
        env = "KUMO_CONTACT_URL",
        default_value = "https://github.com/kumo-crawler/kumo"
    )]
    contact_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .with_target(false)
        .init();

    let runtime = RuntimeConfig {
        database_path: cli.database_path.clone(),
        bind_addr: cli.bind,
        contact_url: cli.contact_url,
        default_workers: cli.default_workers,
        default_crawl_delay_ms: cli.default_crawl_delay_ms,
        default_max_pages: cli.default_max_pages,
        request_timeout: Duration::from_millis(cli.request_timeout_ms),
        default_throttle: Duration::from_secs(cli.throttle_secs),
        ..Default::default()
    };

    tracing::info!(path = %runtime.database_path.display(), "opening store");
    let store = SqliteStore::open(&runtime.database_path)?;

    let fetcher = Arc::new(HttpFetcher::new(
        &runtime.user_agent(),
        runtime.request_timeout,
    )?);
    let manager = JobManager::new(store, fetcher, runtime.clone())?;

    // No job may be left in an un-owned running state after startup
    match manager.recover() {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, "recovered jobs from previous run"),
        Err(e) => tracing::error!(error = %e, "job recovery failed"),
    }

    let router = build_router(manager.clone());
    let listener = tokio::net::TcpListener::bind(runtime.bind_addr).await?;
    tracing::info!(addr = %runtime.bind_addr, "control API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;

    Ok(())
}

/// Waits for ctrl-c, then signals every dispatcher to drain. In-flight
/// fetches persist their results; the jobs stay `running` in the store and
/// are rebound on the next start.
async fn shutdown_signal(manager: JobManager) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutting down, draining dispatchers");
    manager.shutdown();
}
