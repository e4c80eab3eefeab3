//! Marketsync - marketplace confirmation and reconciliation process.
//!
//! # Usage
//!
//! ```bash
//! # Start with default config
//! marketsync --marketplace-address addr_test1... --oracle-address addr_test1...
//!
//! # Start with environment overrides
//! DATABASE_URL=postgres://localhost/marketsync \
//! INDEXER_DATABASE_URL=postgres://localhost/cexplorer \
//! MARKETPLACE_ADDRESS=addr_test1... marketsync
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use rust_decimal::Decimal;
use tokio::signal;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, fmt};

use marketsync_core::error::ReconcileError;
use marketsync_core::metrics::init_metrics;
use marketsync_core::ports::{ChainIndexer, LedgerStore};
use marketsync_core::retry::RetryPolicy;
use marketsync_core::services::{
    ConfirmationPolicy, ConfirmationTracker, ReconcilerConfig, ReconciliationEngine,
    SettlementPolicy, TrackerConfig,
};
use marketsync_dbsync::{DbSyncConfig, DbSyncIndexer};
use marketsync_storage::{Database, DatabaseConfig, PgLedgerStore};

/// Marketsync CLI.
#[derive(Parser, Debug)]
#[command(name = "marketsync")]
#[command(about = "Marketsync - on-chain confirmation and marketplace reconciliation")]
#[command(version)]
struct Cli {
    /// Ledger PostgreSQL database URL.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost/marketsync"
    )]
    database_url: String,

    /// db-sync PostgreSQL database URL (opened read-only).
    #[arg(
        long,
        env = "INDEXER_DATABASE_URL",
        default_value = "postgres://localhost/cexplorer"
    )]
    indexer_database_url: String,

    /// Address of the marketplace script.
    #[arg(long, env = "MARKETPLACE_ADDRESS")]
    marketplace_address: String,

    /// Address holding the exchange rate oracle output.
    #[arg(long, env = "ORACLE_ADDRESS", default_value = "")]
    oracle_address: String,

    /// Blocks required on top of a transaction before it counts as confirmed.
    #[arg(long, env = "CONFIRMATION_THRESHOLD", default_value = "20")]
    confirmation_threshold: u32,

    /// Minutes a record may stay pending without being indexed.
    #[arg(long, env = "MAX_PENDING_AGE_MINS", default_value = "60")]
    max_pending_age_mins: u64,

    /// Seconds between reconciliation cycles.
    #[arg(long, env = "SCAN_INTERVAL_SECS", default_value = "30")]
    scan_interval_secs: u64,

    /// Transactions read per address scan.
    #[arg(long, env = "SCAN_LIMIT", default_value = "100")]
    scan_limit: u32,

    /// Seconds between checks of a tracked transaction.
    #[arg(long, env = "TRACK_INTERVAL_SECS", default_value = "10")]
    track_interval_secs: u64,

    /// Consecutive indexer errors tolerated by a tracker.
    #[arg(long, env = "MAX_RETRIES", default_value = "3")]
    max_retries: u32,

    /// Delay between retries in milliseconds.
    #[arg(long, env = "RETRY_DELAY_MS", default_value = "2000")]
    retry_delay_ms: u64,

    /// Marketplace fee as a percentage of the purchase price.
    #[arg(long, env = "FEE_PERCENT", default_value = "5")]
    fee_percent: Decimal,

    /// Subscription length in days.
    #[arg(long, env = "SUBSCRIPTION_DURATION_DAYS", default_value = "30")]
    subscription_duration_days: u32,

    /// Prometheus metrics port.
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    /// Run database migrations and exit.
    #[arg(long)]
    migrate_only: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn confirmation_policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            threshold: self.confirmation_threshold,
            max_age: Duration::from_secs(self.max_pending_age_mins * 60),
        }
    }

    fn settlement_policy(&self) -> SettlementPolicy {
        SettlementPolicy {
            fee_percent: self.fee_percent,
            subscription_duration_days: self.subscription_duration_days,
        }
    }

    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            marketplace_address: self.marketplace_address.clone(),
            scan_interval: Duration::from_secs(self.scan_interval_secs),
            scan_limit: self.scan_limit,
            confirmation: self.confirmation_policy(),
            settlement: self.settlement_policy(),
            ..Default::default()
        }
    }

    fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            poll_interval: Duration::from_secs(self.track_interval_secs),
            confirmation: self.confirmation_policy(),
            settlement: self.settlement_policy(),
            retry: RetryPolicy::fixed(
                self.max_retries,
                Duration::from_millis(self.retry_delay_ms),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    // Prometheus metrics exporter (optional - failures don't crash the app)
    let metrics_enabled =
        match format!("0.0.0.0:{}", cli.metrics_port).parse::<std::net::SocketAddr>() {
            Ok(metrics_addr) => {
                match PrometheusBuilder::new()
                    .with_http_listener(metrics_addr)
                    .install()
                {
                    Ok(()) => {
                        init_metrics();
                        true
                    }
                    Err(e) => {
                        warn!("⚠️  Failed to start metrics exporter: {}. Continuing without metrics.", e);
                        false
                    }
                }
            }
            Err(e) => {
                warn!("⚠️  Invalid metrics address: {}. Continuing without metrics.", e);
                false
            }
        };

    // ─────────────────────────────────────────────────────────────────────────
    // 🚀 STARTUP
    // ─────────────────────────────────────────────────────────────────────────
    info!("🚀 Starting Marketsync");
    debug!(database_url = %mask_password(&cli.database_url), "Ledger endpoint");
    debug!(indexer_url = %mask_password(&cli.indexer_database_url), "Indexer endpoint");

    // ─────────────────────────────────────────────────────────────────────────
    // 🗄️ DATABASES
    // ─────────────────────────────────────────────────────────────────────────
    info!("🗄️  Connecting to ledger database...");
    let ledger_db = Database::connect(&DatabaseConfig::for_ledger(&cli.database_url))
        .await
        .context("Failed to connect to ledger database")?;

    ledger_db
        .migrate()
        .await
        .context("Failed to run migrations")?;
    info!("🗄️  Ledger ready (migrations applied)");

    if cli.migrate_only {
        info!("🛑 --migrate-only flag set, exiting");
        ledger_db.close().await;
        return Ok(());
    }

    info!("🗄️  Connecting to db-sync database...");
    let indexer_db = Database::connect(&DatabaseConfig::for_indexer(&cli.indexer_database_url))
        .await
        .context("Failed to connect to db-sync database")?;
    indexer_db
        .ensure_healthy()
        .await
        .context("db-sync database is not answering")?;

    let ledger_db = Arc::new(ledger_db);
    let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(ledger_db.clone()));

    let dbsync = DbSyncIndexer::new(
        indexer_db.pool().clone(),
        DbSyncConfig {
            oracle_address: cli.oracle_address.clone(),
            ..Default::default()
        },
    );
    let tip = dbsync.tip().await.context("Failed to read db-sync tip")?;
    info!(tip, "🔗 Chain index connected");
    if cli.oracle_address.is_empty() {
        warn!("⚠️  No oracle address configured, exchange rates are unavailable");
    }
    let indexer: Arc<dyn ChainIndexer> = Arc::new(dbsync);

    // ─────────────────────────────────────────────────────────────────────────
    // ⚡ SERVICES START
    // ─────────────────────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler_config = cli.reconciler_config();
    let pending_batch = reconciler_config.pending_batch;

    let tracker = Arc::new(ConfirmationTracker::new(
        cli.tracker_config(),
        indexer.clone(),
        store.clone(),
    ));
    let tracker_handles = tracker
        .resume_pending(pending_batch, shutdown_rx.clone())
        .await
        .context("Failed to resume pending records")?;

    let engine = ReconciliationEngine::new(reconciler_config, indexer, store);
    let engine_handle = tokio::spawn(
        async move {
            if let Err(e) = engine.run_forever(shutdown_rx).await {
                match &e {
                    ReconcileError::ShutdownRequested => {}
                    _ => error!(error = ?e, "❌ Reconciliation engine error"),
                }
            }
        }
        .instrument(info_span!("reconciler")),
    );

    // ─────────────────────────────────────────────────────────────────────────
    // ✅ READY
    // ─────────────────────────────────────────────────────────────────────────
    info!("✅ Marketsync ready");
    info!("   🏪 Marketplace: {}", cli.marketplace_address);
    info!(
        "   🔁 Scan every {}s, threshold {} blocks",
        cli.scan_interval_secs, cli.confirmation_threshold
    );
    if metrics_enabled {
        info!(
            "   📊 Metrics:  http://localhost:{}/metrics",
            cli.metrics_port
        );
    } else {
        info!("   📊 Metrics:  disabled");
    }
    info!("   Press Ctrl+C to stop");

    shutdown_signal().await;

    // ─────────────────────────────────────────────────────────────────────────
    // 🛑 SHUTDOWN
    // ─────────────────────────────────────────────────────────────────────────
    info!("🛑 Shutting down...");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(30), engine_handle).await {
        Ok(_) => debug!("Reconciliation engine stopped"),
        Err(_) => warn!("⚠️  Reconciliation engine shutdown timed out"),
    }

    let trackers = futures::future::join_all(tracker_handles);
    match tokio::time::timeout(Duration::from_secs(10), trackers).await {
        Ok(outcomes) => debug!(count = outcomes.len(), "Trackers stopped"),
        Err(_) => warn!("⚠️  Tracker shutdown timed out"),
    }

    ledger_db.close().await;
    indexer_db.close().await;

    info!("🛑 Shutdown complete");
    Ok(())
}

/// Initialize tracing subscriber.
fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

/// Mask password in database URL for logging.
fn mask_password(url_str: &str) -> String {
    match url::Url::parse(url_str) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => url_str.to_string(),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "❌ Failed to listen for Ctrl+C");
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
                error!(error = %e, "❌ Failed to install SIGTERM handler");
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
}
