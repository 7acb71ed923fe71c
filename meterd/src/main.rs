use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use meterd::config::{Args, Config};
use meterd::consumer::{TransactionApplier, UsageEventApplier};
use meterd::db::handlers::PostgresLedgerStore;
use meterd::ledger::Ledger;
use meterd::{cache::MemorySnapshotCache, telemetry};
use sluice::{PostgresQueue, Worker};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize telemetry (tracing + optional OpenTelemetry)
    telemetry::init_telemetry(config.enable_otel_export)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.pool.max_connections)
        .min_connections(config.database.pool.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.pool.acquire_timeout_secs))
        .connect(&config.database.url)
        .await?;
    meterd::db::migrator().run(&pool).await?;
    sluice::migrator().run(&pool).await?;

    let store = Arc::new(PostgresLedgerStore::new(pool.clone()));
    let options = config.queue.job_options();
    let transactions = Arc::new(PostgresQueue::new(pool.clone(), "transactions", options.clone()));
    let usage_events = Arc::new(PostgresQueue::new(pool, "usage_events", options));

    let ledger = Ledger::builder()
        .balance_cache(Arc::new(MemorySnapshotCache::new()))
        .token_usage_cache(Arc::new(MemorySnapshotCache::new()))
        .store(store.clone())
        .transaction_queue(transactions.clone())
        .usage_event_queue(usage_events.clone())
        .balance_ttl(config.cache.balance_ttl)
        .token_usage_ttl(config.cache.token_usage_ttl)
        .retry_policy(config.cache.retry.clone().into())
        .history_limit(config.history.max_results)
        .build()?;
    ledger.resync().await?;

    // One worker per queue, each applying records sequentially so durable
    // aggregate updates never race each other.
    let shutdown = CancellationToken::new();
    let transaction_worker = Worker::new(
        transactions,
        Arc::new(TransactionApplier::new(store.clone())),
        config.queue.worker_config(),
    );
    let usage_worker = Worker::new(
        usage_events,
        Arc::new(UsageEventApplier::new(store)),
        config.queue.worker_config(),
    );

    let transaction_task = tokio::spawn(transaction_worker.run(shutdown.clone()));
    let usage_task = tokio::spawn(usage_worker.run(shutdown.clone()));

    shutdown_signal().await;
    shutdown.cancel();

    transaction_task.await??;
    usage_task.await??;

    telemetry::shutdown_telemetry();
    Ok(())
}
