//! Tombola Server - Main Entry Point
//!
//! Giveaway platform backend with capability delegation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::info;

use tb_server::delegation::circuit::CircuitBreaker;
use tb_server::delegation::fallback::{
    randomized_winner_selection, FallbackDispatcher, FallbackStrategy, ResultCache,
};
use tb_server::delegation::gateway::DelegationGateway;
use tb_server::delegation::queue::{spawn_workers, AsyncJobQueue, WorkerContext};
use tb_server::delegation::transport::HttpTransport;
use tb_server::delegation::types::Capability;
use tb_server::notify::{LogBroadcaster, LogNotifier};
use tb_server::observability::monitor::HealthMonitor;
use tb_server::observability::recorder::{spawn_sample_writer, MetricsRecorder};
use tb_server::{api, config, db};

/// Bound on buffered metric samples before recording drops.
const METRIC_CHANNEL_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tb_server=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = config::Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Tombola Server"
    );

    // Initialize database
    let db_pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&db_pool).await?;

    // Initialize Redis
    let redis = db::create_redis_client(&config.redis_url).await?;

    // Metric recording channel and background writer
    let (metrics, metric_rx) = MetricsRecorder::channel(METRIC_CHANNEL_CAPACITY);
    spawn_sample_writer(db_pool.clone(), metric_rx);

    let notifier = Arc::new(LogNotifier);
    let broadcaster = Arc::new(LogBroadcaster);

    // Delegation plumbing
    let breaker = Arc::new(CircuitBreaker::new(config.circuit_config()));
    let cache = Arc::new(ResultCache::new());
    let queue = Arc::new(AsyncJobQueue::new(db_pool.clone(), redis));

    // Re-seed Redis scheduling state from Postgres before workers start
    let recovered = queue.recover().await?;
    if recovered > 0 {
        info!(count = recovered, "Recovered unfinished delegation jobs");
    }

    let fallbacks = Arc::new(FallbackDispatcher::new(
        Arc::clone(&cache),
        db_pool.clone(),
        Arc::clone(&queue),
    ));
    fallbacks.register(
        Capability::WinnerSelection,
        FallbackStrategy::DefaultBehavior(Arc::new(randomized_winner_selection)),
    );
    fallbacks.register(
        Capability::ParticipantRegistration,
        FallbackStrategy::DeferredQueue,
    );
    fallbacks.register(
        Capability::AnalyticsReport,
        FallbackStrategy::CachedResult {
            freshness: Duration::from_secs(config.fallback_cache_freshness_secs),
        },
    );
    fallbacks.register(Capability::PrizeAllocation, FallbackStrategy::ManualApproval);

    let gateway = Arc::new(DelegationGateway::new(
        db_pool.clone(),
        HttpTransport::new(),
        Arc::clone(&breaker),
        fallbacks,
        cache,
        Arc::clone(&queue),
        metrics.clone(),
        broadcaster.clone(),
    ));

    // Shutdown fan-out for workers and the health monitor
    let (shutdown_tx, _) = broadcast::channel(1);

    // Async delivery workers
    let worker_ctx = Arc::new(WorkerContext {
        queue: Arc::clone(&queue),
        transport: HttpTransport::new(),
        metrics,
        notifier: notifier.clone(),
        broadcaster,
        attempt_deadline: Duration::from_secs(config.async_attempt_deadline_secs),
    });
    spawn_workers(config.worker_count, worker_ctx, &shutdown_tx);

    // Health monitor
    let monitor = HealthMonitor::new(
        db_pool.clone(),
        Arc::clone(&breaker),
        notifier,
        Duration::from_secs(config.health_interval_secs),
        config.health_thresholds(),
    );
    tokio::spawn(monitor.run(shutdown_tx.subscribe()));

    // Build application state
    let state = api::AppState {
        db: db_pool,
        config: Arc::new(config.clone()),
        breaker,
        queue,
        gateway,
    };

    // Build router
    let app = api::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Server listening");

    // Graceful shutdown handler
    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal, cleaning up...");
        let _ = shutdown_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Server shutdown complete");

    Ok(())
}
