use identity_core::{
    build_router,
    config::IdentityConfig,
    services::{
        metrics, Clock, Database, EmailChallengeDelivery, InvalidationBus, LocalInvalidationBus,
        LoginThrottle, PolicyMap, RedisInvalidationBus, RefreshTokenLedger, StoreAuditSink,
        SystemClock,
    },
    AppState, Collaborators, IdentityCore,
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;

    metrics::init_metrics()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Metrics registry: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        environment = ?config.environment,
        "Starting identity maintenance process"
    );

    let db = Database::connect(&config.database).await?;
    db.migrate().await?;

    let redis = match &config.redis {
        Some(redis_config) => Some(
            RedisInvalidationBus::new(redis_config)
                .await
                .map_err(AppError::InternalError)?,
        ),
        None => {
            tracing::info!("REDIS_URL not set; permission invalidations stay local");
            None
        }
    };

    let invalidation: Arc<dyn InvalidationBus> = match &redis {
        Some(bus) => Arc::new(bus.clone()),
        None => Arc::new(LocalInvalidationBus),
    };

    let store = Arc::new(db.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let delivery = EmailChallengeDelivery::new(&config.smtp).map_err(AppError::ConfigError)?;

    let core = IdentityCore::assemble(
        Collaborators {
            credentials: store.clone(),
            roles: store.clone(),
            refresh_tokens: store.clone(),
            delivery: Arc::new(delivery),
            audit: Arc::new(StoreAuditSink::new(store.clone(), clock.clone())),
            invalidation,
            clock,
        },
        &config.core,
        PolicyMap::new(),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener_handle = redis
        .as_ref()
        .map(|bus| bus.spawn_listener(core.cache.clone(), shutdown_rx.clone()));

    let purge_handle = spawn_purge_loop(
        core.ledger.clone(),
        core.throttle.clone(),
        Duration::from_secs(config.core.refresh.purge_interval_seconds),
        shutdown_rx.clone(),
    );

    let state = AppState {
        service_name: config.service_name.clone(),
        db,
        redis,
        core,
    };
    let app = build_router(state);

    let addr = config.common.bind_address();
    tracing::info!(address = %addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping background tasks");
    // Receivers may already be gone; nothing to report then.
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.common.shutdown_grace_seconds);
    let background = async {
        if let Some(handle) = listener_handle {
            let _ = handle.await;
        }
        let _ = purge_handle.await;
    };
    if tokio::time::timeout(grace, background).await.is_err() {
        tracing::warn!(grace_seconds = grace.as_secs(), "Background tasks did not stop in time");
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

fn spawn_purge_loop(
    ledger: Arc<RefreshTokenLedger>,
    throttle: Arc<LoginThrottle>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match ledger.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => tracing::info!(purged, "Purged expired refresh tokens"),
                        Err(e) => tracing::error!(error = %e, "Refresh token purge failed"),
                    }
                    let tracked = throttle.prune();
                    tracing::debug!(tracked, "Pruned login throttle keys");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
