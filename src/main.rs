use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use walletmem::api::{self, ApiContext};
use walletmem::cache::CacheService;
use walletmem::circuit::CircuitBreaker;
use walletmem::clock::system_clock;
use walletmem::config::Config;
use walletmem::degrade::{DegradationController, DegradeConfig, PgWriteExecutor};
use walletmem::events::EventBus;
use walletmem::indexer::{Indexer, NullBatchFeed};
use walletmem::pnl::{HttpPriceSource, NullPriceSource, PnlEngine, PriceSource};
use walletmem::registry::WalletRegistry;
use walletmem::risk::RiskEngine;
use walletmem::store;
use walletmem::upstream::{UpstreamClient, UpstreamTransaction};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting wallet memory service");

    let config = Config::load()?;
    info!(
        environment = %config.server.environment,
        api_port = config.server.api_port,
        "Configuration loaded"
    );

    // Primary store
    let db = store::create_pool(&config.database.url).await?;
    info!("Database connected");
    store::run_migrations(&db).await?;
    info!("Database migrations complete");

    let clock = system_clock();

    // Cache
    let cache = CacheService::connect(&config.cache, clock.clone()).await?;

    // Event fan-out
    let events = EventBus::new(clock.clone());

    // Named circuit breakers, one per dependency
    let store_breaker = Arc::new(CircuitBreaker::primary_store(clock.clone()));
    let cache_breaker = Arc::new(CircuitBreaker::cache(clock.clone()));
    let oracle_breaker = Arc::new(CircuitBreaker::oracle(clock.clone()));
    let upstream_breaker = Arc::new(CircuitBreaker::upstream_stream(clock.clone()));

    // Price oracle (optional)
    let prices: Arc<dyn PriceSource> = match &config.oracle.price_url {
        Some(url) => Arc::new(HttpPriceSource::new(url.clone(), oracle_breaker)),
        None => Arc::new(NullPriceSource),
    };

    // Risk engine + denylist
    let risk = Arc::new(RiskEngine::new(db.clone(), clock.clone()));
    if let Err(e) = risk.refresh_denylist().await {
        warn!(error = %e, "Denylist load failed; continuing with an empty set");
    }

    // Indexer
    let indexer = Indexer::new(
        db.clone(),
        Arc::clone(&cache),
        Arc::clone(&events),
        Arc::clone(&risk),
        Arc::clone(&prices),
        Arc::new(NullBatchFeed),
        config.encryption.salt.clone(),
        clock.clone(),
    );

    // Upstream stream -> ingest channel
    let (ingest_tx, ingest_rx) = mpsc::channel::<UpstreamTransaction>(1024);
    let (upstream, mut stream_status) = UpstreamClient::new(config.upstream.clone(), ingest_tx);

    // Registry
    let registry = WalletRegistry::new(
        db.clone(),
        Arc::clone(&upstream),
        Arc::clone(&indexer),
        config.registry.clone(),
    );

    // Degradation controller
    let degrade = DegradationController::new(
        Some(Arc::clone(&cache)),
        store_breaker,
        cache_breaker,
        Arc::clone(&events),
        PgWriteExecutor::new(db.clone()),
        clock.clone(),
        DegradeConfig::default(),
    );

    // Stream status flows into the degradation board
    {
        let degrade = Arc::clone(&degrade);
        tokio::spawn(async move {
            loop {
                let status = stream_status.borrow_and_update().clone();
                degrade.set_stream_status(status);
                if stream_status.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    // Initial connect through the stream breaker; once up, the client owns
    // its own reconnect schedule.
    {
        let upstream = Arc::clone(&upstream);
        tokio::spawn(async move {
            loop {
                let client = Arc::clone(&upstream);
                match upstream_breaker
                    .execute(|| async move { client.connect().await })
                    .await
                {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(error = %e, "Upstream connect failed, retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }

    // Auto-registration + cache warming
    if config.registry.auto_register || !config.registry.wallets.is_empty() {
        let (registered, warm) = registry.auto_register_and_warm(&cache).await;
        info!(
            registered,
            warmed = warm.success,
            warm_failures = warm.errors.len(),
            "Startup registration pass complete"
        );
    }

    // PnL engine
    let pnl = PnlEngine::new(
        db.clone(),
        Arc::clone(&cache),
        Arc::clone(&events),
        Arc::clone(&prices),
        clock.clone(),
    );

    // Status / metrics API
    let ctx = Arc::new(ApiContext {
        db: db.clone(),
        cache: Arc::clone(&cache),
        degrade: Arc::clone(&degrade),
        started_at: Instant::now(),
    });
    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.server.api_port));
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, ctx).await {
            error!(error = %e, "API server error");
        }
    });

    // Shutdown plumbing
    let (shutdown_tx1, shutdown_rx1) = mpsc::channel::<()>(1);
    let (shutdown_tx2, shutdown_rx2) = mpsc::channel::<()>(1);
    let (shutdown_tx3, shutdown_rx3) = mpsc::channel::<()>(1);
    let (shutdown_tx4, shutdown_rx4) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx1.send(()).await;
        let _ = shutdown_tx2.send(()).await;
        let _ = shutdown_tx3.send(()).await;
        let _ = shutdown_tx4.send(()).await;
    });

    info!("Services wired, processing");

    // Every loop exits on its shutdown signal; the fan-out and queue drain
    // before stopping.
    let _ = tokio::join!(
        Arc::clone(&events).run(shutdown_rx1),
        pnl.run(shutdown_rx2),
        Arc::clone(&degrade).run(shutdown_rx3),
        ingest_loop(Arc::clone(&indexer), ingest_rx, shutdown_rx4),
    );

    upstream.disconnect().await;
    info!("Wallet memory service stopped");
    Ok(())
}

/// Pull validated transactions off the ingest channel into the indexer.
async fn ingest_loop(
    indexer: Arc<Indexer>,
    mut ingest_rx: mpsc::Receiver<UpstreamTransaction>,
    mut shutdown: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            maybe = ingest_rx.recv() => {
                match maybe {
                    Some(tx) => {
                        if let Err(e) = indexer.index(&tx).await {
                            warn!(
                                signature = %tx.signature,
                                wallet = %tx.wallet_address,
                                error = %e,
                                "Indexing failed"
                            );
                        }
                    }
                    None => return,
                }
            }
            _ = shutdown.recv() => {
                // Drain anything already queued, then stop
                while let Ok(tx) = ingest_rx.try_recv() {
                    if let Err(e) = indexer.index(&tx).await {
                        warn!(signature = %tx.signature, error = %e, "Indexing failed during drain");
                    }
                }
                info!("Ingest loop stopped");
                return;
            }
        }
    }
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,walletmem=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
