use chrono::Utc;
use evolution_engine::{
    api::{create_api_router, ApiState},
    candidates::CandidateGenerator,
    config::{get_config, Config},
    feed::{LiveSystemHealth, RedisCapitalSource, RedisPerformanceFeed},
    fitness,
    health::{create_health_router, HealthChecker},
    lifecycle::LifecycleManager,
    metrics::Metrics,
    persistence::{Database, Persistence},
    scheduler::EvolutionScheduler,
    validation::{HeuristicEstimator, ValidationRunner},
};
use shared_models::error::{EngineError, Result};
use shared_models::PerformanceFeed;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    info!("🧬 Starting Strategy Evolution & Lifecycle Engine");

    // Load and validate configuration
    let config = get_config()?;
    info!("Configuration loaded successfully");

    // Initialize metrics
    let metrics = Metrics::new(config.metrics_port)?;
    info!("Metrics initialized on port {:?}", config.metrics_port);

    // Initialize the durable store (mocked automatically in paper mode)
    let db = Arc::new(Database::new(&config.database_url).await.map_err(|e| {
        EngineError::Config(format!("Strategy store initialization failed: {}", e))
    })?);
    db.ensure_schema().await?;

    // Restore the persisted population; evolution resumes from the highest
    // persisted generation rather than restarting at 1.
    let persistence = Arc::new(Persistence::new(Arc::clone(&db), config.protection_policy()));
    persistence.restore().await?;
    info!(
        generation = persistence.current_generation(),
        strategies = persistence.count().await,
        "strategy population restored"
    );

    // Collaborator adapters
    let feed = Arc::new(RedisPerformanceFeed::new(&config.redis_url)?);
    let capital = Arc::new(RedisCapitalSource::new(&config.redis_url)?);
    let system_health = Arc::new(LiveSystemHealth::new(
        Arc::clone(&persistence),
        &config.redis_url,
    )?);

    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&persistence),
        capital,
        system_health,
        config.lifecycle_config(),
    ));

    let runner = Arc::new(ValidationRunner::new(
        Box::new(HeuristicEstimator),
        config.fitness_goals(),
    ));
    let scheduler = Arc::new(EvolutionScheduler::new(
        Arc::clone(&persistence),
        runner,
        Arc::clone(&lifecycle),
        CandidateGenerator::new(),
        config.scheduler_config(),
    ));

    // Metrics collection cadence, decoupled from evolution execution.
    tokio::spawn(collection_loop(
        config.clone(),
        Arc::clone(&feed) as Arc<dyn PerformanceFeed>,
        Arc::clone(&persistence),
        Arc::clone(&lifecycle),
        Arc::clone(&metrics),
    ));

    // Evolution cadence: trigger scan, then drain under the concurrency cap.
    tokio::spawn(evolution_loop(
        config.clone(),
        Arc::clone(&scheduler),
        Arc::clone(&metrics),
    ));

    // HTTP surface: engine API plus health/readiness.
    let redis_client = redis::Client::open(config.redis_url.clone())
        .map_err(|e| EngineError::Redis(format!("Failed to create Redis client: {}", e)))?;
    let health_checker = Arc::new(HealthChecker::new(redis_client, Arc::clone(&persistence)));
    let app = create_api_router(ApiState {
        persistence: Arc::clone(&persistence),
        scheduler,
        lifecycle,
    })
    .merge(create_health_router(health_checker));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.api_port))
        .await
        .map_err(|e| EngineError::Network(format!("Failed to bind API server: {}", e)))?;
    info!("Engine API listening on http://0.0.0.0:{}", config.api_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| EngineError::Network(format!("API server failed: {}", e)))?;

    // Final population snapshot so a restart resumes from known-good state.
    info!("Shutdown requested, writing final snapshot");
    if let Err(e) = persistence.snapshot("shutdown").await {
        error!("Final snapshot failed: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install shutdown handler: {}", e);
    }
}

/// Periodic read path: sync active strategies from the accounting
/// subsystem, refresh their performance snapshots, re-run lifecycle
/// transition checks. Never mutates genomes.
async fn collection_loop(
    config: Config,
    feed: Arc<dyn PerformanceFeed>,
    persistence: Arc<Persistence>,
    lifecycle: Arc<LifecycleManager>,
    metrics: Arc<Metrics>,
) {
    let goals = config.fitness_goals();
    let mut ticker = tokio::time::interval(Duration::from_secs(config.metrics_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match feed.active_strategies().await {
            Ok(actives) => {
                for strategy in actives {
                    if persistence.get(&strategy.id).await.is_ok() {
                        continue;
                    }
                    let id = strategy.id.clone();
                    if let Err(e) = persistence.register(strategy).await {
                        warn!(strategy_id = %id, error = %e, "failed to register strategy");
                    } else {
                        info!(strategy_id = %id, "new strategy registered from feed");
                    }
                }
            }
            Err(e) => warn!(error = %e, "active strategy sync failed"),
        }

        for strategy in persistence.all().await {
            if strategy.is_retired() {
                continue;
            }
            match feed
                .recent_metrics(&strategy.id, config.metrics_window_hours)
                .await
            {
                Ok(bundle) => {
                    let report = fitness::evaluate(&bundle, &goals);
                    let score = fitness::to_display_score(report.fitness);
                    if let Err(e) = persistence.update_metrics(&strategy.id, &bundle, score).await
                    {
                        warn!(strategy_id = %strategy.id, error = %e, "metrics update failed");
                    }
                }
                Err(EngineError::InsufficientData(reason)) => {
                    debug!(strategy_id = %strategy.id, %reason, "no recent metrics");
                }
                Err(e) => warn!(strategy_id = %strategy.id, error = %e, "metrics fetch failed"),
            }
        }

        if let Err(e) = lifecycle.pass(Utc::now()).await {
            warn!(error = %e, "lifecycle pass failed");
        }

        metrics.update_population(&persistence.all().await);
    }
}

async fn evolution_loop(config: Config, scheduler: Arc<EvolutionScheduler>, metrics: Arc<Metrics>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.evolution_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let queued = scheduler.check_and_enqueue().await;
        metrics.set_queue_depth(scheduler.queue_depth());
        if queued == 0 && scheduler.queue_depth() == 0 {
            continue;
        }

        let started = std::time::Instant::now();
        let results = scheduler.tick().await;
        metrics.observe_evolution_tick(started.elapsed().as_secs_f64());
        metrics.record_results(&results);
        metrics.set_queue_depth(scheduler.queue_depth());

        let applied = results
            .iter()
            .filter(|r| r.outcome == shared_models::TaskOutcome::Applied)
            .count();
        info!(
            ran = results.len(),
            applied,
            "evolution sweep complete"
        );
    }
}
