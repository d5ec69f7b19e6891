//! End-to-end harness: feed sync, fitness scoring, evolution, lifecycle
//! transitions and restart continuity against mock collaborators.

use chrono::{Duration, Utc};
use evolution_engine::api::system_summary;
use evolution_engine::candidates::CandidateGenerator;
use evolution_engine::fitness::{self, FitnessGoals};
use evolution_engine::lifecycle::{LifecycleConfig, LifecycleManager};
use evolution_engine::persistence::{Database, Persistence, ProtectionPolicy};
use evolution_engine::scheduler::{EvolutionScheduler, SchedulerConfig};
use evolution_engine::validation::ValidationRunner;
use shared_models::{
    LifecycleStatus, PerformanceFeed, ProtectionLevel, Strategy, StrategyFamily, TaskOutcome,
};
use std::sync::Arc;
use tests::{momentum_genome, strong_bundle, FixedEstimator, MockCapital, MockFeed, MockHealth};

struct Harness {
    persistence: Arc<Persistence>,
    lifecycle: Arc<LifecycleManager>,
    scheduler: Arc<EvolutionScheduler>,
    db: Arc<Database>,
    health: Arc<MockHealth>,
}

fn build_harness(db: Arc<Database>) -> Harness {
    let persistence = Arc::new(Persistence::new(
        Arc::clone(&db),
        ProtectionPolicy::default(),
    ));
    let health = Arc::new(MockHealth::up());
    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&persistence),
        Arc::new(MockCapital { balance: 10_000.0 }),
        Arc::clone(&health) as Arc<dyn shared_models::SystemHealth>,
        LifecycleConfig::default(),
    ));
    let runner = Arc::new(ValidationRunner::new(
        Box::new(FixedEstimator(strong_bundle())),
        FitnessGoals::default(),
    ));
    let scheduler = Arc::new(EvolutionScheduler::new(
        Arc::clone(&persistence),
        runner,
        Arc::clone(&lifecycle),
        CandidateGenerator::with_seed(42),
        SchedulerConfig::default(),
    ));
    Harness {
        persistence,
        lifecycle,
        scheduler,
        db,
        health,
    }
}

fn low_fitness_strategy(id: &str) -> Strategy {
    let mut s = Strategy::new(id, id, "SOL", StrategyFamily::Momentum, momentum_genome());
    s.fitness_score = 20.0;
    s.win_rate = 0.4;
    s.trade_count = 60;
    s.profit_factor = 1.1;
    s.max_drawdown = 0.15;
    s.sharpe_ratio = 0.5;
    s.avg_hold_time_hours = 30.0;
    s
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn feed_to_commit_pipeline() {
    let harness = build_harness(Arc::new(Database::mock()));

    // The accounting subsystem publishes a strategy and its metrics.
    let feed = MockFeed::new();
    feed.publish_strategy(low_fitness_strategy("mom-sol-1"));
    feed.publish_metrics("mom-sol-1", strong_bundle());

    // Collection path: sync actives, score the published bundle.
    for strategy in feed.active_strategies().await.unwrap() {
        harness.persistence.register(strategy).await.unwrap();
    }
    let bundle = feed.recent_metrics("mom-sol-1", 24).await.unwrap();
    let report = fitness::evaluate(&bundle, &FitnessGoals::default());
    assert!(report.fitness > 0.0 && report.fitness <= 1.0);

    // Evolution path: the low-fitness strategy queues urgently and applies.
    assert_eq!(harness.scheduler.check_and_enqueue().await, 1);
    let results = harness.scheduler.tick().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, TaskOutcome::Applied);
    assert!(results[0].improvement > 0.0);

    let evolved = harness.persistence.get("mom-sol-1").await.unwrap();
    assert_ne!(evolved.params, momentum_genome());
    assert!(evolved.last_evolved_at.is_some());
    assert_eq!(harness.persistence.event_count("mom-sol-1").await, 1);
    assert!(harness.persistence.current_generation() >= 2);

    // Cooldown: the strategy just evolved, so the next scan skips it.
    assert_eq!(harness.scheduler.check_and_enqueue().await, 0);

    let summary = system_summary(&harness.persistence).await;
    assert_eq!(summary.top_strategies.len(), 1);
    assert!(summary.store_healthy);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_resumes_generation_and_history() {
    let db = Arc::new(Database::mock());

    {
        let harness = build_harness(Arc::clone(&db));
        let mut s = low_fitness_strategy("mom-sol-1");
        s.generation = 7;
        s.cycle = 3;
        harness.persistence.register(s).await.unwrap();
        harness.persistence.restore().await.unwrap();
        harness.scheduler.check_and_enqueue().await;
        let results = harness.scheduler.tick().await;
        assert_eq!(results[0].outcome, TaskOutcome::Applied);
    }

    // Fresh engine over the same durable store: evolution picks up at the
    // highest persisted generation, never back at 1.
    let harness = build_harness(db);
    harness.persistence.restore().await.unwrap();

    assert!(harness.persistence.current_generation() >= 7);
    assert!(harness.persistence.current_cycle() >= 3);
    let restored = harness.persistence.get("mom-sol-1").await.unwrap();
    assert_eq!(restored.generation, 7);
    assert_ne!(restored.params, momentum_genome());
    assert_eq!(harness.persistence.event_count("mom-sol-1").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn promotion_ladder_with_health_gated_allocation() {
    let harness = build_harness(Arc::new(Database::mock()));

    let mut s = low_fitness_strategy("mom-sol-1");
    s.status = LifecycleStatus::SmallRealTrading;
    s.status_entered_at = Utc::now() - Duration::hours(200);
    s.fitness_score = 72.0;
    s.realized_pnl_usd = 55.0;
    s.tier_entry_pnl_usd = 0.0;
    harness.persistence.register(s).await.unwrap();

    // Balance API down: the promotion lands, the capital move waits.
    harness.health.set_balance_api_up(false);
    let promoted = harness
        .lifecycle
        .evaluate("mom-sol-1", Utc::now())
        .await
        .unwrap();
    assert_eq!(promoted, Some(LifecycleStatus::FullRealTrading));
    let s = harness.persistence.get("mom-sol-1").await.unwrap();
    assert_eq!(s.capital_allocation, 0.0);

    // Collaborators recover: the next pass allocates the tier's share.
    harness.health.set_balance_api_up(true);
    assert!(harness.lifecycle.reallocate_capital().await.unwrap());
    let s = harness.persistence.get("mom-sol-1").await.unwrap();
    assert!((s.capital_allocation - 0.20).abs() < 1e-9);

    // The promotion reset the in-tier P&L baseline.
    assert_eq!(s.tier_realized_pnl(), 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_outage_halts_admission_and_surfaces_in_summary() {
    let harness = build_harness(Arc::new(Database::mock()));
    harness
        .persistence
        .register(low_fitness_strategy("mom-sol-1"))
        .await
        .unwrap();

    // A failed durable write flips the store health flag.
    harness.db.set_fail_writes(true);
    assert!(harness
        .persistence
        .update_metrics("mom-sol-1", &strong_bundle(), 50.0)
        .await
        .is_err());
    assert!(!harness.persistence.store_healthy());

    // New admission halts while reads continue.
    assert_eq!(harness.scheduler.check_and_enqueue().await, 0);
    assert!(harness.persistence.get("mom-sol-1").await.is_ok());
    let summary = system_summary(&harness.persistence).await;
    assert!(!summary.store_healthy);

    // Recovery: the next successful write clears the flag and admission
    // resumes.
    harness.db.set_fail_writes(false);
    harness
        .persistence
        .update_metrics("mom-sol-1", &strong_bundle(), 20.0)
        .await
        .unwrap();
    assert!(harness.persistence.store_healthy());
    assert_eq!(harness.scheduler.check_and_enqueue().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn protection_survives_routine_culling_pressure() {
    let harness = build_harness(Arc::new(Database::mock()));

    let mut s = low_fitness_strategy("mom-sol-1");
    s.status = LifecycleStatus::SmallRealTrading;
    s.status_entered_at = Utc::now() - Duration::hours(400);
    harness.persistence.register(s).await.unwrap();

    // A strong run earns elite protection.
    harness
        .persistence
        .update_metrics("mom-sol-1", &strong_bundle(), 85.0)
        .await
        .unwrap();
    let s = harness.persistence.get("mom-sol-1").await.unwrap();
    assert_eq!(s.protection, ProtectionLevel::Elite);

    // Scores collapse for far longer than the retirement window, but the
    // elite floor keeps the strategy out of auto-retirement.
    let mut weak = strong_bundle();
    weak.score = 10.0;
    weak.win_rate = 0.2;
    harness
        .persistence
        .update_metrics("mom-sol-1", &weak, 10.0)
        .await
        .unwrap();

    let now = Utc::now();
    harness.lifecycle.evaluate("mom-sol-1", now).await.unwrap();
    harness
        .lifecycle
        .evaluate("mom-sol-1", now + Duration::hours(1_000))
        .await
        .unwrap();

    let s = harness.persistence.get("mom-sol-1").await.unwrap();
    assert!(!s.is_retired());
    assert_eq!(s.protection, ProtectionLevel::Elite);
}
