use axum::extract::{Path, Query, State};
use axum::{http::StatusCode, response::Json, routing::get, routing::post, Router};
use serde::Deserialize;
use shared_models::error::EngineError;
use shared_models::{EvolutionResult, LifecycleInfo, StrategyBrief, SystemSummary};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::history::{self, HistoryPage};
use crate::lifecycle::LifecycleManager;
use crate::persistence::Persistence;
use crate::scheduler::EvolutionScheduler;

/// Strategies shown in the system summary's leaderboard.
const SUMMARY_TOP_N: usize = 5;

#[derive(Clone)]
pub struct ApiState {
    pub persistence: Arc<Persistence>,
    pub scheduler: Arc<EvolutionScheduler>,
    pub lifecycle: Arc<LifecycleManager>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    20
}

/// Forced evolution trigger. Bypasses the cooldown; the body always carries
/// an EvolutionResult, failures included.
pub async fn evolve_handler(
    State(state): State<ApiState>,
    Path(strategy_id): Path<String>,
) -> Json<EvolutionResult> {
    Json(state.scheduler.evolve_now(&strategy_id).await)
}

pub async fn lifecycle_handler(
    State(state): State<ApiState>,
    Path(strategy_id): Path<String>,
) -> std::result::Result<Json<LifecycleInfo>, StatusCode> {
    match state.lifecycle.lifecycle_info(&strategy_id).await {
        Ok(info) => Ok(Json(info)),
        Err(EngineError::StrategyNotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn history_handler(
    State(state): State<ApiState>,
    Path(strategy_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> std::result::Result<Json<HistoryPage>, StatusCode> {
    match history::get_evolution_history(
        &state.persistence,
        &strategy_id,
        query.page,
        query.page_size,
    )
    .await
    {
        Ok(page) => Ok(Json(page)),
        Err(EngineError::StrategyNotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn summary_handler(State(state): State<ApiState>) -> Json<SystemSummary> {
    Json(system_summary(&state.persistence).await)
}

/// Operator-facing rollup: strategy counts per tier, the fitness
/// leaderboard, capital utilization and store health.
pub async fn system_summary(persistence: &Arc<Persistence>) -> SystemSummary {
    let strategies = persistence.all().await;

    let mut status_counts: BTreeMap<String, u32> = BTreeMap::new();
    for s in &strategies {
        *status_counts.entry(s.status.as_str().to_string()).or_insert(0) += 1;
    }

    let mut ranked: Vec<&shared_models::Strategy> =
        strategies.iter().filter(|s| !s.is_retired()).collect();
    ranked.sort_by(|a, b| {
        b.fitness_score
            .partial_cmp(&a.fitness_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let top_strategies: Vec<StrategyBrief> = ranked
        .into_iter()
        .take(SUMMARY_TOP_N)
        .map(|s| StrategyBrief {
            id: s.id.clone(),
            name: s.name.clone(),
            family: s.family,
            status: s.status,
            fitness_score: s.fitness_score,
            capital_allocation: s.capital_allocation,
        })
        .collect();

    let average_capital_utilization = strategies.iter().map(|s| s.capital_allocation).sum();

    SystemSummary {
        status_counts,
        top_strategies,
        average_capital_utilization,
        store_healthy: persistence.store_healthy(),
    }
}

pub fn create_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/evolve/:strategy_id", post(evolve_handler))
        .route("/lifecycle/:strategy_id", get(lifecycle_handler))
        .route("/history/:strategy_id", get(history_handler))
        .route("/summary", get(summary_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::CandidateGenerator;
    use crate::fitness::FitnessGoals;
    use crate::lifecycle::LifecycleConfig;
    use crate::persistence::{Database, ProtectionPolicy};
    use crate::scheduler::SchedulerConfig;
    use crate::validation::{Estimator, ValidationRunner};
    use async_trait::async_trait;
    use shared_models::error::Result;
    use shared_models::{
        CapitalSource, Genome, LifecycleStatus, MetricsBundle, Position, Strategy, StrategyFamily,
        SystemHealth, TaskOutcome,
    };

    struct StubCapital;

    #[async_trait]
    impl CapitalSource for StubCapital {
        async fn current_balance(&self) -> Result<f64> {
            Ok(1_000.0)
        }
        async fn positions(&self) -> Result<Vec<Position>> {
            Ok(Vec::new())
        }
    }

    struct StubHealth;

    #[async_trait]
    impl SystemHealth for StubHealth {
        async fn db_reachable(&self) -> bool {
            true
        }
        async fn balance_api_reachable(&self) -> bool {
            true
        }
    }

    struct EchoEstimator;

    impl Estimator for EchoEstimator {
        fn predict(&self, current: &MetricsBundle, _: &Genome, _: f64) -> MetricsBundle {
            current.clone()
        }
    }

    async fn api_state(strategies: Vec<Strategy>) -> ApiState {
        let persistence = Arc::new(Persistence::new(
            Arc::new(Database::mock()),
            ProtectionPolicy::default(),
        ));
        for s in strategies {
            persistence.register(s).await.unwrap();
        }
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&persistence),
            Arc::new(StubCapital),
            Arc::new(StubHealth),
            LifecycleConfig::default(),
        ));
        let runner = Arc::new(ValidationRunner::new(
            Box::new(EchoEstimator),
            FitnessGoals::default(),
        ));
        let scheduler = Arc::new(EvolutionScheduler::new(
            Arc::clone(&persistence),
            runner,
            Arc::clone(&lifecycle),
            CandidateGenerator::with_seed(1),
            SchedulerConfig::default(),
        ));
        ApiState {
            persistence,
            scheduler,
            lifecycle,
        }
    }

    fn strategy(id: &str, score: f64, status: LifecycleStatus) -> Strategy {
        let mut s = Strategy::new(id, id, "SOL", StrategyFamily::Momentum, Genome::new());
        s.fitness_score = score;
        s.status = status;
        s
    }

    #[tokio::test]
    async fn summary_counts_tiers_and_ranks_live_strategies() {
        let state = api_state(vec![
            strategy("a", 80.0, LifecycleStatus::EliteOptimization),
            strategy("b", 55.0, LifecycleStatus::SmallRealTrading),
            strategy("c", 90.0, LifecycleStatus::Retired),
            strategy("d", 40.0, LifecycleStatus::SimulationInit),
        ])
        .await;

        let summary = system_summary(&state.persistence).await;
        assert_eq!(summary.status_counts.get("retired"), Some(&1));
        assert_eq!(summary.status_counts.get("simulation_init"), Some(&1));
        // The retired strategy never makes the leaderboard.
        assert_eq!(summary.top_strategies.len(), 3);
        assert_eq!(summary.top_strategies[0].id, "a");
        assert!(summary.store_healthy);
    }

    #[tokio::test]
    async fn lifecycle_endpoint_maps_missing_strategy_to_404() {
        let state = api_state(vec![]).await;
        let err = lifecycle_handler(State(state), Path("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lifecycle_endpoint_returns_info() {
        let state = api_state(vec![strategy("a", 55.0, LifecycleStatus::SmallRealTrading)]).await;
        let info = lifecycle_handler(State(state), Path("a".into()))
            .await
            .unwrap();
        assert_eq!(info.status, LifecycleStatus::SmallRealTrading);
    }

    #[tokio::test]
    async fn evolve_endpoint_never_errors() {
        let state = api_state(vec![]).await;
        let result = evolve_handler(State(state), Path("ghost".into())).await;
        assert!(!result.success);
        assert_eq!(result.outcome, TaskOutcome::Failed);
    }

    #[tokio::test]
    async fn history_endpoint_pages() {
        let state = api_state(vec![strategy("a", 55.0, LifecycleStatus::SimulationInit)]).await;
        let page = history_handler(
            State(state.clone()),
            Path("a".into()),
            Query(HistoryQuery {
                page: 0,
                page_size: 10,
            }),
        )
        .await
        .unwrap();
        assert_eq!(page.total_events, 0);

        let err = history_handler(
            State(state),
            Path("ghost".into()),
            Query(HistoryQuery {
                page: 0,
                page_size: 10,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);
    }
}
