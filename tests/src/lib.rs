//! Mock collaborators for exercising the evolution engine end-to-end
//! without Redis or PostgreSQL.

use async_trait::async_trait;
use evolution_engine::validation::Estimator;
use shared_models::error::{EngineError, Result};
use shared_models::{
    CapitalSource, Genome, MetricsBundle, PerformanceFeed, Position, Strategy, SystemHealth,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// In-memory stand-in for the accounting subsystem's published feed.
#[derive(Default)]
pub struct MockFeed {
    strategies: Mutex<Vec<Strategy>>,
    metrics: Mutex<HashMap<String, MetricsBundle>>,
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_strategy(&self, strategy: Strategy) {
        self.strategies.lock().unwrap().push(strategy);
    }

    pub fn publish_metrics(&self, strategy_id: &str, bundle: MetricsBundle) {
        self.metrics
            .lock()
            .unwrap()
            .insert(strategy_id.to_string(), bundle);
    }
}

#[async_trait]
impl PerformanceFeed for MockFeed {
    async fn active_strategies(&self) -> Result<Vec<Strategy>> {
        Ok(self.strategies.lock().unwrap().clone())
    }

    async fn recent_metrics(&self, strategy_id: &str, _window_hours: u32) -> Result<MetricsBundle> {
        self.metrics
            .lock()
            .unwrap()
            .get(strategy_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::InsufficientData(format!(
                    "no published metrics for strategy {}",
                    strategy_id
                ))
            })
    }
}

pub struct MockCapital {
    pub balance: f64,
}

#[async_trait]
impl CapitalSource for MockCapital {
    async fn current_balance(&self) -> Result<f64> {
        Ok(self.balance)
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        Ok(Vec::new())
    }
}

pub struct MockHealth {
    db_up: AtomicBool,
    balance_api_up: AtomicBool,
}

impl MockHealth {
    pub fn up() -> Self {
        Self {
            db_up: AtomicBool::new(true),
            balance_api_up: AtomicBool::new(true),
        }
    }

    pub fn set_balance_api_up(&self, up: bool) {
        self.balance_api_up.store(up, Ordering::SeqCst);
    }

    pub fn set_db_up(&self, up: bool) {
        self.db_up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl SystemHealth for MockHealth {
    async fn db_reachable(&self) -> bool {
        self.db_up.load(Ordering::SeqCst)
    }

    async fn balance_api_reachable(&self) -> bool {
        self.balance_api_up.load(Ordering::SeqCst)
    }
}

/// Estimator that always predicts the same bundle, pinning predicted
/// fitness for deterministic assertions.
pub struct FixedEstimator(pub MetricsBundle);

impl Estimator for FixedEstimator {
    fn predict(&self, _: &MetricsBundle, _: &Genome, _: f64) -> MetricsBundle {
        self.0.clone()
    }
}

pub fn momentum_genome() -> Genome {
    [
        ("lookback_period", 20.0),
        ("momentum_threshold", 3.0),
        ("volume_multiplier", 2.0),
        ("stop_loss_pct", 2.0),
        ("take_profit_pct", 8.0),
        ("position_size_pct", 5.0),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), *v))
    .collect()
}

pub fn strong_bundle() -> MetricsBundle {
    MetricsBundle {
        score: 85.0,
        win_rate: 0.82,
        total_return: 0.25,
        avg_hold_time_hours: 8.0,
        trade_count: 80,
        profit_factor: 2.6,
        max_drawdown: 0.04,
        sharpe_ratio: 1.9,
        realized_pnl_usd: 400.0,
    }
}
