use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared_models::error::{EngineError, Result};
use shared_models::{Genome, MetricsBundle, Strategy, ValidationRecord};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::debug;

use crate::fitness::{self, FitnessGoals};
use crate::param_mapper::ParamSpec;

/// Produces a predicted metrics bundle for a candidate genome without
/// committing capital. Implementations must be deterministic for identical
/// inputs; tests inject a fixed estimator.
pub trait Estimator: Send + Sync {
    fn predict(
        &self,
        current: &MetricsBundle,
        candidate: &Genome,
        distance: f64,
    ) -> MetricsBundle;
}

/// Fast estimator used in production: extrapolates from the strategy's
/// current bundle, damped by genome distance, with a hash-seeded jitter so
/// identical inputs always produce identical outputs.
pub struct HeuristicEstimator;

impl Estimator for HeuristicEstimator {
    fn predict(
        &self,
        current: &MetricsBundle,
        candidate: &Genome,
        distance: f64,
    ) -> MetricsBundle {
        let mut rng = StdRng::seed_from_u64(genome_seed(candidate));

        // A nearby candidate behaves like the deployed genome; a distant one
        // may land anywhere in a widening band around it.
        let band = 0.05 + 0.25 * distance;
        let drift = |rng: &mut StdRng| 1.0 + rng.gen_range(-band..=band);

        MetricsBundle {
            score: (current.score.max(10.0) * drift(&mut rng)).clamp(0.0, 100.0),
            win_rate: (current.win_rate * drift(&mut rng)).clamp(0.0, 1.0),
            total_return: current.total_return * drift(&mut rng),
            avg_hold_time_hours: (current.avg_hold_time_hours * drift(&mut rng)).max(0.1),
            trade_count: current.trade_count,
            profit_factor: (current.profit_factor * drift(&mut rng)).max(0.0),
            max_drawdown: (current.max_drawdown * drift(&mut rng)).clamp(0.0, 1.0),
            sharpe_ratio: current.sharpe_ratio * drift(&mut rng),
            realized_pnl_usd: current.realized_pnl_usd,
        }
    }
}

fn genome_seed(genome: &Genome) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (name, value) in genome {
        name.hash(&mut hasher);
        value.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

/// Evidence needed before the runner trusts a prediction fully.
const FULL_EVIDENCE_TRADES: f64 = 50.0;

pub struct ValidationRunner {
    estimator: Box<dyn Estimator>,
    goals: FitnessGoals,
}

impl ValidationRunner {
    pub fn new(estimator: Box<dyn Estimator>, goals: FitnessGoals) -> Self {
        Self { estimator, goals }
    }

    /// Score one candidate genome via a lightweight simulated trial.
    ///
    /// Confidence rises with the strategy's historical trade evidence and
    /// falls with the candidate's distance from the deployed genome. A
    /// strategy with no trade history and no score evidence cannot be
    /// estimated at all and is rejected outright.
    pub async fn validate(
        &self,
        strategy: &Strategy,
        candidate: &Genome,
        specs: &[ParamSpec],
    ) -> Result<ValidationRecord> {
        if strategy.trade_count == 0 && strategy.fitness_score <= 0.0 {
            return Err(EngineError::InsufficientData(format!(
                "strategy {} has no trade history to estimate from",
                strategy.id
            )));
        }

        let current = MetricsBundle::from_strategy(strategy);
        let distance = genome_distance(&strategy.params, candidate, specs);
        let predicted = self.estimator.predict(&current, candidate, distance);
        let report = fitness::evaluate(&predicted, &self.goals);

        let evidence = (strategy.trade_count as f64 / FULL_EVIDENCE_TRADES).min(1.0);
        let confidence = ((0.3 + 0.7 * evidence) * (1.0 - 0.5 * distance)).clamp(0.0, 1.0);

        let record = ValidationRecord {
            strategy_id: strategy.id.clone(),
            params: candidate.clone(),
            predicted_score: predicted.score,
            predicted_win_rate: predicted.win_rate,
            predicted_return: predicted.total_return,
            predicted_drawdown: predicted.max_drawdown,
            predicted_fitness: report.fitness,
            confidence,
            accepted: false,
        };

        debug!(
            strategy_id = %strategy.id,
            predicted_fitness = record.predicted_fitness,
            confidence = record.confidence,
            distance,
            "validation trial complete"
        );

        Ok(record)
    }
}

/// Normalized distance between two genomes over the mapped parameter space:
/// per-parameter deltas scaled by the spec range, root-mean-squared into
/// [0,1].
pub fn genome_distance(deployed: &Genome, candidate: &Genome, specs: &[ParamSpec]) -> f64 {
    if specs.is_empty() {
        return 0.0;
    }
    let mut sum_sq = 0.0;
    for spec in specs {
        let range = spec.range();
        if range <= 0.0 {
            continue;
        }
        let old = deployed.get(&spec.name).copied().unwrap_or(spec.current);
        let new = candidate.get(&spec.name).copied().unwrap_or(old);
        let delta = ((new - old) / range).clamp(-1.0, 1.0);
        sum_sq += delta * delta;
    }
    (sum_sq / specs.len() as f64).sqrt()
}
