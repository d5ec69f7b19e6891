use serde::{Deserialize, Serialize};
use shared_models::MetricsBundle;

/// Fixed target-goal vector the evaluator normalizes against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessGoals {
    /// Target composite score on the 0-100 display scale.
    pub target_score: f64,
    pub target_win_rate: f64,
    pub target_return: f64,
    pub target_hold_hours: f64,
}

impl Default for FitnessGoals {
    fn default() -> Self {
        Self {
            target_score: 80.0,
            target_win_rate: 0.6,
            target_return: 0.1,
            target_hold_hours: 24.0,
        }
    }
}

/// Per-objective sub-scores, each already capped at 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitnessComponents {
    pub score: f64,
    pub win_rate: f64,
    pub total_return: f64,
    pub hold_time: f64,
    pub trade_adequacy: f64,
    pub profit_factor: f64,
    pub drawdown_control: f64,
    pub sharpe: f64,
    pub balance_bonus: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitnessReport {
    /// Scalar fitness in [0,1].
    pub fitness: f64,
    pub components: FitnessComponents,
}

// Objective weights. Together with the bonus these reward balanced
// excellence over single-metric overfitting.
const W_SCORE: f64 = 0.25;
const W_WIN_RATE: f64 = 0.25;
const W_RETURN: f64 = 0.15;
const W_HOLD_TIME: f64 = 0.10;
const W_TRADE_COUNT: f64 = 0.05;
const W_PROFIT_FACTOR: f64 = 0.10;
const W_DRAWDOWN: f64 = 0.05;
const W_SHARPE: f64 = 0.05;

const ADEQUATE_TRADE_COUNT: f64 = 30.0;
const TARGET_PROFIT_FACTOR: f64 = 2.0;
const ACCEPTABLE_DRAWDOWN: f64 = 0.20;
const TARGET_SHARPE: f64 = 1.5;

// Stretch thresholds for the balanced-excellence bonus.
const STRETCH_WIN_RATE: f64 = 0.8;
const STRETCH_RETURN: f64 = 0.2;
const STRETCH_DRAWDOWN: f64 = 0.05;
const STRETCH_SHARPE: f64 = 1.5;
const BONUS_PER_STRETCH: f64 = 0.05;

fn ratio(observed: f64, target: f64) -> f64 {
    if target <= 0.0 {
        return 0.0;
    }
    (observed / target).clamp(0.0, 1.0)
}

/// Convert an observed metrics bundle into scalar fitness in [0,1] plus the
/// per-objective component scores. Deterministic: identical inputs always
/// produce identical outputs.
pub fn evaluate(metrics: &MetricsBundle, goals: &FitnessGoals) -> FitnessReport {
    let score = ratio(metrics.score, goals.target_score);
    let win_rate = ratio(metrics.win_rate, goals.target_win_rate);
    let total_return = ratio(metrics.total_return, goals.target_return);

    // Hold time is inverted: shorter is better. No observed hold time means
    // no evidence, which scores zero rather than a free pass.
    let hold_time = if metrics.avg_hold_time_hours > 0.0 {
        (goals.target_hold_hours / metrics.avg_hold_time_hours).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let trade_adequacy = ratio(metrics.trade_count as f64, ADEQUATE_TRADE_COUNT);
    let profit_factor = ratio(metrics.profit_factor, TARGET_PROFIT_FACTOR);
    let drawdown_control = (1.0 - metrics.max_drawdown / ACCEPTABLE_DRAWDOWN).clamp(0.0, 1.0);
    let sharpe = ratio(metrics.sharpe_ratio, TARGET_SHARPE);

    let weighted = W_SCORE * score
        + W_WIN_RATE * win_rate
        + W_RETURN * total_return
        + W_HOLD_TIME * hold_time
        + W_TRADE_COUNT * trade_adequacy
        + W_PROFIT_FACTOR * profit_factor
        + W_DRAWDOWN * drawdown_control
        + W_SHARPE * sharpe;

    let mut balance_bonus = 0.0;
    if metrics.win_rate >= STRETCH_WIN_RATE {
        balance_bonus += BONUS_PER_STRETCH;
    }
    if metrics.total_return >= STRETCH_RETURN {
        balance_bonus += BONUS_PER_STRETCH;
    }
    if metrics.max_drawdown <= STRETCH_DRAWDOWN {
        balance_bonus += BONUS_PER_STRETCH;
    }
    if metrics.sharpe_ratio >= STRETCH_SHARPE {
        balance_bonus += BONUS_PER_STRETCH;
    }

    FitnessReport {
        fitness: (weighted + balance_bonus).clamp(0.0, 1.0),
        components: FitnessComponents {
            score,
            win_rate,
            total_return,
            hold_time,
            trade_adequacy,
            profit_factor,
            drawdown_control,
            sharpe,
            balance_bonus,
        },
    }
}

/// The registry stores fitness on the 0-100 display scale.
pub fn to_display_score(fitness: f64) -> f64 {
    fitness * 100.0
}

pub fn from_display_score(score: f64) -> f64 {
    (score / 100.0).clamp(0.0, 1.0)
}
