use shared_models::{Genome, StrategyFamily};

/// Bounded, weighted specification of one tunable parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    /// Importance weight in [0,1]. Higher-importance parameters are mutated
    /// first and perturbed harder.
    pub importance: f64,
}

impl ParamSpec {
    pub fn range(&self) -> f64 {
        self.max - self.min
    }
}

/// Curated range for a known parameter: (min, max, step, importance).
type CuratedRange = (f64, f64, f64, f64);

/// Map a strategy's genome into an ordered list of parameter specs.
///
/// Known families carry curated ranges reflecting domain knowledge: risk
/// parameters (stop-loss, position size) bounded tightly, lookback windows
/// bounded generously. Parameter names missing from the family table fall
/// back to an inferred range of [0.3x, 3x] the current value, so the
/// mutation algorithm never special-cases a missing mapping. Pure function
/// of its inputs.
pub fn map_parameters(family: StrategyFamily, genome: &Genome) -> Vec<ParamSpec> {
    genome
        .iter()
        .map(|(name, &current)| match curated_range(family, name) {
            Some((min, max, step, importance)) => ParamSpec {
                name: name.clone(),
                current: current.clamp(min, max),
                min,
                max,
                step,
                importance,
            },
            None => inferred_spec(name, current),
        })
        .collect()
}

fn curated_range(family: StrategyFamily, name: &str) -> Option<CuratedRange> {
    let table: &[(&str, CuratedRange)] = match family {
        StrategyFamily::Momentum => &[
            ("lookback_period", (5.0, 120.0, 1.0, 0.8)),
            ("momentum_threshold", (0.5, 10.0, 0.1, 0.9)),
            ("volume_multiplier", (1.0, 8.0, 0.25, 0.6)),
            ("stop_loss_pct", (0.5, 8.0, 0.1, 0.9)),
            ("take_profit_pct", (1.0, 25.0, 0.5, 0.7)),
            ("position_size_pct", (1.0, 10.0, 0.5, 0.8)),
            ("cooldown_minutes", (0.0, 120.0, 5.0, 0.4)),
        ],
        StrategyFamily::MeanReversion => &[
            ("lookback_period", (10.0, 240.0, 5.0, 0.8)),
            ("zscore_entry", (1.0, 4.0, 0.1, 0.9)),
            ("zscore_exit", (0.0, 2.0, 0.1, 0.8)),
            ("stop_loss_pct", (0.5, 6.0, 0.1, 0.9)),
            ("take_profit_pct", (0.5, 12.0, 0.25, 0.6)),
            ("position_size_pct", (1.0, 10.0, 0.5, 0.8)),
            ("max_hold_hours", (1.0, 72.0, 1.0, 0.5)),
        ],
        StrategyFamily::Breakout => &[
            ("channel_period", (10.0, 200.0, 5.0, 0.8)),
            ("breakout_multiplier", (1.0, 4.0, 0.1, 0.9)),
            ("atr_period", (5.0, 50.0, 1.0, 0.6)),
            ("volume_confirmation", (1.0, 6.0, 0.25, 0.5)),
            ("stop_loss_pct", (0.5, 10.0, 0.1, 0.9)),
            ("take_profit_pct", (2.0, 30.0, 0.5, 0.7)),
            ("position_size_pct", (1.0, 10.0, 0.5, 0.8)),
        ],
        StrategyFamily::HighFrequency => &[
            ("tick_window", (10.0, 500.0, 10.0, 0.8)),
            ("spread_threshold_bps", (1.0, 50.0, 1.0, 0.9)),
            ("imbalance_ratio", (1.0, 5.0, 0.1, 0.8)),
            ("max_hold_seconds", (5.0, 600.0, 5.0, 0.7)),
            ("stop_loss_pct", (0.1, 2.0, 0.05, 0.9)),
            ("position_size_pct", (0.5, 5.0, 0.25, 0.8)),
        ],
        StrategyFamily::TrendFollowing => &[
            ("fast_ma_period", (5.0, 60.0, 1.0, 0.9)),
            ("slow_ma_period", (20.0, 300.0, 5.0, 0.9)),
            ("trail_atr_multiplier", (1.0, 6.0, 0.25, 0.8)),
            ("trend_strength_min", (0.0, 1.0, 0.05, 0.6)),
            ("stop_loss_pct", (1.0, 12.0, 0.25, 0.8)),
            ("position_size_pct", (1.0, 10.0, 0.5, 0.8)),
        ],
        StrategyFamily::GridTrading => &[
            ("grid_levels", (3.0, 40.0, 1.0, 0.9)),
            ("grid_spacing_pct", (0.2, 5.0, 0.1, 0.9)),
            ("rebalance_threshold_pct", (1.0, 20.0, 0.5, 0.6)),
            ("total_capital_pct", (2.0, 20.0, 1.0, 0.8)),
            ("stop_loss_pct", (2.0, 25.0, 0.5, 0.7)),
        ],
        StrategyFamily::Unknown => &[],
    };

    table
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, range)| *range)
}

/// Fallback for parameter names no curated table covers: [0.3x, 3x] the
/// current value with a mid importance weight. Zero and negative values get
/// a small symmetric range so the spec is never degenerate.
fn inferred_spec(name: &str, current: f64) -> ParamSpec {
    let (min, max) = if current > 0.0 {
        (current * 0.3, current * 3.0)
    } else if current < 0.0 {
        (current * 3.0, current * 0.3)
    } else {
        (-1.0, 1.0)
    };
    let step = (max - min) / 100.0;
    ParamSpec {
        name: name.to_string(),
        current,
        min,
        max,
        step,
        importance: 0.5,
    }
}

/// Snap a value onto the spec's step grid, anchored at the spec minimum.
pub fn snap_to_step(value: f64, spec: &ParamSpec) -> f64 {
    if spec.step <= 0.0 {
        return value.clamp(spec.min, spec.max);
    }
    let steps = ((value - spec.min) / spec.step).round();
    (spec.min + steps * spec.step).clamp(spec.min, spec.max)
}
