use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod error;

/// A strategy's full parameter-name-to-value mapping. Ordered so that
/// serialized genomes and parameter diffs are stable across runs.
pub type Genome = BTreeMap<String, f64>;

// Strategy Taxonomy

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyFamily {
    Momentum,
    MeanReversion,
    Breakout,
    HighFrequency,
    TrendFollowing,
    GridTrading,
    Unknown,
}

impl StrategyFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyFamily::Momentum => "momentum",
            StrategyFamily::MeanReversion => "mean_reversion",
            StrategyFamily::Breakout => "breakout",
            StrategyFamily::HighFrequency => "high_frequency",
            StrategyFamily::TrendFollowing => "trend_following",
            StrategyFamily::GridTrading => "grid_trading",
            StrategyFamily::Unknown => "unknown",
        }
    }

    /// Unknown family strings map to one well-defined fallback arm instead
    /// of scattered per-call conditionals.
    pub fn parse(s: &str) -> Self {
        match s {
            "momentum" => StrategyFamily::Momentum,
            "mean_reversion" | "mean-reversion" => StrategyFamily::MeanReversion,
            "breakout" => StrategyFamily::Breakout,
            "high_frequency" | "high-frequency" => StrategyFamily::HighFrequency,
            "trend_following" | "trend-following" => StrategyFamily::TrendFollowing,
            "grid_trading" | "grid-trading" => StrategyFamily::GridTrading,
            _ => StrategyFamily::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    SimulationInit,
    RealEnvSimulation,
    SmallRealTrading,
    FullRealTrading,
    EliteOptimization,
    Retired,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::SimulationInit => "simulation_init",
            LifecycleStatus::RealEnvSimulation => "real_env_simulation",
            LifecycleStatus::SmallRealTrading => "small_real_trading",
            LifecycleStatus::FullRealTrading => "full_real_trading",
            LifecycleStatus::EliteOptimization => "elite_optimization",
            LifecycleStatus::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simulation_init" => Some(LifecycleStatus::SimulationInit),
            "real_env_simulation" => Some(LifecycleStatus::RealEnvSimulation),
            "small_real_trading" => Some(LifecycleStatus::SmallRealTrading),
            "full_real_trading" => Some(LifecycleStatus::FullRealTrading),
            "elite_optimization" => Some(LifecycleStatus::EliteOptimization),
            "retired" => Some(LifecycleStatus::Retired),
            _ => None,
        }
    }

    /// Tier rank used for transition validation. Retired sits outside the
    /// promotion ladder and is handled explicitly.
    pub fn rank(&self) -> u8 {
        match self {
            LifecycleStatus::SimulationInit => 0,
            LifecycleStatus::RealEnvSimulation => 1,
            LifecycleStatus::SmallRealTrading => 2,
            LifecycleStatus::FullRealTrading => 3,
            LifecycleStatus::EliteOptimization => 4,
            LifecycleStatus::Retired => 5,
        }
    }

    pub fn next_tier(&self) -> Option<LifecycleStatus> {
        match self {
            LifecycleStatus::SimulationInit => Some(LifecycleStatus::RealEnvSimulation),
            LifecycleStatus::RealEnvSimulation => Some(LifecycleStatus::SmallRealTrading),
            LifecycleStatus::SmallRealTrading => Some(LifecycleStatus::FullRealTrading),
            LifecycleStatus::FullRealTrading => Some(LifecycleStatus::EliteOptimization),
            LifecycleStatus::EliteOptimization | LifecycleStatus::Retired => None,
        }
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionLevel {
    #[default]
    None,
    Protected,
    Elite,
}

impl ProtectionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionLevel::None => "none",
            ProtectionLevel::Protected => "protected",
            ProtectionLevel::Elite => "elite",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ProtectionLevel::None),
            "protected" => Some(ProtectionLevel::Protected),
            "elite" => Some(ProtectionLevel::Elite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionMethod {
    Mutation,
    Crossover,
    EliteCarryover,
    Manual,
}

impl EvolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionMethod::Mutation => "mutation",
            EvolutionMethod::Crossover => "crossover",
            EvolutionMethod::EliteCarryover => "elite_carryover",
            EvolutionMethod::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mutation" => Some(EvolutionMethod::Mutation),
            "crossover" => Some(EvolutionMethod::Crossover),
            "elite_carryover" => Some(EvolutionMethod::EliteCarryover),
            "manual" => Some(EvolutionMethod::Manual),
            _ => None,
        }
    }
}

// Central Entity

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub family: StrategyFamily,
    pub params: Genome,

    // Lineage
    pub generation: u32,
    pub cycle: u32,
    pub parent_ids: Vec<String>,
    pub evolution_method: EvolutionMethod,

    // Performance snapshot (fitness_score is on the 0-100 display scale)
    pub fitness_score: f64,
    pub win_rate: f64,
    pub total_return: f64,
    pub trade_count: u32,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub avg_hold_time_hours: f64,
    pub realized_pnl_usd: f64,

    // Lifecycle
    pub status: LifecycleStatus,
    pub protection: ProtectionLevel,
    pub capital_allocation: f64,
    /// Cumulative realized P&L recorded when the current tier was entered.
    /// In-tier P&L is `realized_pnl_usd - tier_entry_pnl_usd`.
    pub tier_entry_pnl_usd: f64,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status_entered_at: DateTime<Utc>,
    pub last_evolved_at: Option<DateTime<Utc>>,
    pub below_retirement_since: Option<DateTime<Utc>>,
}

impl Strategy {
    pub fn new(id: &str, name: &str, symbol: &str, family: StrategyFamily, params: Genome) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            symbol: symbol.to_string(),
            family,
            params,
            generation: 1,
            cycle: 1,
            parent_ids: Vec::new(),
            evolution_method: EvolutionMethod::Manual,
            fitness_score: 0.0,
            win_rate: 0.0,
            total_return: 0.0,
            trade_count: 0,
            profit_factor: 0.0,
            max_drawdown: 0.0,
            sharpe_ratio: 0.0,
            avg_hold_time_hours: 0.0,
            realized_pnl_usd: 0.0,
            status: LifecycleStatus::SimulationInit,
            protection: ProtectionLevel::None,
            capital_allocation: 0.0,
            tier_entry_pnl_usd: 0.0,
            created_at: now,
            updated_at: now,
            status_entered_at: now,
            last_evolved_at: None,
            below_retirement_since: None,
        }
    }

    pub fn dwell_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.status_entered_at).num_seconds() as f64 / 3600.0
    }

    pub fn tier_realized_pnl(&self) -> f64 {
        self.realized_pnl_usd - self.tier_entry_pnl_usd
    }

    pub fn is_retired(&self) -> bool {
        self.status == LifecycleStatus::Retired
    }
}

// Performance Feed Payload

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBundle {
    pub score: f64,
    pub win_rate: f64,
    pub total_return: f64,
    pub avg_hold_time_hours: f64,
    pub trade_count: u32,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub realized_pnl_usd: f64,
}

impl MetricsBundle {
    pub fn from_strategy(s: &Strategy) -> Self {
        Self {
            score: s.fitness_score,
            win_rate: s.win_rate,
            total_return: s.total_return,
            avg_hold_time_hours: s.avg_hold_time_hours,
            trade_count: s.trade_count,
            profit_factor: s.profit_factor,
            max_drawdown: s.max_drawdown,
            sharpe_ratio: s.sharpe_ratio,
            realized_pnl_usd: s.realized_pnl_usd,
        }
    }
}

// History Records

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionEvent {
    pub id: String,
    pub strategy_id: String,
    pub generation: u32,
    pub cycle: u32,
    pub method: EvolutionMethod,
    pub old_params: Genome,
    pub new_params: Genome,
    pub old_fitness: f64,
    pub new_fitness: f64,
    pub improvement: f64,
    pub trigger: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub strategy_id: String,
    pub label: String,
    pub params: Genome,
    pub fitness_score: f64,
    pub metrics: MetricsBundle,
    pub created_at: DateTime<Utc>,
}

/// Result of one validation trial. Ephemeral: logged for traceability but
/// never required to survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub strategy_id: String,
    pub params: Genome,
    pub predicted_score: f64,
    pub predicted_win_rate: f64,
    pub predicted_return: f64,
    pub predicted_drawdown: f64,
    pub predicted_fitness: f64,
    pub confidence: f64,
    pub accepted: bool,
}

// API Surface

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Applied,
    Rejected,
    Failed,
    Cancelled,
}

/// Failure is a first-class return value at the API boundary: a forced
/// evolution that cannot proceed comes back with `success: false` and a
/// human-readable reason rather than an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionResult {
    pub strategy_id: String,
    pub success: bool,
    pub outcome: TaskOutcome,
    pub reason: String,
    pub old_fitness: f64,
    pub new_fitness: f64,
    pub improvement: f64,
}

impl EvolutionResult {
    pub fn failure(strategy_id: &str, outcome: TaskOutcome, reason: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            success: false,
            outcome,
            reason: reason.into(),
            old_fitness: 0.0,
            new_fitness: 0.0,
            improvement: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleInfo {
    pub strategy_id: String,
    pub status: LifecycleStatus,
    pub protection: ProtectionLevel,
    pub allocation_ratio: f64,
    pub dwell_hours: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyBrief {
    pub id: String,
    pub name: String,
    pub family: StrategyFamily,
    pub status: LifecycleStatus,
    pub fitness_score: f64,
    pub capital_allocation: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSummary {
    pub status_counts: BTreeMap<String, u32>,
    pub top_strategies: Vec<StrategyBrief>,
    pub average_capital_utilization: f64,
    /// Cleared when the persistence store stops accepting writes so the
    /// condition is visible to operators without log digging.
    pub store_healthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub strategy_id: String,
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
}

// Collaborator Contracts

use async_trait::async_trait;
use error::Result;

/// Strategy performance feed sourced from the trade-execution/accounting
/// subsystem. Read-only from the engine's point of view.
#[async_trait]
pub trait PerformanceFeed: Send + Sync {
    async fn active_strategies(&self) -> Result<Vec<Strategy>>;
    async fn recent_metrics(&self, strategy_id: &str, window_hours: u32)
        -> Result<MetricsBundle>;
}

#[async_trait]
pub trait CapitalSource: Send + Sync {
    async fn current_balance(&self) -> Result<f64>;
    async fn positions(&self) -> Result<Vec<Position>>;
}

#[async_trait]
pub trait SystemHealth: Send + Sync {
    async fn db_reachable(&self) -> bool;
    async fn balance_api_reachable(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_parse_falls_back_to_unknown() {
        assert_eq!(StrategyFamily::parse("momentum"), StrategyFamily::Momentum);
        assert_eq!(
            StrategyFamily::parse("grid-trading"),
            StrategyFamily::GridTrading
        );
        assert_eq!(
            StrategyFamily::parse("quantum_arb"),
            StrategyFamily::Unknown
        );
    }

    #[test]
    fn status_ladder_is_ordered() {
        let mut s = LifecycleStatus::SimulationInit;
        let mut seen = vec![s];
        while let Some(next) = s.next_tier() {
            assert!(next.rank() == s.rank() + 1);
            seen.push(next);
            s = next;
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(s, LifecycleStatus::EliteOptimization);
        assert!(LifecycleStatus::Retired.next_tier().is_none());
    }

    #[test]
    fn protection_levels_are_ordered() {
        assert!(ProtectionLevel::None < ProtectionLevel::Protected);
        assert!(ProtectionLevel::Protected < ProtectionLevel::Elite);
    }

    #[test]
    fn strategy_roundtrips_through_json() {
        let mut params = Genome::new();
        params.insert("lookback_period".into(), 20.0);
        params.insert("stop_loss_pct".into(), 2.5);
        let s = Strategy::new("s1", "mom-sol-1", "SOL", StrategyFamily::Momentum, params);

        let json = serde_json::to_string(&s).unwrap();
        let back: Strategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "s1");
        assert_eq!(back.family, StrategyFamily::Momentum);
        assert_eq!(back.params.get("lookback_period"), Some(&20.0));
        assert_eq!(back.status, LifecycleStatus::SimulationInit);
    }

    #[test]
    fn tier_pnl_is_relative_to_tier_entry() {
        let mut s = Strategy::new("s1", "n", "SOL", StrategyFamily::Momentum, Genome::new());
        s.realized_pnl_usd = 120.0;
        s.tier_entry_pnl_usd = 100.0;
        assert!((s.tier_realized_pnl() - 20.0).abs() < 1e-9);
    }
}
