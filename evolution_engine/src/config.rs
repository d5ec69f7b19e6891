use serde::Deserialize;
use shared_models::error::{EngineError, Result};
use std::env;

use crate::fitness::FitnessGoals;
use crate::lifecycle::LifecycleConfig;
use crate::persistence::ProtectionPolicy;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub api_port: u16,
    pub metrics_port: Option<u16>,

    // Cadences
    pub metrics_interval_secs: u64,
    pub evolution_interval_secs: u64,
    pub metrics_window_hours: u32,

    // Fitness goal vector
    pub target_score: f64,
    pub target_win_rate: f64,
    pub target_return: f64,
    pub target_hold_hours: f64,

    // Scheduler
    pub urgent_fitness_threshold: f64,
    pub routine_fitness_threshold: f64,
    pub refresh_interval_hours: f64,
    pub evolution_cooldown_hours: f64,
    pub min_improvement: f64,
    pub min_confidence: f64,
    pub max_concurrent_evolutions: usize,

    // Lifecycle
    pub sim_init_dwell_hours: f64,
    pub real_env_dwell_hours: f64,
    pub small_real_dwell_hours: f64,
    pub full_real_dwell_hours: f64,
    pub real_env_entry_score: f64,
    pub small_real_entry_score: f64,
    pub full_real_entry_score: f64,
    pub elite_entry_score: f64,
    pub small_real_capital_ratio: f64,
    pub full_real_capital_ratio: f64,
    pub elite_capital_ratio: f64,
    pub retirement_score: f64,
    pub promotion_requires_realized_pnl: bool,

    // Protection
    pub protected_score_threshold: f64,
    pub elite_score_threshold: f64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL")?,
            api_port: env_or("API_PORT", 8090),
            metrics_port: env::var("METRICS_PORT").ok().and_then(|p| p.parse().ok()),
            metrics_interval_secs: env_or("METRICS_INTERVAL_SECS", 60),
            evolution_interval_secs: env_or("EVOLUTION_INTERVAL_SECS", 300),
            metrics_window_hours: env_or("METRICS_WINDOW_HOURS", 24),
            target_score: env_or("TARGET_SCORE", 80.0),
            target_win_rate: env_or("TARGET_WIN_RATE", 0.6),
            target_return: env_or("TARGET_RETURN", 0.1),
            target_hold_hours: env_or("TARGET_HOLD_HOURS", 24.0),
            urgent_fitness_threshold: env_or("URGENT_FITNESS_THRESHOLD", 0.3),
            routine_fitness_threshold: env_or("ROUTINE_FITNESS_THRESHOLD", 0.6),
            refresh_interval_hours: env_or("REFRESH_INTERVAL_HOURS", 72.0),
            evolution_cooldown_hours: env_or("EVOLUTION_COOLDOWN_HOURS", 6.0),
            min_improvement: env_or("MIN_IMPROVEMENT", 0.02),
            min_confidence: env_or("MIN_CONFIDENCE", 0.5),
            max_concurrent_evolutions: env_or("MAX_CONCURRENT_EVOLUTIONS", 3),
            sim_init_dwell_hours: env_or("SIM_INIT_DWELL_HOURS", 24.0),
            real_env_dwell_hours: env_or("REAL_ENV_DWELL_HOURS", 72.0),
            small_real_dwell_hours: env_or("SMALL_REAL_DWELL_HOURS", 168.0),
            full_real_dwell_hours: env_or("FULL_REAL_DWELL_HOURS", 720.0),
            real_env_entry_score: env_or("REAL_ENV_ENTRY_SCORE", 50.0),
            small_real_entry_score: env_or("SMALL_REAL_ENTRY_SCORE", 65.0),
            full_real_entry_score: env_or("FULL_REAL_ENTRY_SCORE", 70.0),
            elite_entry_score: env_or("ELITE_ENTRY_SCORE", 80.0),
            small_real_capital_ratio: env_or("SMALL_REAL_CAPITAL_RATIO", 0.05),
            full_real_capital_ratio: env_or("FULL_REAL_CAPITAL_RATIO", 0.20),
            elite_capital_ratio: env_or("ELITE_CAPITAL_RATIO", 0.30),
            retirement_score: env_or("RETIREMENT_SCORE", 35.0),
            promotion_requires_realized_pnl: env_or("PROMOTION_REQUIRES_REALIZED_PNL", true),
            protected_score_threshold: env_or("PROTECTED_SCORE_THRESHOLD", 50.0),
            elite_score_threshold: env_or("ELITE_SCORE_THRESHOLD", 60.0),
        })
    }

    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    pub fn validate(self) -> Result<Self> {
        macro_rules! ensure {
            ($cond:expr, $msg:literal) => {
                if !$cond {
                    return Err(EngineError::Config($msg.into()));
                }
            };
        }

        ensure!(!self.database_url.is_empty(), "database_url missing");
        ensure!(!self.redis_url.is_empty(), "redis_url missing");
        ensure!(
            self.urgent_fitness_threshold < self.routine_fitness_threshold,
            "urgent threshold must be below routine threshold"
        );
        ensure!(
            self.routine_fitness_threshold <= 1.0,
            "routine threshold must be a [0,1] fitness"
        );
        ensure!(self.min_improvement > 0.0, "min_improvement must be > 0");
        ensure!(
            self.min_confidence > 0.0 && self.min_confidence <= 1.0,
            "min_confidence must be in (0,1]"
        );
        ensure!(
            self.max_concurrent_evolutions > 0,
            "max_concurrent_evolutions must be > 0"
        );
        ensure!(
            self.evolution_cooldown_hours >= 0.0,
            "cooldown must be non-negative"
        );
        ensure!(
            self.retirement_score < self.real_env_entry_score,
            "retirement score must sit below the first promotion bar"
        );
        ensure!(
            self.small_real_capital_ratio <= self.full_real_capital_ratio
                && self.full_real_capital_ratio <= self.elite_capital_ratio,
            "capital ratios must be non-decreasing across tiers"
        );
        ensure!(
            self.protected_score_threshold <= self.elite_score_threshold,
            "protected threshold must not exceed elite threshold"
        );

        if let Some(port) = self.metrics_port {
            ensure!(port > 1024, "metrics_port must be > 1024");
        }

        Ok(self)
    }

    pub fn fitness_goals(&self) -> FitnessGoals {
        FitnessGoals {
            target_score: self.target_score,
            target_win_rate: self.target_win_rate,
            target_return: self.target_return,
            target_hold_hours: self.target_hold_hours,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            urgent_fitness: self.urgent_fitness_threshold,
            routine_fitness: self.routine_fitness_threshold,
            refresh_interval_hours: self.refresh_interval_hours,
            cooldown_hours: self.evolution_cooldown_hours,
            min_improvement: self.min_improvement,
            min_confidence: self.min_confidence,
            max_concurrent: self.max_concurrent_evolutions,
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            sim_init_dwell_hours: self.sim_init_dwell_hours,
            real_env_dwell_hours: self.real_env_dwell_hours,
            small_real_dwell_hours: self.small_real_dwell_hours,
            full_real_dwell_hours: self.full_real_dwell_hours,
            real_env_entry_score: self.real_env_entry_score,
            small_real_entry_score: self.small_real_entry_score,
            full_real_entry_score: self.full_real_entry_score,
            elite_entry_score: self.elite_entry_score,
            small_real_capital_ratio: self.small_real_capital_ratio,
            full_real_capital_ratio: self.full_real_capital_ratio,
            elite_capital_ratio: self.elite_capital_ratio,
            retirement_score: self.retirement_score,
            promotion_requires_realized_pnl: self.promotion_requires_realized_pnl,
        }
    }

    pub fn protection_policy(&self) -> ProtectionPolicy {
        ProtectionPolicy {
            protected_score: self.protected_score_threshold,
            elite_score: self.elite_score_threshold,
        }
    }
}

use once_cell::sync::OnceCell;

static CONFIG_CELL: OnceCell<Config> = OnceCell::new();

pub fn get_config() -> Result<&'static Config> {
    CONFIG_CELL.get_or_try_init(|| {
        Config::from_env()
            .map_err(|e| EngineError::Config(format!("Environment variable error: {}", e)))
            .and_then(|config| config.validate())
    })
}
