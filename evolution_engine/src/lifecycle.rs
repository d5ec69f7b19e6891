use chrono::{DateTime, Utc};
use shared_models::error::Result;
use shared_models::{CapitalSource, LifecycleInfo, LifecycleStatus, ProtectionLevel, SystemHealth};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::persistence::Persistence;

/// Promotion/retirement thresholds. Dwell hours are what a strategy must
/// spend in a tier before leaving it; entry score is what the next tier
/// demands on the 0-100 display scale.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
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
    /// Gate full-real promotion on realized P&L in the small-real tier.
    /// When false the cumulative total is used instead.
    pub promotion_requires_realized_pnl: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sim_init_dwell_hours: 24.0,
            real_env_dwell_hours: 72.0,
            small_real_dwell_hours: 168.0,
            full_real_dwell_hours: 720.0,
            real_env_entry_score: 50.0,
            small_real_entry_score: 65.0,
            full_real_entry_score: 70.0,
            elite_entry_score: 80.0,
            small_real_capital_ratio: 0.05,
            full_real_capital_ratio: 0.20,
            elite_capital_ratio: 0.30,
            retirement_score: 35.0,
            promotion_requires_realized_pnl: true,
        }
    }
}

impl LifecycleConfig {
    pub fn capital_ratio(&self, status: LifecycleStatus) -> f64 {
        match status {
            LifecycleStatus::SimulationInit
            | LifecycleStatus::RealEnvSimulation
            | LifecycleStatus::Retired => 0.0,
            LifecycleStatus::SmallRealTrading => self.small_real_capital_ratio,
            LifecycleStatus::FullRealTrading => self.full_real_capital_ratio,
            LifecycleStatus::EliteOptimization => self.elite_capital_ratio,
        }
    }

    fn min_dwell_hours(&self, status: LifecycleStatus) -> f64 {
        match status {
            LifecycleStatus::SimulationInit => self.sim_init_dwell_hours,
            LifecycleStatus::RealEnvSimulation => self.real_env_dwell_hours,
            LifecycleStatus::SmallRealTrading => self.small_real_dwell_hours,
            LifecycleStatus::FullRealTrading => self.full_real_dwell_hours,
            // Elite dwell is indefinite; retirement windows still need a
            // baseline for the sustained-low-score check.
            LifecycleStatus::EliteOptimization => self.full_real_dwell_hours,
            LifecycleStatus::Retired => 0.0,
        }
    }

    fn entry_score(&self, status: LifecycleStatus) -> f64 {
        match status {
            LifecycleStatus::SimulationInit => 0.0,
            LifecycleStatus::RealEnvSimulation => self.real_env_entry_score,
            LifecycleStatus::SmallRealTrading => self.small_real_entry_score,
            LifecycleStatus::FullRealTrading => self.full_real_entry_score,
            LifecycleStatus::EliteOptimization => self.elite_entry_score,
            LifecycleStatus::Retired => 0.0,
        }
    }
}

/// Tiered promotion/retirement state machine. Evaluated independently per
/// strategy on every fitness update; both the dwell-time gate and the score
/// gate must hold before a promotion is requested from the persistence
/// layer.
pub struct LifecycleManager {
    persistence: Arc<Persistence>,
    capital: Arc<dyn CapitalSource>,
    health: Arc<dyn SystemHealth>,
    cfg: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(
        persistence: Arc<Persistence>,
        capital: Arc<dyn CapitalSource>,
        health: Arc<dyn SystemHealth>,
        cfg: LifecycleConfig,
    ) -> Self {
        Self {
            persistence,
            capital,
            health,
            cfg,
        }
    }

    /// Re-check one strategy's tier eligibility. Returns the new status when
    /// a transition was committed.
    pub async fn evaluate(&self, id: &str, now: DateTime<Utc>) -> Result<Option<LifecycleStatus>> {
        let s = self.persistence.get(id).await?;
        if s.is_retired() {
            return Ok(None);
        }

        if let Some(new_status) = self.retirement_check(&s, now).await? {
            self.reallocate_capital().await?;
            return Ok(Some(new_status));
        }

        let Some(next) = s.status.next_tier() else {
            return Ok(None);
        };

        let dwell_ok = s.dwell_hours(now) >= self.cfg.min_dwell_hours(s.status);
        let score_ok = s.fitness_score >= self.cfg.entry_score(next);
        let pnl_ok = if next == LifecycleStatus::FullRealTrading {
            let pnl = if self.cfg.promotion_requires_realized_pnl {
                s.tier_realized_pnl()
            } else {
                s.realized_pnl_usd
            };
            pnl > 0.0
        } else {
            true
        };

        if !(dwell_ok && score_ok && pnl_ok) {
            debug!(
                strategy_id = %id,
                status = %s.status,
                dwell_ok,
                score_ok,
                pnl_ok,
                "promotion gates not met"
            );
            return Ok(None);
        }

        self.persistence.transition_status(id, next).await?;
        info!(strategy_id = %id, from = %s.status, to = %next, "strategy promoted");
        if let Err(e) = self.persistence.snapshot_strategy(id, "promotion").await {
            warn!(strategy_id = %id, error = %e, "promotion snapshot failed");
        }

        // Health failures defer the capital move, not the promotion itself.
        self.reallocate_capital().await?;
        Ok(Some(next))
    }

    /// Run the transition check over the whole registry.
    pub async fn pass(&self, now: DateTime<Utc>) -> Result<()> {
        for s in self.persistence.all().await {
            if s.is_retired() {
                continue;
            }
            if let Err(e) = self.evaluate(&s.id, now).await {
                warn!(strategy_id = %s.id, error = %e, "lifecycle evaluation failed");
            }
        }
        Ok(())
    }

    /// Retirement requires the score to stay below the threshold for at
    /// least half the tier's dwell minimum. Protection widens the window:
    /// protected strategies get double, elite strategies are never
    /// auto-retired.
    async fn retirement_check(
        &self,
        s: &shared_models::Strategy,
        now: DateTime<Utc>,
    ) -> Result<Option<LifecycleStatus>> {
        if s.fitness_score >= self.cfg.retirement_score {
            if s.below_retirement_since.is_some() {
                self.persistence.update_retirement_watch(&s.id, None).await?;
            }
            return Ok(None);
        }

        if s.protection == ProtectionLevel::Elite {
            return Ok(None);
        }

        let since = match s.below_retirement_since {
            Some(since) => since,
            None => {
                self.persistence
                    .update_retirement_watch(&s.id, Some(now))
                    .await?;
                return Ok(None);
            }
        };

        let mut window_hours = self.cfg.min_dwell_hours(s.status) / 2.0;
        if s.protection == ProtectionLevel::Protected {
            window_hours *= 2.0;
        }

        let below_hours = (now - since).num_seconds() as f64 / 3600.0;
        if below_hours < window_hours {
            return Ok(None);
        }

        self.persistence
            .transition_status(&s.id, LifecycleStatus::Retired)
            .await?;
        info!(
            strategy_id = %s.id,
            score = s.fitness_score,
            below_hours,
            "strategy retired after sustained low score"
        );
        Ok(Some(LifecycleStatus::Retired))
    }

    /// Recompute every strategy's capital share from the full registry.
    /// Never incrementally mutated, so a partial failure cannot leave the
    /// totals drifted. Health checks gate the reallocation only.
    pub async fn reallocate_capital(&self) -> Result<bool> {
        if !self.health.db_reachable().await || !self.health.balance_api_reachable().await {
            warn!("health checks failing, capital reallocation deferred");
            return Ok(false);
        }
        let strategies = self.persistence.all().await;
        if strategies.is_empty() {
            warn!("strategy registry empty, capital reallocation deferred");
            return Ok(false);
        }

        let mut targets: Vec<(String, f64)> = strategies
            .iter()
            .map(|s| (s.id.clone(), self.cfg.capital_ratio(s.status)))
            .collect();

        let total: f64 = targets.iter().map(|(_, r)| r).sum();
        if total > 1.0 {
            for (_, ratio) in &mut targets {
                *ratio /= total;
            }
        }

        for (id, ratio) in &targets {
            self.persistence.set_allocation(id, *ratio).await?;
        }

        let balance = self.capital.current_balance().await.unwrap_or(0.0);
        let utilization: f64 = targets.iter().map(|(_, r)| r).sum();
        info!(
            strategies = targets.len(),
            utilization,
            balance_usd = balance,
            "capital reallocated"
        );
        Ok(true)
    }

    pub async fn lifecycle_info(&self, id: &str) -> Result<LifecycleInfo> {
        let s = self.persistence.get(id).await?;
        Ok(LifecycleInfo {
            strategy_id: s.id.clone(),
            status: s.status,
            protection: s.protection,
            allocation_ratio: s.capital_allocation,
            dwell_hours: s.dwell_hours(Utc::now()),
        })
    }

    pub async fn average_capital_utilization(&self) -> f64 {
        let strategies = self.persistence.all().await;
        if strategies.is_empty() {
            return 0.0;
        }
        strategies.iter().map(|s| s.capital_allocation).sum()
    }
}
