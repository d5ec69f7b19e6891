use chrono::{DateTime, Utc};
use shared_models::error::{EngineError, Result};
use shared_models::{
    EvolutionEvent, EvolutionMethod, Genome, LifecycleStatus, MetricsBundle, ProtectionLevel,
    Snapshot, Strategy, StrategyFamily,
};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Durable store behind the persistence layer. The Mock arm backs paper
/// trading and tests, exactly mirroring the Live arm's semantics including
/// write-failure behavior via fault injection.
pub enum Database {
    Live {
        pool: PgPool,
    },
    Mock {
        strategies: RwLock<HashMap<String, Strategy>>,
        events: RwLock<Vec<EvolutionEvent>>,
        snapshots: RwLock<Vec<Snapshot>>,
        fail_writes: AtomicBool,
    },
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        if std::env::var("PAPER_TRADING_MODE").unwrap_or_default() == "true" {
            info!("Using in-memory store for paper trading mode");
            return Ok(Self::mock());
        }

        let pool = PgPool::connect(database_url).await?;
        info!("Connected to PostgreSQL strategy store");
        Ok(Self::Live { pool })
    }

    pub fn mock() -> Self {
        Self::Mock {
            strategies: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            snapshots: RwLock::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Fault injection for atomicity tests. No effect on the Live arm.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Database::Mock { fail_writes, .. } = self {
            fail_writes.store(fail, Ordering::SeqCst);
        }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let Database::Live { pool } = self else {
            return Ok(());
        };
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                symbol TEXT NOT NULL,
                family TEXT NOT NULL,
                params JSONB NOT NULL,
                generation INTEGER NOT NULL,
                cycle INTEGER NOT NULL,
                parent_ids JSONB NOT NULL,
                evolution_method TEXT NOT NULL,
                fitness_score DOUBLE PRECISION NOT NULL,
                win_rate DOUBLE PRECISION NOT NULL,
                total_return DOUBLE PRECISION NOT NULL,
                trade_count INTEGER NOT NULL,
                profit_factor DOUBLE PRECISION NOT NULL,
                max_drawdown DOUBLE PRECISION NOT NULL,
                sharpe_ratio DOUBLE PRECISION NOT NULL,
                avg_hold_time_hours DOUBLE PRECISION NOT NULL,
                realized_pnl_usd DOUBLE PRECISION NOT NULL,
                status TEXT NOT NULL,
                protection TEXT NOT NULL,
                capital_allocation DOUBLE PRECISION NOT NULL,
                tier_entry_pnl_usd DOUBLE PRECISION NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                status_entered_at TIMESTAMPTZ NOT NULL,
                last_evolved_at TIMESTAMPTZ,
                below_retirement_since TIMESTAMPTZ
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS evolution_events (
                id TEXT PRIMARY KEY,
                strategy_id TEXT NOT NULL,
                generation INTEGER NOT NULL,
                cycle INTEGER NOT NULL,
                method TEXT NOT NULL,
                old_params JSONB NOT NULL,
                new_params JSONB NOT NULL,
                old_fitness DOUBLE PRECISION NOT NULL,
                new_fitness DOUBLE PRECISION NOT NULL,
                improvement DOUBLE PRECISION NOT NULL,
                trigger TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_snapshots (
                id TEXT PRIMARY KEY,
                strategy_id TEXT NOT NULL,
                label TEXT NOT NULL,
                params JSONB NOT NULL,
                fitness_score DOUBLE PRECISION NOT NULL,
                metrics JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_strategy ON evolution_events (strategy_id, created_at DESC)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn upsert_strategy(&self, strategy: &Strategy) -> Result<()> {
        match self {
            Database::Live { pool } => {
                upsert_strategy_query(strategy)?.execute(pool).await?;
                Ok(())
            }
            Database::Mock {
                strategies,
                fail_writes,
                ..
            } => {
                if fail_writes.load(Ordering::SeqCst) {
                    return Err(EngineError::Persistence("injected write failure".into()));
                }
                strategies
                    .write()
                    .await
                    .insert(strategy.id.clone(), strategy.clone());
                Ok(())
            }
        }
    }

    /// Atomic genome commit: the strategy row update and its EvolutionEvent
    /// record both persist, or neither does.
    async fn commit(&self, strategy: &Strategy, event: &EvolutionEvent) -> Result<()> {
        match self {
            Database::Live { pool } => {
                let mut tx = pool.begin().await?;
                upsert_strategy_query(strategy)?.execute(&mut *tx).await?;
                insert_event_query(event)?.execute(&mut *tx).await?;
                tx.commit().await?;
                Ok(())
            }
            Database::Mock {
                strategies,
                events,
                fail_writes,
                ..
            } => {
                if fail_writes.load(Ordering::SeqCst) {
                    return Err(EngineError::Persistence("injected write failure".into()));
                }
                // Both locks held for the whole write so a reader never sees
                // one half of the commit.
                let mut strategies = strategies.write().await;
                let mut events = events.write().await;
                strategies.insert(strategy.id.clone(), strategy.clone());
                events.push(event.clone());
                Ok(())
            }
        }
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        match self {
            Database::Live { pool } => {
                sqlx::query(
                    r#"
                    INSERT INTO strategy_snapshots (id, strategy_id, label, params, fitness_score, metrics, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(&snapshot.id)
                .bind(&snapshot.strategy_id)
                .bind(&snapshot.label)
                .bind(serde_json::to_value(&snapshot.params)?)
                .bind(snapshot.fitness_score)
                .bind(serde_json::to_value(&snapshot.metrics)?)
                .bind(snapshot.created_at)
                .execute(pool)
                .await?;
                Ok(())
            }
            Database::Mock {
                snapshots,
                fail_writes,
                ..
            } => {
                if fail_writes.load(Ordering::SeqCst) {
                    return Err(EngineError::Persistence("injected write failure".into()));
                }
                snapshots.write().await.push(snapshot.clone());
                Ok(())
            }
        }
    }

    async fn load_strategies(&self) -> Result<Vec<Strategy>> {
        match self {
            Database::Live { pool } => {
                let rows = sqlx::query("SELECT * FROM strategies")
                    .fetch_all(pool)
                    .await?;
                rows.iter().map(strategy_from_row).collect()
            }
            Database::Mock { strategies, .. } => {
                Ok(strategies.read().await.values().cloned().collect())
            }
        }
    }

    async fn load_events(&self) -> Result<Vec<EvolutionEvent>> {
        match self {
            Database::Live { pool } => {
                let rows = sqlx::query("SELECT * FROM evolution_events ORDER BY created_at ASC")
                    .fetch_all(pool)
                    .await?;
                rows.iter().map(event_from_row).collect()
            }
            Database::Mock { events, .. } => Ok(events.read().await.clone()),
        }
    }

    async fn load_snapshots(&self) -> Result<Vec<Snapshot>> {
        match self {
            Database::Live { pool } => {
                let rows =
                    sqlx::query("SELECT * FROM strategy_snapshots ORDER BY created_at ASC")
                        .fetch_all(pool)
                        .await?;
                rows.iter().map(snapshot_from_row).collect()
            }
            Database::Mock { snapshots, .. } => Ok(snapshots.read().await.clone()),
        }
    }

    pub async fn ping(&self) -> bool {
        match self {
            Database::Live { pool } => sqlx::query("SELECT 1").execute(pool).await.is_ok(),
            Database::Mock { fail_writes, .. } => !fail_writes.load(Ordering::SeqCst),
        }
    }
}

fn upsert_strategy_query(
    s: &Strategy,
) -> Result<sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>> {
    Ok(sqlx::query(
        r#"
        INSERT INTO strategies (
            id, name, symbol, family, params, generation, cycle, parent_ids,
            evolution_method, fitness_score, win_rate, total_return, trade_count,
            profit_factor, max_drawdown, sharpe_ratio, avg_hold_time_hours,
            realized_pnl_usd, status, protection, capital_allocation,
            tier_entry_pnl_usd, created_at, updated_at, status_entered_at,
            last_evolved_at, below_retirement_since
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24,$25,$26,$27)
        ON CONFLICT (id) DO UPDATE SET
            params = EXCLUDED.params,
            generation = EXCLUDED.generation,
            cycle = EXCLUDED.cycle,
            parent_ids = EXCLUDED.parent_ids,
            evolution_method = EXCLUDED.evolution_method,
            fitness_score = EXCLUDED.fitness_score,
            win_rate = EXCLUDED.win_rate,
            total_return = EXCLUDED.total_return,
            trade_count = EXCLUDED.trade_count,
            profit_factor = EXCLUDED.profit_factor,
            max_drawdown = EXCLUDED.max_drawdown,
            sharpe_ratio = EXCLUDED.sharpe_ratio,
            avg_hold_time_hours = EXCLUDED.avg_hold_time_hours,
            realized_pnl_usd = EXCLUDED.realized_pnl_usd,
            status = EXCLUDED.status,
            protection = EXCLUDED.protection,
            capital_allocation = EXCLUDED.capital_allocation,
            tier_entry_pnl_usd = EXCLUDED.tier_entry_pnl_usd,
            updated_at = EXCLUDED.updated_at,
            status_entered_at = EXCLUDED.status_entered_at,
            last_evolved_at = EXCLUDED.last_evolved_at,
            below_retirement_since = EXCLUDED.below_retirement_since
        "#,
    )
    .bind(s.id.clone())
    .bind(s.name.clone())
    .bind(s.symbol.clone())
    .bind(s.family.as_str())
    .bind(serde_json::to_value(&s.params)?)
    .bind(s.generation as i32)
    .bind(s.cycle as i32)
    .bind(serde_json::to_value(&s.parent_ids)?)
    .bind(s.evolution_method.as_str())
    .bind(s.fitness_score)
    .bind(s.win_rate)
    .bind(s.total_return)
    .bind(s.trade_count as i32)
    .bind(s.profit_factor)
    .bind(s.max_drawdown)
    .bind(s.sharpe_ratio)
    .bind(s.avg_hold_time_hours)
    .bind(s.realized_pnl_usd)
    .bind(s.status.as_str())
    .bind(s.protection.as_str())
    .bind(s.capital_allocation)
    .bind(s.tier_entry_pnl_usd)
    .bind(s.created_at)
    .bind(s.updated_at)
    .bind(s.status_entered_at)
    .bind(s.last_evolved_at)
    .bind(s.below_retirement_since))
}

fn insert_event_query(
    e: &EvolutionEvent,
) -> Result<sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>> {
    Ok(sqlx::query(
        r#"
        INSERT INTO evolution_events (
            id, strategy_id, generation, cycle, method, old_params, new_params,
            old_fitness, new_fitness, improvement, trigger, created_at
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
        "#,
    )
    .bind(e.id.clone())
    .bind(e.strategy_id.clone())
    .bind(e.generation as i32)
    .bind(e.cycle as i32)
    .bind(e.method.as_str())
    .bind(serde_json::to_value(&e.old_params)?)
    .bind(serde_json::to_value(&e.new_params)?)
    .bind(e.old_fitness)
    .bind(e.new_fitness)
    .bind(e.improvement)
    .bind(e.trigger.clone())
    .bind(e.created_at))
}

fn strategy_from_row(row: &sqlx::postgres::PgRow) -> Result<Strategy> {
    let family: String = row.get("family");
    let status: String = row.get("status");
    let protection: String = row.get("protection");
    let method: String = row.get("evolution_method");
    Ok(Strategy {
        id: row.get("id"),
        name: row.get("name"),
        symbol: row.get("symbol"),
        family: StrategyFamily::parse(&family),
        params: serde_json::from_value(row.get("params"))?,
        generation: row.get::<i32, _>("generation") as u32,
        cycle: row.get::<i32, _>("cycle") as u32,
        parent_ids: serde_json::from_value(row.get("parent_ids"))?,
        evolution_method: EvolutionMethod::parse(&method).unwrap_or(EvolutionMethod::Manual),
        fitness_score: row.get("fitness_score"),
        win_rate: row.get("win_rate"),
        total_return: row.get("total_return"),
        trade_count: row.get::<i32, _>("trade_count") as u32,
        profit_factor: row.get("profit_factor"),
        max_drawdown: row.get("max_drawdown"),
        sharpe_ratio: row.get("sharpe_ratio"),
        avg_hold_time_hours: row.get("avg_hold_time_hours"),
        realized_pnl_usd: row.get("realized_pnl_usd"),
        status: LifecycleStatus::parse(&status).unwrap_or(LifecycleStatus::SimulationInit),
        protection: ProtectionLevel::parse(&protection).unwrap_or(ProtectionLevel::None),
        capital_allocation: row.get("capital_allocation"),
        tier_entry_pnl_usd: row.get("tier_entry_pnl_usd"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        status_entered_at: row.get("status_entered_at"),
        last_evolved_at: row.get("last_evolved_at"),
        below_retirement_since: row.get("below_retirement_since"),
    })
}

fn snapshot_from_row(row: &sqlx::postgres::PgRow) -> Result<Snapshot> {
    Ok(Snapshot {
        id: row.get("id"),
        strategy_id: row.get("strategy_id"),
        label: row.get("label"),
        params: serde_json::from_value(row.get("params"))?,
        fitness_score: row.get("fitness_score"),
        metrics: serde_json::from_value(row.get("metrics"))?,
        created_at: row.get("created_at"),
    })
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<EvolutionEvent> {
    let method: String = row.get("method");
    Ok(EvolutionEvent {
        id: row.get("id"),
        strategy_id: row.get("strategy_id"),
        generation: row.get::<i32, _>("generation") as u32,
        cycle: row.get::<i32, _>("cycle") as u32,
        method: EvolutionMethod::parse(&method).unwrap_or(EvolutionMethod::Mutation),
        old_params: serde_json::from_value(row.get("old_params"))?,
        new_params: serde_json::from_value(row.get("new_params"))?,
        old_fitness: row.get("old_fitness"),
        new_fitness: row.get("new_fitness"),
        improvement: row.get("improvement"),
        trigger: row.get("trigger"),
        created_at: row.get("created_at"),
    })
}

/// Score thresholds at which protection auto-raises.
#[derive(Debug, Clone)]
pub struct ProtectionPolicy {
    pub protected_score: f64,
    pub elite_score: f64,
}

impl Default for ProtectionPolicy {
    fn default() -> Self {
        Self {
            protected_score: 50.0,
            elite_score: 60.0,
        }
    }
}

/// Persistence & protection layer. Exclusively owns write access to every
/// strategy's genome, status and protection fields; other components only
/// request changes, which are validated against the invariants here before
/// anything is committed. In-memory state is updated strictly after the
/// durable write succeeds, so memory and store can never diverge.
pub struct Persistence {
    db: Arc<Database>,
    registry: RwLock<HashMap<String, Strategy>>,
    events: RwLock<Vec<EvolutionEvent>>,
    snapshots: RwLock<Vec<Snapshot>>,
    generation: AtomicU32,
    cycle: AtomicU32,
    store_healthy: AtomicBool,
    policy: ProtectionPolicy,
}

impl Persistence {
    pub fn new(db: Arc<Database>, policy: ProtectionPolicy) -> Self {
        Self {
            db,
            registry: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            snapshots: RwLock::new(Vec::new()),
            generation: AtomicU32::new(1),
            cycle: AtomicU32::new(1),
            store_healthy: AtomicBool::new(true),
            policy,
        }
    }

    /// Reload the persisted population, snapshot store and event history,
    /// and reconstruct the generation/cycle counters. Evolution resumes
    /// from the highest persisted generation rather than restarting at 1.
    pub async fn restore(&self) -> Result<()> {
        let strategies = self.db.load_strategies().await?;
        let events = self.db.load_events().await?;
        let snapshots = self.db.load_snapshots().await?;

        let generation = strategies.iter().map(|s| s.generation).max().unwrap_or(1).max(1);
        let cycle = strategies.iter().map(|s| s.cycle).max().unwrap_or(1).max(1);

        info!(
            strategies = strategies.len(),
            events = events.len(),
            snapshots = snapshots.len(),
            generation,
            cycle,
            "restored strategy population"
        );

        let mut registry = self.registry.write().await;
        registry.clear();
        for s in strategies {
            registry.insert(s.id.clone(), s);
        }
        *self.events.write().await = events;
        *self.snapshots.write().await = snapshots;
        self.generation.store(generation, Ordering::SeqCst);
        self.cycle.store(cycle, Ordering::SeqCst);
        Ok(())
    }

    pub fn current_generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn current_cycle(&self) -> u32 {
        self.cycle.load(Ordering::SeqCst)
    }

    /// Called by the scheduler after a sweep in which at least one strategy
    /// evolved. Generation only ever moves forward.
    pub fn advance_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cycle.store(1, Ordering::SeqCst);
    }

    pub fn store_healthy(&self) -> bool {
        self.store_healthy.load(Ordering::SeqCst)
    }

    pub async fn register(&self, strategy: Strategy) -> Result<()> {
        self.db.upsert_strategy(&strategy).await?;
        self.registry
            .write()
            .await
            .insert(strategy.id.clone(), strategy);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Strategy> {
        self.registry
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::StrategyNotFound(id.to_string()))
    }

    pub async fn all(&self) -> Vec<Strategy> {
        self.registry.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Commit a new genome plus its audit record atomically. The previous
    /// genome survives inside the EvolutionEvent, never overwritten
    /// destructively.
    pub async fn commit_genome(
        &self,
        id: &str,
        new_genome: Genome,
        new_fitness_score: f64,
        reason: &str,
        method: EvolutionMethod,
    ) -> Result<EvolutionEvent> {
        let current = self.get(id).await?;
        if current.is_retired() {
            return Err(EngineError::Invariant {
                rule: "retired-frozen",
                detail: format!("strategy {} is retired and cannot evolve", id),
            });
        }

        let now = Utc::now();
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst);
        let generation = self.current_generation().max(current.generation);

        let mut updated = current.clone();
        updated.params = new_genome.clone();
        updated.generation = generation;
        updated.cycle = cycle;
        updated.evolution_method = method;
        updated.fitness_score = new_fitness_score;
        updated.last_evolved_at = Some(now);
        updated.updated_at = now;
        self.apply_protection(&mut updated);

        let event = EvolutionEvent {
            id: Uuid::new_v4().to_string(),
            strategy_id: id.to_string(),
            generation,
            cycle,
            method,
            old_params: current.params.clone(),
            new_params: new_genome,
            old_fitness: current.fitness_score,
            new_fitness: new_fitness_score,
            improvement: new_fitness_score - current.fitness_score,
            trigger: reason.to_string(),
            created_at: now,
        };

        if let Err(e) = self.db.commit(&updated, &event).await {
            self.store_healthy.store(false, Ordering::SeqCst);
            warn!(strategy_id = %id, error = %e, "genome commit failed, memory unchanged");
            return Err(e);
        }
        self.store_healthy.store(true, Ordering::SeqCst);

        self.registry
            .write()
            .await
            .insert(id.to_string(), updated);
        self.events.write().await.push(event.clone());

        info!(
            strategy_id = %id,
            generation,
            cycle,
            improvement = event.improvement,
            trigger = %event.trigger,
            "genome committed"
        );
        Ok(event)
    }

    /// Request a lifecycle transition. Validated against the tier ladder:
    /// retirement is reachable from any live tier, promotions move exactly
    /// one rank, and nothing ever leaves `Retired`.
    pub async fn transition_status(&self, id: &str, new_status: LifecycleStatus) -> Result<Strategy> {
        let current = self.get(id).await?;
        if current.status == new_status {
            return Ok(current);
        }
        if current.is_retired() {
            return Err(EngineError::Invariant {
                rule: "retired-terminal",
                detail: format!(
                    "strategy {} is retired; {} is unreachable",
                    id, new_status
                ),
            });
        }
        if new_status != LifecycleStatus::Retired
            && new_status.rank() != current.status.rank() + 1
        {
            return Err(EngineError::Invariant {
                rule: "tier-ladder",
                detail: format!(
                    "strategy {} cannot jump {} -> {}",
                    id, current.status, new_status
                ),
            });
        }

        let now = Utc::now();
        let mut updated = current;
        updated.status = new_status;
        updated.status_entered_at = now;
        updated.tier_entry_pnl_usd = updated.realized_pnl_usd;
        updated.below_retirement_since = None;
        updated.updated_at = now;
        if new_status == LifecycleStatus::Retired {
            updated.capital_allocation = 0.0;
        }

        self.persist_update(updated.clone()).await?;
        info!(strategy_id = %id, status = %new_status, "lifecycle transition committed");
        Ok(updated)
    }

    /// Raise the protection floor. Lowering it is reserved for the explicit
    /// administrative path; routine callers get a structured rejection.
    pub async fn protect(&self, id: &str, level: ProtectionLevel) -> Result<Strategy> {
        let current = self.get(id).await?;
        if level < current.protection {
            return Err(EngineError::Invariant {
                rule: "protection-monotonic",
                detail: format!(
                    "strategy {} protection {} cannot drop to {}",
                    id,
                    current.protection.as_str(),
                    level.as_str()
                ),
            });
        }
        if level == current.protection {
            return Ok(current);
        }
        let mut updated = current;
        updated.protection = level;
        updated.updated_at = Utc::now();
        self.persist_update(updated.clone()).await?;
        info!(strategy_id = %id, level = level.as_str(), "protection raised");
        Ok(updated)
    }

    /// Administrative override: the only path that may lower protection.
    pub async fn admin_set_protection(
        &self,
        id: &str,
        level: ProtectionLevel,
    ) -> Result<Strategy> {
        let mut updated = self.get(id).await?;
        updated.protection = level;
        updated.updated_at = Utc::now();
        self.persist_update(updated.clone()).await?;
        warn!(strategy_id = %id, level = level.as_str(), "protection set administratively");
        Ok(updated)
    }

    /// Refresh a strategy's performance snapshot from a metrics bundle.
    /// Collection never touches genomes; only performance fields move here.
    pub async fn update_metrics(
        &self,
        id: &str,
        bundle: &MetricsBundle,
        fitness_score: f64,
    ) -> Result<Strategy> {
        let mut updated = self.get(id).await?;
        updated.fitness_score = fitness_score;
        updated.win_rate = bundle.win_rate;
        updated.total_return = bundle.total_return;
        updated.trade_count = bundle.trade_count;
        updated.profit_factor = bundle.profit_factor;
        updated.max_drawdown = bundle.max_drawdown;
        updated.sharpe_ratio = bundle.sharpe_ratio;
        updated.avg_hold_time_hours = bundle.avg_hold_time_hours;
        updated.realized_pnl_usd = bundle.realized_pnl_usd;
        updated.updated_at = Utc::now();
        self.apply_protection(&mut updated);
        self.persist_update(updated.clone()).await?;
        Ok(updated)
    }

    /// Start or clear the sustained-low-score clock used by retirement.
    pub async fn update_retirement_watch(
        &self,
        id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Strategy> {
        let mut updated = self.get(id).await?;
        if updated.below_retirement_since == since {
            return Ok(updated);
        }
        updated.below_retirement_since = since;
        self.persist_update(updated.clone()).await?;
        Ok(updated)
    }

    /// Capital ratios are recomputed by the lifecycle manager from the full
    /// registry; this records one strategy's share.
    pub async fn set_allocation(&self, id: &str, ratio: f64) -> Result<Strategy> {
        let mut updated = self.get(id).await?;
        updated.capital_allocation = ratio;
        updated.updated_at = Utc::now();
        self.persist_update(updated.clone()).await?;
        Ok(updated)
    }

    /// Point-in-time copy of one strategy under a label.
    pub async fn snapshot_strategy(&self, id: &str, label: &str) -> Result<Snapshot> {
        let s = self.get(id).await?;
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            strategy_id: s.id.clone(),
            label: label.to_string(),
            params: s.params.clone(),
            fitness_score: s.fitness_score,
            metrics: MetricsBundle::from_strategy(&s),
            created_at: Utc::now(),
        };
        self.db.insert_snapshot(&snapshot).await?;
        self.snapshots.write().await.push(snapshot.clone());
        Ok(snapshot)
    }

    /// Most recent snapshot recorded for a strategy, if any.
    pub async fn latest_snapshot(&self, id: &str) -> Option<Snapshot> {
        self.snapshots
            .read()
            .await
            .iter()
            .filter(|s| s.strategy_id == id)
            .max_by_key(|s| s.created_at)
            .cloned()
    }

    /// Snapshot the whole population, e.g. around an evolution sweep or on
    /// shutdown.
    pub async fn snapshot(&self, label: &str) -> Result<usize> {
        let ids: Vec<String> = self.registry.read().await.keys().cloned().collect();
        let mut written = 0;
        for id in ids {
            self.snapshot_strategy(&id, label).await?;
            written += 1;
        }
        info!(label, strategies = written, "population snapshot written");
        Ok(written)
    }

    /// Newest-first page of a strategy's evolution history plus the total
    /// event count.
    pub async fn events_for(
        &self,
        id: &str,
        page: usize,
        page_size: usize,
    ) -> (Vec<EvolutionEvent>, usize) {
        let events = self.events.read().await;
        let mut mine: Vec<EvolutionEvent> = events
            .iter()
            .filter(|e| e.strategy_id == id)
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = mine.len();
        let page_size = page_size.max(1);
        let start = page.saturating_mul(page_size);
        let slice = if start >= total {
            Vec::new()
        } else {
            mine[start..(start + page_size).min(total)].to_vec()
        };
        (slice, total)
    }

    pub async fn event_count(&self, id: &str) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.strategy_id == id)
            .count()
    }

    pub async fn db_reachable(&self) -> bool {
        self.db.ping().await
    }

    fn apply_protection(&self, strategy: &mut Strategy) {
        let earned = if strategy.fitness_score >= self.policy.elite_score {
            ProtectionLevel::Elite
        } else if strategy.fitness_score >= self.policy.protected_score {
            ProtectionLevel::Protected
        } else {
            ProtectionLevel::None
        };
        // Floor only rises; crossing back below a threshold never demotes.
        if earned > strategy.protection {
            strategy.protection = earned;
        }
    }

    async fn persist_update(&self, updated: Strategy) -> Result<()> {
        if let Err(e) = self.db.upsert_strategy(&updated).await {
            self.store_healthy.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.store_healthy.store(true, Ordering::SeqCst);
        self.registry
            .write()
            .await
            .insert(updated.id.clone(), updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_models::Genome;

    fn genome() -> Genome {
        [("lookback_period", 20.0), ("stop_loss_pct", 2.0)]
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    async fn persistence_with(strategy: Strategy) -> Persistence {
        let p = Persistence::new(Arc::new(Database::mock()), ProtectionPolicy::default());
        p.register(strategy).await.unwrap();
        p
    }

    fn strategy(id: &str) -> Strategy {
        Strategy::new(id, "mom-1", "SOL", StrategyFamily::Momentum, genome())
    }

    #[tokio::test]
    async fn commit_writes_event_and_bumps_lineage() {
        let p = persistence_with(strategy("s1")).await;
        let mut new_genome = genome();
        new_genome.insert("stop_loss_pct".into(), 3.0);

        let event = p
            .commit_genome("s1", new_genome.clone(), 55.0, "urgent", EvolutionMethod::Mutation)
            .await
            .unwrap();

        let s = p.get("s1").await.unwrap();
        assert_eq!(s.params, new_genome);
        assert_eq!(s.fitness_score, 55.0);
        assert!(s.last_evolved_at.is_some());
        assert_eq!(event.old_params, genome());
        assert_eq!(p.event_count("s1").await, 1);
    }

    #[tokio::test]
    async fn failed_commit_leaves_everything_untouched() {
        let db = Arc::new(Database::mock());
        let p = Persistence::new(Arc::clone(&db), ProtectionPolicy::default());
        p.register(strategy("s1")).await.unwrap();

        let before = p.get("s1").await.unwrap();
        db.set_fail_writes(true);

        let mut new_genome = genome();
        new_genome.insert("stop_loss_pct".into(), 5.0);
        let err = p
            .commit_genome("s1", new_genome, 70.0, "urgent", EvolutionMethod::Mutation)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));

        let after = p.get("s1").await.unwrap();
        assert_eq!(after.params, before.params);
        assert_eq!(after.fitness_score, before.fitness_score);
        assert_eq!(after.status, before.status);
        assert_eq!(p.event_count("s1").await, 0);
        assert!(!p.store_healthy());
    }

    #[tokio::test]
    async fn counters_resume_from_persisted_population() {
        let db = Arc::new(Database::mock());
        {
            let p = Persistence::new(Arc::clone(&db), ProtectionPolicy::default());
            let mut s = strategy("s1");
            s.generation = 7;
            s.cycle = 3;
            p.register(s).await.unwrap();
        }

        // Fresh engine start over the same durable store.
        let p = Persistence::new(db, ProtectionPolicy::default());
        p.restore().await.unwrap();
        assert!(p.current_generation() >= 7);
        assert!(p.current_cycle() >= 3);
    }

    #[tokio::test]
    async fn snapshots_survive_restart() {
        let db = Arc::new(Database::mock());
        {
            let p = Persistence::new(Arc::clone(&db), ProtectionPolicy::default());
            p.register(strategy("s1")).await.unwrap();
            p.snapshot_strategy("s1", "pre_evolution").await.unwrap();
            p.snapshot("nightly").await.unwrap();
        }

        let p = Persistence::new(db, ProtectionPolicy::default());
        p.restore().await.unwrap();
        let latest = p.latest_snapshot("s1").await.unwrap();
        assert_eq!(latest.params, genome());
        assert!(p.latest_snapshot("ghost").await.is_none());
    }

    #[tokio::test]
    async fn empty_store_starts_at_generation_one() {
        let p = Persistence::new(Arc::new(Database::mock()), ProtectionPolicy::default());
        p.restore().await.unwrap();
        assert_eq!(p.current_generation(), 1);
    }

    #[tokio::test]
    async fn protection_rises_with_score_and_never_drops() {
        let p = persistence_with(strategy("s1")).await;
        let bundle = MetricsBundle {
            score: 65.0,
            win_rate: 0.6,
            total_return: 0.1,
            avg_hold_time_hours: 10.0,
            trade_count: 40,
            profit_factor: 1.8,
            max_drawdown: 0.08,
            sharpe_ratio: 1.1,
            realized_pnl_usd: 50.0,
        };

        let s = p.update_metrics("s1", &bundle, 65.0).await.unwrap();
        assert_eq!(s.protection, ProtectionLevel::Elite);

        // Score collapse does not demote.
        let s = p.update_metrics("s1", &bundle, 10.0).await.unwrap();
        assert_eq!(s.protection, ProtectionLevel::Elite);

        // Routine callers cannot lower the floor either.
        let err = p.protect("s1", ProtectionLevel::None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Invariant {
                rule: "protection-monotonic",
                ..
            }
        ));

        // The administrative path is the one exception.
        let s = p
            .admin_set_protection("s1", ProtectionLevel::None)
            .await
            .unwrap();
        assert_eq!(s.protection, ProtectionLevel::None);
    }

    #[tokio::test]
    async fn retired_is_terminal_and_still_queryable() {
        let p = persistence_with(strategy("s1")).await;
        p.commit_genome("s1", genome(), 30.0, "routine", EvolutionMethod::Mutation)
            .await
            .unwrap();
        let history_len = p.event_count("s1").await;

        p.transition_status("s1", LifecycleStatus::Retired)
            .await
            .unwrap();

        let s = p.get("s1").await.unwrap();
        assert!(s.is_retired());
        assert_eq!(s.capital_allocation, 0.0);
        assert_eq!(p.event_count("s1").await, history_len);

        let err = p
            .transition_status("s1", LifecycleStatus::FullRealTrading)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Invariant {
                rule: "retired-terminal",
                ..
            }
        ));

        let err = p
            .commit_genome("s1", genome(), 50.0, "urgent", EvolutionMethod::Mutation)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Invariant { rule: "retired-frozen", .. }));
    }

    #[tokio::test]
    async fn tier_skips_are_rejected() {
        let p = persistence_with(strategy("s1")).await;
        let err = p
            .transition_status("s1", LifecycleStatus::FullRealTrading)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Invariant { rule: "tier-ladder", .. }));

        // One rank at a time works.
        p.transition_status("s1", LifecycleStatus::RealEnvSimulation)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transition_resets_tier_pnl_baseline() {
        let p = persistence_with(strategy("s1")).await;
        let bundle = MetricsBundle {
            score: 40.0,
            win_rate: 0.5,
            total_return: 0.05,
            avg_hold_time_hours: 5.0,
            trade_count: 20,
            profit_factor: 1.2,
            max_drawdown: 0.1,
            sharpe_ratio: 0.7,
            realized_pnl_usd: 250.0,
        };
        p.update_metrics("s1", &bundle, 40.0).await.unwrap();

        let s = p
            .transition_status("s1", LifecycleStatus::RealEnvSimulation)
            .await
            .unwrap();
        assert_eq!(s.tier_entry_pnl_usd, 250.0);
        assert_eq!(s.tier_realized_pnl(), 0.0);
    }

    #[tokio::test]
    async fn history_pages_newest_first() {
        let p = persistence_with(strategy("s1")).await;
        for i in 0..5 {
            p.commit_genome("s1", genome(), 30.0 + i as f64, "routine", EvolutionMethod::Mutation)
                .await
                .unwrap();
        }
        let (page0, total) = p.events_for("s1", 0, 2).await;
        assert_eq!(total, 5);
        assert_eq!(page0.len(), 2);
        assert!(page0[0].created_at >= page0[1].created_at);
        let (page2, _) = p.events_for("s1", 2, 2).await;
        assert_eq!(page2.len(), 1);
        let (page9, _) = p.events_for("s1", 9, 2).await;
        assert!(page9.is_empty());
    }
}
