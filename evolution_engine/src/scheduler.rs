use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use shared_models::error::{EngineError, Result};
use shared_models::{
    EvolutionMethod, EvolutionResult, Genome, ProtectionLevel, Strategy, TaskOutcome,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::candidates::CandidateGenerator;
use crate::fitness;
use crate::lifecycle::LifecycleManager;
use crate::param_mapper::{self, ParamSpec};
use crate::persistence::Persistence;
use crate::validation::ValidationRunner;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Below this fitness a strategy is evolved urgently.
    pub urgent_fitness: f64,
    /// Below this (and above urgent) a strategy gets routine improvement.
    pub routine_fitness: f64,
    /// Top performers are refreshed when they have not evolved in this long.
    pub refresh_interval_hours: f64,
    /// A strategy that evolved within this window is never re-queued by the
    /// automatic triggers.
    pub cooldown_hours: f64,
    pub min_improvement: f64,
    pub min_confidence: f64,
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            urgent_fitness: 0.3,
            routine_fitness: 0.6,
            refresh_interval_hours: 72.0,
            cooldown_hours: 6.0,
            min_improvement: 0.02,
            min_confidence: 0.5,
            max_concurrent: 3,
        }
    }
}

/// Queue ordering: urgent before routine before refresh, FIFO within a
/// tier via the monotonic sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Urgent,
    Routine,
    Refresh,
}

impl Priority {
    fn trigger(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent_low_fitness",
            Priority::Routine => "routine_improvement",
            Priority::Refresh => "periodic_refresh",
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedTask {
    strategy_id: String,
    priority: Priority,
    trigger: String,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    tasks: Vec<QueuedTask>,
    queued_ids: HashSet<String>,
}

/// Coordinates the evolution pipeline per strategy:
/// `idle -> queued -> running -> {applied | rejected | failed}`, with
/// `cancelled` for work whose strategy retired underneath it.
pub struct EvolutionScheduler {
    persistence: Arc<Persistence>,
    runner: Arc<ValidationRunner>,
    lifecycle: Arc<LifecycleManager>,
    generator: std::sync::Mutex<CandidateGenerator>,
    queue: std::sync::Mutex<QueueState>,
    running: tokio::sync::Mutex<HashSet<String>>,
    seq: AtomicU64,
    cfg: SchedulerConfig,
}

impl EvolutionScheduler {
    pub fn new(
        persistence: Arc<Persistence>,
        runner: Arc<ValidationRunner>,
        lifecycle: Arc<LifecycleManager>,
        generator: CandidateGenerator,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            persistence,
            runner,
            lifecycle,
            generator: std::sync::Mutex::new(generator),
            queue: std::sync::Mutex::new(QueueState::default()),
            running: tokio::sync::Mutex::new(HashSet::new()),
            seq: AtomicU64::new(0),
            cfg,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().unwrap().tasks.len()
    }

    /// Scan the registry and enqueue strategies that need evolving. Returns
    /// how many were added. A store outage halts new admission entirely.
    pub async fn check_and_enqueue(&self) -> usize {
        if !self.persistence.store_healthy() {
            warn!("persistence store unhealthy, evolution admission halted");
            return 0;
        }

        let now = Utc::now();
        let strategies = self.persistence.all().await;
        let running: HashSet<String> = self.running.lock().await.clone();

        let mut queue = self.queue.lock().unwrap();
        let mut added = 0;
        for s in strategies {
            if s.is_retired()
                || queue.queued_ids.contains(&s.id)
                || running.contains(&s.id)
            {
                continue;
            }

            if let Some(last) = s.last_evolved_at {
                let since_hours = (now - last).num_seconds() as f64 / 3600.0;
                if since_hours < self.cfg.cooldown_hours {
                    continue;
                }
            }

            let current = fitness::from_display_score(s.fitness_score);
            let stale_hours = {
                let anchor = s.last_evolved_at.unwrap_or(s.created_at);
                (now - anchor).num_seconds() as f64 / 3600.0
            };

            let priority = if current < self.cfg.urgent_fitness {
                Priority::Urgent
            } else if current < self.cfg.routine_fitness {
                Priority::Routine
            } else if stale_hours >= self.cfg.refresh_interval_hours {
                Priority::Refresh
            } else {
                continue;
            };

            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            queue.queued_ids.insert(s.id.clone());
            queue.tasks.push(QueuedTask {
                strategy_id: s.id.clone(),
                priority,
                trigger: priority.trigger().to_string(),
                seq,
            });
            added += 1;
            debug!(strategy_id = %s.id, ?priority, "strategy queued for evolution");
        }
        if added > 0 {
            info!(added, depth = queue.tasks.len(), "evolution queue updated");
        }
        added
    }

    /// Drain the queue under the concurrency cap and run every task to an
    /// outcome. Generation advances once per sweep that applied anything.
    pub async fn tick(&self) -> Vec<EvolutionResult> {
        let tasks: Vec<QueuedTask> = {
            let mut queue = self.queue.lock().unwrap();
            let mut tasks = std::mem::take(&mut queue.tasks);
            queue.queued_ids.clear();
            tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.seq.cmp(&b.seq)));
            tasks
        };
        if tasks.is_empty() {
            return Vec::new();
        }

        let results: Vec<EvolutionResult> = stream::iter(tasks)
            .map(|task| self.run_task(task))
            .buffer_unordered(self.cfg.max_concurrent.max(1))
            .collect()
            .await;

        if results.iter().any(|r| r.outcome == TaskOutcome::Applied) {
            self.persistence.advance_generation();
        }
        results
    }

    /// Manual/forced trigger: bypasses the cooldown and the queue but still
    /// observes per-strategy serialization and the commit rule. Never
    /// returns an error past this boundary.
    pub async fn evolve_now(&self, strategy_id: &str) -> EvolutionResult {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.run_task(QueuedTask {
            strategy_id: strategy_id.to_string(),
            priority: Priority::Urgent,
            trigger: "manual".to_string(),
            seq,
        })
        .await
    }

    async fn run_task(&self, task: QueuedTask) -> EvolutionResult {
        let id = task.strategy_id.clone();

        let strategy = match self.persistence.get(&id).await {
            Ok(s) => s,
            Err(e) => {
                return EvolutionResult::failure(&id, TaskOutcome::Failed, e.to_string());
            }
        };
        // Queued work for a retired strategy is dropped, not run.
        if strategy.is_retired() {
            return EvolutionResult::failure(&id, TaskOutcome::Cancelled, "strategy is retired");
        }

        {
            let mut running = self.running.lock().await;
            if !running.insert(id.clone()) {
                return EvolutionResult::failure(
                    &id,
                    TaskOutcome::Cancelled,
                    "evolution already running for this strategy",
                );
            }
        }

        let result = match self.evolve_strategy(&strategy, &task.trigger).await {
            Ok(result) => result,
            Err(e) => {
                // Component-local failures become a task outcome; the
                // scheduler itself never crashes over one strategy.
                error!(strategy_id = %id, error = %e, "evolution task failed");
                EvolutionResult::failure(&id, TaskOutcome::Failed, e.to_string())
            }
        };

        self.running.lock().await.remove(&id);
        result
    }

    async fn evolve_strategy(
        &self,
        strategy: &Strategy,
        trigger: &str,
    ) -> Result<EvolutionResult> {
        let id = &strategy.id;
        let specs = param_mapper::map_parameters(strategy.family, &strategy.params);
        if specs.is_empty() {
            return Ok(EvolutionResult::failure(
                id,
                TaskOutcome::Rejected,
                "strategy genome is empty",
            ));
        }

        self.persistence.snapshot_strategy(id, "pre_evolution").await?;

        let current_fitness = fitness::from_display_score(strategy.fitness_score);
        let candidates = self.build_candidates(strategy, &specs, current_fitness).await;

        let mut validated = Vec::new();
        for (genome, method) in candidates {
            match self.runner.validate(strategy, &genome, &specs).await {
                Ok(record) => validated.push((record, method)),
                Err(EngineError::InsufficientData(reason)) => {
                    debug!(strategy_id = %id, %reason, "candidate discarded");
                }
                Err(e) => {
                    warn!(strategy_id = %id, error = %e, "validation trial errored");
                }
            }
        }

        let Some((best, method)) = validated.into_iter().max_by(|(a, _), (b, _)| {
            a.predicted_fitness
                .partial_cmp(&b.predicted_fitness)
                .unwrap_or(std::cmp::Ordering::Equal)
        }) else {
            return Ok(EvolutionResult::failure(
                id,
                TaskOutcome::Rejected,
                "no candidate survived validation",
            ));
        };

        let improvement = best.predicted_fitness - current_fitness;
        if improvement < self.cfg.min_improvement {
            return Ok(EvolutionResult {
                strategy_id: id.clone(),
                success: false,
                outcome: TaskOutcome::Rejected,
                reason: format!(
                    "predicted improvement {:.4} below threshold {:.4}",
                    improvement, self.cfg.min_improvement
                ),
                old_fitness: current_fitness,
                new_fitness: best.predicted_fitness,
                improvement,
            });
        }
        if best.confidence < self.cfg.min_confidence {
            return Ok(EvolutionResult {
                strategy_id: id.clone(),
                success: false,
                outcome: TaskOutcome::Rejected,
                reason: format!(
                    "confidence {:.2} below threshold {:.2}",
                    best.confidence, self.cfg.min_confidence
                ),
                old_fitness: current_fitness,
                new_fitness: best.predicted_fitness,
                improvement,
            });
        }

        // A strategy retired mid-run completes but its result is discarded.
        if self.persistence.get(id).await?.is_retired() {
            return Ok(EvolutionResult::failure(
                id,
                TaskOutcome::Cancelled,
                "strategy retired while evolution was running",
            ));
        }

        let new_score = fitness::to_display_score(best.predicted_fitness);
        self.persistence
            .commit_genome(id, best.params.clone(), new_score, trigger, method)
            .await?;
        self.persistence.snapshot_strategy(id, "post_evolution").await?;

        if let Err(e) = self.lifecycle.evaluate(id, Utc::now()).await {
            warn!(strategy_id = %id, error = %e, "post-evolution lifecycle check failed");
        }

        info!(
            strategy_id = %id,
            improvement,
            confidence = best.confidence,
            method = method.as_str(),
            trigger,
            "evolution applied"
        );

        Ok(EvolutionResult {
            strategy_id: id.clone(),
            success: true,
            outcome: TaskOutcome::Applied,
            reason: format!("applied via {}", method.as_str()),
            old_fitness: current_fitness,
            new_fitness: best.predicted_fitness,
            improvement,
        })
    }

    /// Mutation batch at the fitness-selected tier, plus one crossover child
    /// when the strategy and a same-family partner are both elite.
    async fn build_candidates(
        &self,
        strategy: &Strategy,
        specs: &[ParamSpec],
        current_fitness: f64,
    ) -> Vec<(Genome, EvolutionMethod)> {
        let mut generator = self.generator.lock().unwrap();
        let mut candidates: Vec<(Genome, EvolutionMethod)> = generator
            .generate(specs, current_fitness)
            .into_iter()
            .map(|g| (g, EvolutionMethod::Mutation))
            .collect();

        if strategy.protection == ProtectionLevel::Elite {
            if let Some(partner) = self.elite_partner(strategy).await {
                let child = generator.crossover(&strategy.params, &partner.params);
                candidates.push((child, EvolutionMethod::Crossover));
            }
        }
        candidates
    }

    async fn elite_partner(&self, strategy: &Strategy) -> Option<Strategy> {
        self.persistence
            .all()
            .await
            .into_iter()
            .filter(|s| {
                s.id != strategy.id
                    && s.family == strategy.family
                    && s.protection == ProtectionLevel::Elite
                    && !s.is_retired()
            })
            .max_by(|a, b| {
                a.fitness_score
                    .partial_cmp(&b.fitness_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}
