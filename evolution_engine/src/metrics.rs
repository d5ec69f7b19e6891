use axum::{http::StatusCode, response::Response, routing::get, Router};
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use shared_models::error::{EngineError, Result};
use shared_models::{EvolutionResult, Strategy, TaskOutcome};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub struct Metrics {
    pub evolutions_applied: Counter,
    pub evolutions_rejected: Counter,
    pub evolutions_failed: Counter,
    pub evolutions_cancelled: Counter,
    pub population_size: Gauge,
    pub retired_strategies: Gauge,
    pub average_fitness: Gauge,
    pub best_fitness: Gauge,
    pub queue_depth: Gauge,
    pub capital_utilization: Gauge,
    pub evolution_tick_seconds: Histogram,
    registry: Registry,
}

impl Metrics {
    pub fn new(metrics_port: Option<u16>) -> Result<Arc<Self>> {
        let registry = Registry::new();

        let evolutions_applied = Counter::with_opts(Opts::new(
            "evolutions_applied_total",
            "Evolution tasks whose best candidate was committed",
        ))
        .map_err(|e| EngineError::Config(format!("Failed to create evolutions_applied: {}", e)))?;

        let evolutions_rejected = Counter::with_opts(Opts::new(
            "evolutions_rejected_total",
            "Evolution tasks rejected below the improvement or confidence bar",
        ))?;

        let evolutions_failed = Counter::with_opts(Opts::new(
            "evolutions_failed_total",
            "Evolution tasks that ended in an error outcome",
        ))?;

        let evolutions_cancelled = Counter::with_opts(Opts::new(
            "evolutions_cancelled_total",
            "Evolution tasks dropped because the strategy retired",
        ))?;

        let population_size = Gauge::with_opts(Opts::new(
            "strategy_population_size",
            "Strategies currently in the registry, retired included",
        ))?;

        let retired_strategies = Gauge::with_opts(Opts::new(
            "strategies_retired",
            "Strategies currently in the retired tier",
        ))?;

        let average_fitness = Gauge::with_opts(Opts::new(
            "population_average_fitness_score",
            "Mean fitness score of live strategies on the 0-100 scale",
        ))?;

        let best_fitness = Gauge::with_opts(Opts::new(
            "population_best_fitness_score",
            "Highest fitness score among live strategies on the 0-100 scale",
        ))?;

        let queue_depth = Gauge::with_opts(Opts::new(
            "evolution_queue_depth",
            "Strategies waiting in the evolution queue",
        ))?;

        let capital_utilization = Gauge::with_opts(Opts::new(
            "capital_utilization_ratio",
            "Sum of per-strategy capital allocation ratios",
        ))?;

        let evolution_tick_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "evolution_tick_seconds",
                "Wall time of one evolution queue drain",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )?;

        registry
            .register(Box::new(evolutions_applied.clone()))
            .map_err(|e| {
                EngineError::Config(format!("Failed to register evolutions_applied: {}", e))
            })?;
        registry.register(Box::new(evolutions_rejected.clone()))?;
        registry.register(Box::new(evolutions_failed.clone()))?;
        registry.register(Box::new(evolutions_cancelled.clone()))?;
        registry.register(Box::new(population_size.clone()))?;
        registry.register(Box::new(retired_strategies.clone()))?;
        registry.register(Box::new(average_fitness.clone()))?;
        registry.register(Box::new(best_fitness.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(capital_utilization.clone()))?;
        registry.register(Box::new(evolution_tick_seconds.clone()))?;

        let metrics = Arc::new(Self {
            evolutions_applied,
            evolutions_rejected,
            evolutions_failed,
            evolutions_cancelled,
            population_size,
            retired_strategies,
            average_fitness,
            best_fitness,
            queue_depth,
            capital_utilization,
            evolution_tick_seconds,
            registry,
        });

        if let Some(port) = metrics_port {
            let metrics_clone = metrics.clone();
            tokio::spawn(async move {
                if let Err(e) = start_metrics_server(port, metrics_clone).await {
                    error!("Failed to start metrics server: {}", e);
                }
            });
        }

        Ok(metrics)
    }

    pub fn get_registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_results(&self, results: &[EvolutionResult]) {
        for result in results {
            match result.outcome {
                TaskOutcome::Applied => self.evolutions_applied.inc(),
                TaskOutcome::Rejected => self.evolutions_rejected.inc(),
                TaskOutcome::Failed => self.evolutions_failed.inc(),
                TaskOutcome::Cancelled => self.evolutions_cancelled.inc(),
            }
        }
    }

    pub fn update_population(&self, strategies: &[Strategy]) {
        self.population_size.set(strategies.len() as f64);
        let retired = strategies.iter().filter(|s| s.is_retired()).count();
        self.retired_strategies.set(retired as f64);

        let live: Vec<&Strategy> = strategies.iter().filter(|s| !s.is_retired()).collect();
        if live.is_empty() {
            self.average_fitness.set(0.0);
            self.best_fitness.set(0.0);
        } else {
            let sum: f64 = live.iter().map(|s| s.fitness_score).sum();
            self.average_fitness.set(sum / live.len() as f64);
            let best = live
                .iter()
                .map(|s| s.fitness_score)
                .fold(f64::MIN, f64::max);
            self.best_fitness.set(best);
        }

        let utilization: f64 = strategies.iter().map(|s| s.capital_allocation).sum();
        self.capital_utilization.set(utilization);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    pub fn observe_evolution_tick(&self, duration_seconds: f64) {
        self.evolution_tick_seconds.observe(duration_seconds);
    }
}

async fn start_metrics_server(port: u16, metrics: Arc<Metrics>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .map_err(|e| EngineError::Network(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on http://0.0.0.0:{}/metrics", port);

    axum::serve(listener, app)
        .await
        .map_err(|e| EngineError::Network(format!("Metrics server failed: {}", e)))?;

    Ok(())
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Arc<Metrics>>,
) -> std::result::Result<Response<String>, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = metrics.get_registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(output) => Ok(Response::builder()
            .header("content-type", "text/plain; version=0.0.4")
            .body(output)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
