use async_trait::async_trait;
use redis::AsyncCommands;
use shared_models::error::{EngineError, Result};
use shared_models::{
    CapitalSource, MetricsBundle, PerformanceFeed, Position, Strategy, SystemHealth,
};
use std::sync::Arc;
use tracing::debug;

use crate::persistence::Persistence;

/// Performance feed read from the keys the accounting subsystem publishes:
/// `strategies:active` (set of ids), `strategy:spec:{id}` (strategy JSON)
/// and `strategy:metrics:{id}:{window}h` (metrics bundle JSON).
pub struct RedisPerformanceFeed {
    client: redis::Client,
}

impl RedisPerformanceFeed {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| EngineError::Redis(format!("Failed to create Redis client: {}", e)))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::Redis(format!("Failed to connect to Redis: {}", e)))
    }
}

#[async_trait]
impl PerformanceFeed for RedisPerformanceFeed {
    async fn active_strategies(&self) -> Result<Vec<Strategy>> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn
            .smembers("strategies:active")
            .await
            .map_err(|e| EngineError::Redis(format!("SMEMBERS failed: {}", e)))?;

        let mut strategies = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn
                .get(format!("strategy:spec:{}", id))
                .await
                .map_err(|e| EngineError::Redis(format!("GET spec failed: {}", e)))?;
            match raw {
                Some(json) => strategies.push(serde_json::from_str(&json)?),
                None => debug!(strategy_id = %id, "active strategy has no published spec"),
            }
        }
        Ok(strategies)
    }

    async fn recent_metrics(
        &self,
        strategy_id: &str,
        window_hours: u32,
    ) -> Result<MetricsBundle> {
        let mut conn = self.connection().await?;
        let windowed: Option<String> = conn
            .get(format!("strategy:metrics:{}:{}h", strategy_id, window_hours))
            .await
            .map_err(|e| EngineError::Redis(format!("GET metrics failed: {}", e)))?;
        // Publishers that do not maintain windowed keys fall back to the
        // latest bundle.
        let raw = match windowed {
            Some(json) => json,
            None => {
                let latest: Option<String> = conn
                    .get(format!("strategy:metrics:{}", strategy_id))
                    .await
                    .map_err(|e| EngineError::Redis(format!("GET metrics failed: {}", e)))?;
                latest.ok_or_else(|| {
                    EngineError::InsufficientData(format!(
                        "no published metrics for strategy {}",
                        strategy_id
                    ))
                })?
            }
        };
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Balance and positions as published by the position manager.
pub struct RedisCapitalSource {
    client: redis::Client,
}

impl RedisCapitalSource {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| EngineError::Redis(format!("Failed to create Redis client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CapitalSource for RedisCapitalSource {
    async fn current_balance(&self) -> Result<f64> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::Redis(format!("Failed to connect to Redis: {}", e)))?;
        let raw: Option<String> = conn
            .get("portfolio:balance_usd")
            .await
            .map_err(|e| EngineError::Redis(format!("GET balance failed: {}", e)))?;
        raw.and_then(|v| v.parse().ok()).ok_or_else(|| {
            EngineError::InsufficientData("portfolio balance not published".into())
        })
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::Redis(format!("Failed to connect to Redis: {}", e)))?;
        let raw: Option<String> = conn
            .get("portfolio:positions")
            .await
            .map_err(|e| EngineError::Redis(format!("GET positions failed: {}", e)))?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }
}

/// Health source backed by the real collaborators: the strategy store and
/// the balance publisher.
pub struct LiveSystemHealth {
    persistence: Arc<Persistence>,
    redis_client: redis::Client,
}

impl LiveSystemHealth {
    pub fn new(persistence: Arc<Persistence>, redis_url: &str) -> Result<Self> {
        let redis_client = redis::Client::open(redis_url)
            .map_err(|e| EngineError::Redis(format!("Failed to create Redis client: {}", e)))?;
        Ok(Self {
            persistence,
            redis_client,
        })
    }
}

#[async_trait]
impl SystemHealth for LiveSystemHealth {
    async fn db_reachable(&self) -> bool {
        self.persistence.db_reachable().await
    }

    async fn balance_api_reachable(&self) -> bool {
        let Ok(mut conn) = self.redis_client.get_multiplexed_async_connection().await else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }
}
