use axum::{http::StatusCode, response::Json, routing::get, Router};
use redis::Client;
use serde_json::{json, Value};
use shared_models::error::{EngineError, Result};
use std::sync::Arc;

use crate::persistence::Persistence;

pub struct HealthChecker {
    redis_client: Client,
    persistence: Arc<Persistence>,
}

impl HealthChecker {
    pub fn new(redis_client: Client, persistence: Arc<Persistence>) -> Self {
        Self {
            redis_client,
            persistence,
        }
    }

    pub async fn check_redis(&self) -> Result<bool> {
        let mut conn = self
            .redis_client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::Redis(format!("Failed to connect to Redis: {}", e)))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| EngineError::Redis(format!("Redis PING failed: {}", e)))?;

        Ok(true)
    }

    pub async fn check_store(&self) -> bool {
        self.persistence.db_reachable().await
    }

    pub async fn get_health_status(&self) -> Value {
        let mut status = json!({
            "service": "evolution_engine",
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "checks": {}
        });

        let redis_healthy = match self.check_redis().await {
            Ok(true) => {
                status["checks"]["redis"] = json!({"status": "healthy", "message": "Connected"});
                true
            }
            Ok(false) | Err(_) => {
                status["checks"]["redis"] =
                    json!({"status": "unhealthy", "message": "Connection failed"});
                false
            }
        };

        let store_healthy = if self.check_store().await {
            status["checks"]["store"] = json!({"status": "healthy", "message": "Connected"});
            true
        } else {
            status["checks"]["store"] =
                json!({"status": "unhealthy", "message": "Strategy store unreachable"});
            false
        };

        if redis_healthy && store_healthy {
            status["status"] = json!("healthy");
        } else {
            status["status"] = json!("unhealthy");
        }

        status
    }
}

pub async fn health_handler(
    axum::extract::State(health_checker): axum::extract::State<Arc<HealthChecker>>,
) -> std::result::Result<Json<Value>, StatusCode> {
    let status = health_checker.get_health_status().await;

    if status["status"] == "healthy" {
        Ok(Json(status))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

pub async fn readiness_handler(
    axum::extract::State(health_checker): axum::extract::State<Arc<HealthChecker>>,
) -> std::result::Result<Json<Value>, StatusCode> {
    // Readiness needs the store: the engine admits no evolution work while
    // commits cannot be durably written.
    let store_ready = health_checker.check_store().await;

    let status = json!({
        "service": "evolution_engine",
        "ready": store_ready,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "checks": {
            "store": {"ready": store_ready}
        }
    });

    if store_ready {
        Ok(Json(status))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

pub fn create_health_router(health_checker: Arc<HealthChecker>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_checker)
}
