use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database Error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Configuration Error: {0}")]
    Config(String),
    #[error("Redis Error: {0}")]
    Redis(String),
    #[error("Network Error: {0}")]
    Network(String),
    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    #[error("Invariant violated [{rule}]: {detail}")]
    Invariant { rule: &'static str, detail: String },
    #[error("Persistence Error: {0}")]
    Persistence(String),
}

impl From<prometheus::Error> for EngineError {
    fn from(error: prometheus::Error) -> Self {
        EngineError::Config(error.to_string())
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
