//! Error types for the statistics core

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Batch interrupted after {processed} items")]
    Interrupted { processed: usize },
}

impl StatsError {
    /// True for errors produced by a cancelled token rather than a failing store.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StatsError::Cancelled | StatsError::Interrupted { .. })
    }
}

pub type Result<T> = std::result::Result<T, StatsError>;
