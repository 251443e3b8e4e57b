use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Network, timeout or other retryable failure.
    #[error("Transient store error: {0}")]
    Transient(String),

    /// A key holds a different structure than the operation expects. Retrying
    /// cannot fix this.
    #[error("Wrong structure type at key: {0}")]
    WrongType(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn is_wrong_type(&self) -> bool {
        matches!(self, StoreError::WrongType(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.code() == Some("WRONGTYPE") {
            StoreError::WrongType(e.to_string())
        } else {
            StoreError::Transient(e.to_string())
        }
    }
}

impl From<rmq_common::ModelError> for StoreError {
    fn from(e: rmq_common::ModelError) -> Self {
        match e {
            rmq_common::ModelError::Malformed(e) => StoreError::Serialization(e),
            rmq_common::ModelError::InvalidQueue(msg) => StoreError::InvalidMessage(msg),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
