/// Result type alias for repository and cache operations.
pub type Result<T> = std::result::Result<T, ReactionError>;

#[derive(Debug, thiserror::Error)]
pub enum ReactionError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReactionError {
    /// True for errors raised before any write was attempted.
    pub fn is_validation(&self) -> bool {
        matches!(self, ReactionError::Validation(_))
    }
}
