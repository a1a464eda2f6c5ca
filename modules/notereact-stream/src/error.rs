/// Result type alias for log operations.
pub type Result<T> = std::result::Result<T, LogError>;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Consumer group {group:?} already exists on {stream:?}")]
    GroupExists { stream: String, group: String },

    #[error("No consumer group {group:?} on {stream:?}")]
    NoSuchGroup { stream: String, group: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
