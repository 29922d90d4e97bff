//! Error type shared by every LarkBot crate.

use thiserror::Error;

/// Result alias used across LarkBot.
pub type Result<T> = std::result::Result<T, LarkBotError>;

#[derive(Debug, Error)]
pub enum LarkBotError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Action failed: {0}")]
    Action(String),

    #[error("Unknown action type: {0}")]
    UnknownAction(String),

    #[error("Unknown trigger type: {0}")]
    UnknownTrigger(String),

    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl LarkBotError {
    /// Structural errors describe a broken configuration; retry loops must
    /// never swallow them.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            LarkBotError::Config(_)
                | LarkBotError::UnknownAction(_)
                | LarkBotError::UnknownTrigger(_)
                | LarkBotError::CircularDependency(_)
        )
    }
}
