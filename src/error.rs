//! Error types for the quest engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Quest error: {0}")]
    Quest(#[from] QuestError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
///
/// `NotFound` is a normal outcome (absent record) and is kept distinct from
/// transport and query failures.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether this error only signals an absent record.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Quest lifecycle errors returned to callers.
#[derive(Debug, thiserror::Error)]
pub enum QuestError {
    #[error("Quest {id} not found")]
    NotFound { id: Uuid },

    #[error("Quest definition '{id}' not found")]
    DefinitionNotFound { id: String },

    #[error("Quest {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("No autonomous state for owner {owner}")]
    NoAutonomousState { owner: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Trigger system errors.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("Trigger {id} not found")]
    NotFound { id: Uuid },

    #[error("Event mailbox full (capacity {capacity}), event {event_id} dropped")]
    MailboxFull { capacity: usize, event_id: Uuid },

    #[error("Event mailbox closed")]
    Closed,

    #[error("Event consumer already started")]
    AlreadyStarted,

    #[error("Invalid trigger: {0}")]
    Validation(String),
}

/// Outbound notification errors. Always logged, never propagated into quest state.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification to {recipient} failed: {reason}")]
    SendFailed { recipient: i64, reason: String },

    #[error("Notification to {recipient} timed out after {timeout:?}")]
    Timeout { recipient: i64, timeout: Duration },

    #[error("HTTP error: {0}")]
    Http(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinct() {
        let err = DatabaseError::NotFound {
            entity: "quest".into(),
            id: "abc".into(),
        };
        assert!(err.is_not_found());
        assert!(!DatabaseError::Query("boom".into()).is_not_found());
    }

    #[test]
    fn top_level_wraps_sub_errors() {
        let err: Error = QuestError::DefinitionNotFound { id: "nope".into() }.into();
        assert_eq!(
            err.to_string(),
            "Quest error: Quest definition 'nope' not found"
        );
    }
}
