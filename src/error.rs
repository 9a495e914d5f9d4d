use serde::Serialize;
use thiserror::Error;

/// A single rejected field in a validation failure.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub value: serde_json::Value,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            value,
        }
    }
}

#[derive(Error, Debug)]
pub enum CronworkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation failed: {}", format_fields(.details))]
    Validation { details: Vec<FieldError> },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error(transparent)]
    Cron(#[from] crate::cron::CronError),

    #[error("Execution timed out after {timeout_ms} ms")]
    ExecutionTimeout { timeout_ms: i64 },

    #[error("Executor error: {message}")]
    Executor { message: String },
}

impl CronworkError {
    pub fn validation(details: Vec<FieldError>) -> Self {
        Self::Validation { details }
    }

    /// Validation and not-found errors are caller mistakes, not faults.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::JobNotFound { .. } | Self::Cron(_)
        )
    }
}

fn format_fields(details: &[FieldError]) -> String {
    details
        .iter()
        .map(|d| d.field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_error_lists_fields() {
        let err = CronworkError::validation(vec![
            FieldError::new("name", "name must not be empty", json!("")),
            FieldError::new("cronExpression", "invalid cron expression", json!("bogus")),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("name"));
        assert!(msg.contains("cronExpression"));
        assert!(err.is_client_error());
    }

    #[test]
    fn database_errors_are_not_client_errors() {
        let err = CronworkError::Database(sqlx::Error::PoolTimedOut);
        assert!(!err.is_client_error());
    }
}
