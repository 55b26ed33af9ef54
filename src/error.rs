//! Error types for the candidate intake pipeline.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
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

/// Mail-source errors (IMAP or Gmail).
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("Authentication failed for {account}")]
    AuthFailed { account: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error from mail API: {status} {body}")]
    Http { status: u16, body: String },

    #[error("Message {0} not found")]
    MessageNotFound(String),

    #[error("Attachment {attachment_id} not found on message {message_id}")]
    AttachmentNotFound {
        message_id: String,
        attachment_id: String,
    },

    #[error("Failed to parse message {id}: {reason}")]
    Parse { id: String, reason: String },

    #[error("Mail task failed: {0}")]
    Task(String),
}

/// Extraction backend errors. All of these are recoverable per document.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Backend {backend} request failed: {reason}")]
    RequestFailed { backend: String, reason: String },

    #[error("Backend {backend} rate limited, retry after {retry_after:?}")]
    RateLimited {
        backend: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {backend}: {reason}")]
    InvalidResponse { backend: String, reason: String },

    #[error("Extraction output is not JSON: {0}")]
    MalformedOutput(String),

    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Document {filename} is unreadable: {reason}")]
    UnreadableDocument { filename: String, reason: String },
}

impl ExtractionError {
    /// False when the document was refused before any request went out.
    pub fn reached_backend(&self) -> bool {
        !matches!(self, Self::UnreadableDocument { .. })
    }
}

/// Pipeline-level errors raised by the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Mail source error: {0}")]
    Mail(#[from] MailError),

    #[error("Invalid timezone '{0}' (expected an offset such as +02:00)")]
    InvalidTimezone(String),

    #[error("Invalid target day: {0}")]
    InvalidDay(String),

    #[error("Run infrastructure failure: {0}")]
    Infrastructure(String),
}

/// Why a trigger did not produce a run report.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("A run is already in progress")]
    Busy,

    #[error("Invalid target day: {0}")]
    InvalidDay(String),

    #[error("Run infrastructure failure: {0}")]
    Infrastructure(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn load_imap() -> Result<String> {
        let host = std::env::var("INTAKE_TEST_NEVER_SET_HOST")
            .map_err(|_| ConfigError::MissingEnvVar("INTAKE_IMAP_HOST".into()))?;
        Ok(host)
    }

    #[test]
    fn domain_errors_convert_at_the_boundary() {
        let err = load_imap().unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::MissingEnvVar(_))));
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing required environment variable: INTAKE_IMAP_HOST"
        );

        let err: Error = ExtractionError::Timeout(Duration::from_secs(2)).into();
        assert!(err.to_string().starts_with("Extraction error: "));
    }

    #[test]
    fn only_refused_documents_skip_the_backend() {
        let refused = ExtractionError::UnreadableDocument {
            filename: "notes.txt".into(),
            reason: "unsupported".into(),
        };
        assert!(!refused.reached_backend());
        assert!(ExtractionError::Timeout(Duration::from_secs(1)).reached_backend());
    }
}
