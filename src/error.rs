//! Typed failures of the ingestion and query core.
//!
//! Stage-local failures (`Extraction`, `Embedding`) are converted by the
//! orchestrator into a processing-log entry plus a terminal document status.
//! Query-time failures propagate to the caller, except
//! [`Error::ToolInfrastructure`], which never leaves the query service.

use thiserror::Error;

use crate::models::FileType;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    /// Unsupported, corrupt or oversized input.
    #[error("extraction failed for {file_type} input: {reason}")]
    Extraction { file_type: FileType, reason: String },

    /// Embedding provider failure after retries were exhausted.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// Query or upsert used a model other than the collection's.
    #[error("embedding model mismatch: collection uses '{expected}', got '{actual}'")]
    ModelMismatch { expected: String, actual: String },

    /// Answer-model failure (including timeouts).
    #[error("generation failed: {0}")]
    Generation(String),

    /// The tool channel is broken (discovery or invocation).
    #[error("tool infrastructure failure: {0}")]
    ToolInfrastructure(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// Persistence collaborator failure.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn extraction(file_type: FileType, reason: impl Into<String>) -> Self {
        Self::Extraction {
            file_type,
            reason: reason.into(),
        }
    }

    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Message safe to show to an end user. Internal detail is only logged.
    pub fn user_message(&self) -> String {
        match self {
            Error::Generation(_) => {
                "The answer service is temporarily unavailable. Please try again later.".to_string()
            }
            Error::ModelMismatch { .. } => {
                "The document index was built with a different embedding model; re-index before querying."
                    .to_string()
            }
            Error::DocumentNotFound(id) => format!("Document {} was not found.", id),
            _ => "The request could not be completed.".to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(format!("serialization: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_error_names_file_type() {
        let err = Error::extraction(FileType::Csv, "bad quoting");
        assert_eq!(
            err.to_string(),
            "extraction failed for csv input: bad quoting"
        );
    }

    #[test]
    fn generation_user_message_hides_detail() {
        let err = Error::generation("HTTP 500 from upstream: secret-key-123");
        assert!(!err.user_message().contains("secret"));
    }
}
