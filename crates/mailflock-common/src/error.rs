//! Error types for Mailflock

use std::collections::BTreeMap;
use thiserror::Error;

/// Field name to human readable message, as produced by the entity validators
pub type FieldErrors = BTreeMap<String, String>;

/// Main error type for Mailflock
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// The transaction was rolled back; the whole operation may be retried.
    #[error("Transient storage failure: {0}")]
    TransientStorageFailure(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation failed: {}", format_fields(.0))]
    ValidationFailed(FieldErrors),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// A protocol precondition was violated by the caller.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Mailflock
pub type Result<T> = std::result::Result<T, Error>;

fn format_fields(fields: &FieldErrors) -> String {
    fields
        .iter()
        .map(|(field, message)| format!("{}: {}", field, message))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Build a validation error for a single field
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut fields = FieldErrors::new();
        fields.insert(field.into(), message.into());
        Error::ValidationFailed(fields)
    }

    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::TransientStorageFailure(_) => 503,
            Error::Storage(_) => 500,
            Error::ValidationFailed(_) => 422,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::InvalidState(_) => 409,
            Error::Publish(_) => 502,
            Error::Cancelled => 499,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::TransientStorageFailure(_) => "TRANSIENT_STORAGE_FAILURE",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::ValidationFailed(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::Publish(_) => "PUBLISH_ERROR",
            Error::Cancelled => "CANCELLED",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the whole operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientStorageFailure(_) | Error::Publish(_))
    }
}
