use thiserror::Error;

/// Domain-level validation errors.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DomainError {
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("unknown element symbol: {0}")]
    UnknownElement(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for DomainError {
    fn from(e: serde_json::Error) -> Self {
        DomainError::SerializationError(e.to_string())
    }
}
