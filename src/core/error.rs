use std::time::Duration;

use thiserror::Error;

use crate::transaction::BackendKind;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{entity} not found where {expression}")]
    NotFound { entity: String, expression: String },

    #[error("Property '{property}' not found on {entity}")]
    PropertyNotFound { entity: String, property: String },

    #[error(
        "Entity type mismatch: expected {expected}, got original {original} and latest {latest}"
    )]
    EntityTypeMismatch {
        expected: String,
        original: String,
        latest: String,
    },

    #[error("Entity '{0}' declares no surrogate key")]
    MissingSurrogateKey(String),

    #[error("Entity '{entity}' declares more than one surrogate key: {keys}")]
    AmbiguousSurrogateKey { entity: String, keys: String },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("{backend} error {code}: {message}")]
    Backend {
        backend: BackendKind,
        code: i32,
        message: String,
    },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction timed out after {0:?}")]
    TransactionTimeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Retry budget exhausted after {attempts} attempt(s): {message}")]
    RetryExhausted { attempts: u32, message: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RepoError {
    pub fn not_found(entity: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            expression: expression.into(),
        }
    }

    pub fn property_not_found(entity: impl Into<String>, property: impl Into<String>) -> Self {
        Self::PropertyNotFound {
            entity: entity.into(),
            property: property.into(),
        }
    }

    /// Backend error code, if this error came from a storage backend.
    pub fn backend_code(&self) -> Option<(&BackendKind, i32)> {
        match self {
            Self::Backend { backend, code, .. } => Some((backend, *code)),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::PropertyNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, RepoError>;

impl<T> From<std::sync::PoisonError<T>> for RepoError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RepoError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(failure, message) => {
                let message = message.unwrap_or_else(|| failure.to_string());
                if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                    Self::ConstraintViolation(message)
                } else {
                    Self::Backend {
                        backend: BackendKind::Sqlite,
                        code: failure.extended_code,
                        message,
                    }
                }
            }
            rusqlite::Error::InvalidColumnType(..) | rusqlite::Error::FromSqlConversionFailure(..) => {
                Self::TypeMismatch(err.to_string())
            }
            other => Self::Backend {
                backend: BackendKind::Sqlite,
                code: rusqlite::ffi::SQLITE_ERROR,
                message: other.to_string(),
            },
        }
    }
}
