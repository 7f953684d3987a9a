use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{RepoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    /// Retry budget exhausted on a transient backend error.
    FatalError,
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::FatalError => write!(f, "FatalError"),
        }
    }
}

/// Outcome of a transactionally retried operation.
///
/// `Failure` is reserved for retry exhaustion on transient lock errors and
/// never carries an error value; every other error is `Fatal`.
#[derive(Debug)]
pub enum OperationResult<T> {
    Success(T),
    Failure {
        code: ResultCode,
        message: String,
        attempts: u32,
    },
    Fatal(RepoError),
}

impl<T> OperationResult<T> {
    pub fn exhausted(attempts: u32, message: impl Into<String>) -> Self {
        Self::Failure {
            code: ResultCode::FatalError,
            message: message.into(),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn code(&self) -> Option<ResultCode> {
        match self {
            Self::Success(_) => Some(ResultCode::Success),
            Self::Failure { code, .. } => Some(*code),
            Self::Fatal(_) => None,
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            Self::Success(_) => None,
            Self::Failure { message, .. } => Some(message.clone()),
            Self::Fatal(err) => Some(err.to_string()),
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> OperationResult<U> {
        match self {
            Self::Success(value) => OperationResult::Success(f(value)),
            Self::Failure {
                code,
                message,
                attempts,
            } => OperationResult::Failure {
                code,
                message,
                attempts,
            },
            Self::Fatal(err) => OperationResult::Fatal(err),
        }
    }

    /// Collapses the outcome into a plain `Result`; `Failure` becomes
    /// [`RepoError::RetryExhausted`].
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure {
                message, attempts, ..
            } => Err(RepoError::RetryExhausted { attempts, message }),
            Self::Fatal(err) => Err(err),
        }
    }
}

impl<T> From<Result<T>> for OperationResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) => Self::Fatal(err),
        }
    }
}
