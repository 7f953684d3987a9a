// ============================================================================
// Transient Error Classification
// ============================================================================
//
// The retry loop never inspects error codes itself. Each backend registers a
// classifier; an error is transient only when the classifier registered for
// the error's backend says so. Errors that carry no backend code are never
// transient.
//
// ============================================================================

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::core::RepoError;

/// Deadlock victim.
pub const SQL_SERVER_DEADLOCK_VICTIM: i32 = 1205;

pub const SQLITE_BUSY: i32 = 5;
pub const SQLITE_LOCKED: i32 = 6;
pub const SQLITE_BUSY_RECOVERY: i32 = 261;
pub const SQLITE_BUSY_SNAPSHOT: i32 = 517;
pub const SQLITE_BUSY_TIMEOUT: i32 = 773;

/// Raised by the in-memory session when a concurrent writer got there first.
pub const MEMORY_WRITE_CONFLICT: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackendKind {
    SqlServer,
    Sqlite,
    InMemory,
    Custom(&'static str),
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SqlServer => write!(f, "SQL Server"),
            Self::Sqlite => write!(f, "SQLite"),
            Self::InMemory => write!(f, "in-memory"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

pub trait TransientErrorClassifier: Send + Sync {
    fn is_transient(&self, error: &RepoError) -> bool;
}

impl<F> TransientErrorClassifier for F
where
    F: Fn(&RepoError) -> bool + Send + Sync,
{
    fn is_transient(&self, error: &RepoError) -> bool {
        self(error)
    }
}

/// Matches backend errors from one backend against a fixed code list.
#[derive(Debug, Clone)]
pub struct ErrorCodeClassifier {
    backend: BackendKind,
    codes: Vec<i32>,
}

impl ErrorCodeClassifier {
    pub fn new(backend: BackendKind, codes: impl Into<Vec<i32>>) -> Self {
        Self {
            backend,
            codes: codes.into(),
        }
    }

    pub fn sql_server() -> Self {
        Self::new(BackendKind::SqlServer, [SQL_SERVER_DEADLOCK_VICTIM])
    }

    pub fn sqlite() -> Self {
        Self::new(
            BackendKind::Sqlite,
            [
                SQLITE_BUSY,
                SQLITE_BUSY_RECOVERY,
                SQLITE_BUSY_SNAPSHOT,
                SQLITE_BUSY_TIMEOUT,
                SQLITE_LOCKED,
            ],
        )
    }

    pub fn in_memory() -> Self {
        Self::new(BackendKind::InMemory, [MEMORY_WRITE_CONFLICT])
    }

    pub fn codes(&self) -> &[i32] {
        &self.codes
    }
}

impl TransientErrorClassifier for ErrorCodeClassifier {
    fn is_transient(&self, error: &RepoError) -> bool {
        match error.backend_code() {
            Some((backend, code)) => *backend == self.backend && self.codes.contains(&code),
            None => false,
        }
    }
}

#[derive(Clone, Default)]
pub struct ClassifierRegistry {
    classifiers: HashMap<BackendKind, Arc<dyn TransientErrorClassifier>>,
}

impl ClassifierRegistry {
    /// Registry with no classifiers: nothing is transient.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(BackendKind::SqlServer, ErrorCodeClassifier::sql_server())
            .register(BackendKind::Sqlite, ErrorCodeClassifier::sqlite())
            .register(BackendKind::InMemory, ErrorCodeClassifier::in_memory());
        registry
    }

    /// Adds or replaces the classifier for `backend`.
    pub fn register<C>(&mut self, backend: BackendKind, classifier: C) -> &mut Self
    where
        C: TransientErrorClassifier + 'static,
    {
        self.classifiers.insert(backend, Arc::new(classifier));
        self
    }

    pub fn get(&self, backend: &BackendKind) -> Option<Arc<dyn TransientErrorClassifier>> {
        self.classifiers.get(backend).cloned()
    }

    pub fn contains(&self, backend: &BackendKind) -> bool {
        self.classifiers.contains_key(backend)
    }

    /// Whether `error`, raised while talking to `backend`, may succeed on retry.
    pub fn is_transient(&self, backend: &BackendKind, error: &RepoError) -> bool {
        self.classifiers
            .get(backend)
            .is_some_and(|classifier| classifier.is_transient(error))
    }
}

impl fmt::Debug for ClassifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierRegistry")
            .field("backends", &self.classifiers.keys().collect::<Vec<_>>())
            .finish()
    }
}

lazy_static! {
    static ref DEFAULT_CLASSIFIERS: ClassifierRegistry = ClassifierRegistry::with_defaults();
}

/// Shared registry with the built-in backends.
pub fn default_classifiers() -> ClassifierRegistry {
    DEFAULT_CLASSIFIERS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_error(backend: BackendKind, code: i32) -> RepoError {
        RepoError::Backend {
            backend,
            code,
            message: "lock".into(),
        }
    }

    #[test]
    fn test_sqlite_busy_family_is_transient() {
        let registry = ClassifierRegistry::with_defaults();
        for code in [5, 261, 517, 773, 6] {
            assert!(
                registry.is_transient(&BackendKind::Sqlite, &backend_error(BackendKind::Sqlite, code)),
                "code {code}"
            );
        }
        assert!(!registry.is_transient(&BackendKind::Sqlite, &backend_error(BackendKind::Sqlite, 19)));
    }

    #[test]
    fn test_sql_server_deadlock_is_transient() {
        let registry = ClassifierRegistry::with_defaults();
        let deadlock = backend_error(BackendKind::SqlServer, 1205);
        assert!(registry.is_transient(&BackendKind::SqlServer, &deadlock));
        // a SQL Server code means nothing to the SQLite classifier
        assert!(!registry.is_transient(&BackendKind::Sqlite, &deadlock));
    }

    #[test]
    fn test_non_backend_errors_are_never_transient() {
        let registry = ClassifierRegistry::with_defaults();
        assert!(!registry.is_transient(&BackendKind::Sqlite, &RepoError::not_found("Widget", "id = 1")));
        assert!(!registry.is_transient(&BackendKind::Sqlite, &RepoError::Cancelled));
    }

    #[test]
    fn test_custom_backend_registration() {
        let mut registry = ClassifierRegistry::new();
        assert!(!registry.contains(&BackendKind::Custom("pg")));

        registry.register(BackendKind::Custom("pg"), |err: &RepoError| {
            matches!(err.backend_code(), Some((_, 40001)))
        });

        let serialization_failure = backend_error(BackendKind::Custom("pg"), 40001);
        assert!(registry.is_transient(&BackendKind::Custom("pg"), &serialization_failure));
        assert!(!registry.is_transient(&BackendKind::Sqlite, &serialization_failure));
    }
}
