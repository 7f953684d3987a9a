// ============================================================================
// Transaction Support
// ============================================================================
//
// Everything the transactional retry wrapper needs that is not tied to a
// particular session: options and scope, lifecycle state, the retry budget,
// per-backend transient-error classification and cooperative cancellation.
// Session-level staging (`PendingChange`) lives here as well.
//
// ============================================================================

pub mod cancel;
pub mod change;
pub mod classify;
pub mod options;
pub mod retry;
pub mod state;

pub use cancel::CancellationSignal;
pub use change::PendingChange;
pub use classify::{
    BackendKind, ClassifierRegistry, ErrorCodeClassifier, MEMORY_WRITE_CONFLICT,
    SQL_SERVER_DEADLOCK_VICTIM, SQLITE_BUSY, SQLITE_BUSY_RECOVERY, SQLITE_BUSY_SNAPSHOT,
    SQLITE_BUSY_TIMEOUT, SQLITE_LOCKED, TransientErrorClassifier, default_classifiers,
};
pub use options::{IsolationLevel, TransactionOptions, TransactionScopeOption};
pub use retry::RetryPolicy;
pub use state::{TransactionId, TransactionInfo, TransactionState};
