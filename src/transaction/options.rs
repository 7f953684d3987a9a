use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        };
        write!(f, "{label}")
    }
}

/// How a transactional call relates to a transaction already open on the
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransactionScopeOption {
    /// Join the active transaction, or open one.
    #[default]
    Required,
    /// Always open a new transaction; fails if one is already active.
    RequiresNew,
    /// Run without a transaction.
    Suppress,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub isolation_level: IsolationLevel,
    /// Upper bound for one attempt, `None` for unbounded.
    pub timeout: Option<Duration>,
}

impl TransactionOptions {
    pub fn new(isolation_level: IsolationLevel) -> Self {
        Self {
            isolation_level,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
