use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{RepoError, Result};
use crate::transaction::{IsolationLevel, RetryPolicy, TransactionOptions, TransactionScopeOption};

/// Repository configuration
///
/// Retry settings are kept signed so that a negative value read from a
/// config file is reported by `validate` instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Backend connection string. For SQLite: a file path, `:memory:`,
    /// `sqlite://path` or `Data Source=path`.
    pub connection_string: String,

    /// Per-command timeout in seconds, also used as the SQLite busy timeout
    pub command_timeout_secs: u64,

    pub isolation_level: IsolationLevel,

    /// Per-attempt transaction timeout in seconds, 0 for unbounded
    pub transaction_timeout_secs: u64,

    pub scope_option: TransactionScopeOption,

    /// Total attempts for transactional operations
    pub deadlock_retry_count: i64,

    /// Delay between attempts in milliseconds
    pub deadlock_retry_wait_ms: i64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            connection_string: ":memory:".to_string(),
            command_timeout_secs: 30,
            isolation_level: IsolationLevel::ReadCommitted,
            transaction_timeout_secs: 0,
            scope_option: TransactionScopeOption::Required,
            deadlock_retry_count: 3,
            deadlock_retry_wait_ms: 100,
        }
    }
}

impl RepositoryConfig {
    pub fn new(connection_string: &str) -> Self {
        Self {
            connection_string: connection_string.to_string(),
            ..Self::default()
        }
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_secs = timeout.as_secs();
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout_secs = timeout.as_secs();
        self
    }

    pub fn scope_option(mut self, scope: TransactionScopeOption) -> Self {
        self.scope_option = scope;
        self
    }

    pub fn deadlock_retry_count(mut self, count: i64) -> Self {
        self.deadlock_retry_count = count;
        self
    }

    pub fn deadlock_retry_wait_ms(mut self, wait_ms: i64) -> Self {
        self.deadlock_retry_wait_ms = wait_ms;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(RepoError::InvalidConfig(
                "connection string must not be empty".into(),
            ));
        }
        self.retry_policy().map(|_| ())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(self.deadlock_retry_count, self.deadlock_retry_wait_ms)
    }

    pub fn command_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn transaction_timeout_duration(&self) -> Option<Duration> {
        (self.transaction_timeout_secs > 0)
            .then(|| Duration::from_secs(self.transaction_timeout_secs))
    }

    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions {
            isolation_level: self.isolation_level,
            timeout: self.transaction_timeout_duration(),
        }
    }

    /// Connection string with any SQLite prefix removed.
    pub fn sqlite_path(&self) -> &str {
        let raw = self.connection_string.trim();
        if let Some(path) = raw.strip_prefix("sqlite://") {
            return path;
        }
        match raw.split_once('=') {
            Some((key, path)) if key.trim().eq_ignore_ascii_case("data source") => path.trim(),
            _ => raw,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
