use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{RepoError, Result};

/// Fixed-delay retry budget for transient backend errors.
///
/// `attempts` is the total number of times an operation runs. Zero disables
/// retrying entirely: the first error is reported as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Validates signed inputs as they come from configuration.
    pub fn new(attempts: i64, delay_ms: i64) -> Result<Self> {
        if attempts < 0 {
            return Err(RepoError::InvalidConfig(format!(
                "deadlock retry count must be >= 0, got {attempts}"
            )));
        }
        if delay_ms < 0 {
            return Err(RepoError::InvalidConfig(format!(
                "deadlock retry wait must be >= 0 ms, got {delay_ms}"
            )));
        }
        let attempts = u32::try_from(attempts).map_err(|_| {
            RepoError::InvalidConfig(format!("deadlock retry count {attempts} is too large"))
        })?;

        Ok(Self {
            attempts,
            delay: Duration::from_millis(delay_ms as u64),
        })
    }

    pub fn from_parts(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    pub fn disabled() -> Self {
        Self::from_parts(0, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_disabled(&self) -> bool {
        self.attempts == 0
    }

    /// Whether a transient failure on attempt `attempt` (1-based) may be
    /// followed by another one.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_parts(3, Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_negative_values() {
        assert!(matches!(
            RetryPolicy::new(-1, 10),
            Err(RepoError::InvalidConfig(_))
        ));
        assert!(matches!(
            RetryPolicy::new(3, -10),
            Err(RepoError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_attempt_boundary() {
        let policy = RetryPolicy::new(3, 0).unwrap();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let disabled = RetryPolicy::new(0, 0).unwrap();
        assert!(disabled.is_disabled());
        assert!(!disabled.should_retry(1));
    }

    #[test]
    fn test_delay_in_millis() {
        let policy = RetryPolicy::new(1, 250).unwrap();
        assert_eq!(policy.delay(), Duration::from_millis(250));
    }
}
