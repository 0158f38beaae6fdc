use crate::config::TransferConfig;
use crate::error::Result;

/// Bounded retry for a single packet exchange.
///
/// Only retryable errors ([`crate::Error::is_retryable`]) trigger another
/// attempt; everything else, and the last failure, propagates unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u32,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, delay_ms: u32) -> Self {
        RetryPolicy {
            max_retries,
            delay_ms,
        }
    }

    pub const fn none() -> Self {
        Self::new(0, 0)
    }

    pub fn with_overrides(self, config: &TransferConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries.unwrap_or(self.max_retries),
            delay_ms: config.retry_delay_ms.unwrap_or(self.delay_ms),
        }
    }

    /// Run `attempt` until it succeeds or fails for good. The closure gets the
    /// zero-based attempt number so it can reset the line before a retry.
    pub fn run<T>(&self, mut attempt: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let mut n = 0;
        loop {
            match attempt(n) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && n < self.max_retries => {
                    tracing::debug!(attempt = n, error = %e, "retrying exchange");
                    n += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_retries_protocol_errors() {
        let policy = RetryPolicy::new(3, 0);
        let mut calls = 0;
        let value = policy
            .run(|n| {
                calls += 1;
                if n < 2 {
                    Err(Error::protocol("bad crc"))
                } else {
                    Ok(n)
                }
            })
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_exhaustion_propagates_last_error() {
        let policy = RetryPolicy::new(2, 0);
        let mut calls = 0;
        let err = policy
            .run::<()>(|_| {
                calls += 1;
                Err(Error::Timeout {
                    actual: 0,
                    expected: 4,
                })
            })
            .unwrap_err();
        assert_eq!(calls, 3);
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn test_terminal_errors_not_retried() {
        let policy = RetryPolicy::new(5, 0);
        let mut calls = 0;
        let err = policy
            .run::<()>(|_| {
                calls += 1;
                Err(Error::Cancelled)
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err, Error::Cancelled);
    }

    #[test]
    fn test_config_overrides() {
        let config = TransferConfig {
            timeout_ms: None,
            max_retries: Some(1),
            retry_delay_ms: None,
        };
        let policy = RetryPolicy::new(9, 100).with_overrides(&config);
        assert_eq!(policy, RetryPolicy::new(1, 100));
    }
}
