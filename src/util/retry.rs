use std::time::Duration;

use futures_retry::{ErrorHandler, RetryPolicy};

use crate::error::LockError;

/// Retries transport failures a fixed number of times with a fixed delay.
/// Everything else is forwarded on the first occurrence.
pub(crate) struct FixedCountWithDelayStrategy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedCountWithDelayStrategy {
    pub(crate) fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl ErrorHandler<LockError> for FixedCountWithDelayStrategy {
    type OutError = LockError;

    fn handle(&mut self, attempt: usize, e: LockError) -> RetryPolicy<LockError> {
        if attempt >= self.max_attempts {
            return RetryPolicy::ForwardError(e);
        }

        if e.is_retryable() {
            RetryPolicy::WaitRetry(self.delay)
        } else {
            RetryPolicy::ForwardError(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LockTableShard;

    fn unreachable() -> LockError {
        LockError::Unreachable {
            address: "cn-2".to_string(),
            reason: "refused".to_string(),
        }
    }

    #[test]
    fn retries_transport_errors_until_exhausted() {
        let mut s = FixedCountWithDelayStrategy::new(2, Duration::from_millis(5));
        assert!(matches!(s.handle(1, unreachable()), RetryPolicy::WaitRetry(_)));
        assert!(matches!(s.handle(2, unreachable()), RetryPolicy::ForwardError(_)));
    }

    #[test]
    fn forwards_binding_errors() {
        let mut s = FixedCountWithDelayStrategy::new(5, Duration::from_millis(5));
        let e = LockError::BindingLost {
            shard: LockTableShard::new(0, 1),
        };
        assert!(matches!(s.handle(1, e), RetryPolicy::ForwardError(_)));
    }
}
