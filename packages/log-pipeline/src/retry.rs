use std::str::FromStr;
use std::time::Duration;

use crate::error::PipelineError;

const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

impl FromStr for RetryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(RetryStrategy::Linear),
            "exponential" => Ok(RetryStrategy::Exponential),
            other => Err(format!("unknown retry strategy '{other}'")),
        }
    }
}

/// Bounded retry budget for deliveries whose insert failed transiently.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: RetryStrategy::Linear,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// What the worker does with a delivery whose insert failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Put the message back on the queue after `delay`, as attempt `attempt`.
    Requeue { attempt: u32, delay: Duration },
    /// Route the message to the dead-letter queue.
    DeadLetter { reason: String },
}

impl RetryPolicy {
    /// Delay before retry number `retries` (zero-based).
    ///
    /// Linear: base * (retries + 1). Exponential: base * 2^retries.
    pub fn delay(&self, retries: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let ms = match self.strategy {
            RetryStrategy::Exponential => base_ms.saturating_mul(2u64.saturating_pow(retries)),
            RetryStrategy::Linear => base_ms.saturating_mul(retries as u64 + 1),
        };
        Duration::from_millis(ms).min(MAX_DELAY)
    }

    /// Decide between requeue and dead-letter for a delivery that has already
    /// been requeued `attempt` times.
    pub fn decide(&self, error: &PipelineError, attempt: u32) -> Disposition {
        if !error.is_transient() {
            return Disposition::DeadLetter {
                reason: error.to_string(),
            };
        }
        if attempt >= self.max_retries {
            return Disposition::DeadLetter {
                reason: format!("retry budget of {} exhausted: {error}", self.max_retries),
            };
        }
        Disposition::Requeue {
            attempt: attempt + 1,
            delay: self.delay(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RetryStrategy) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            strategy,
            base_delay: Duration::from_millis(200),
        }
    }

    #[test]
    fn linear_delays_grow_by_base() {
        let p = policy(RetryStrategy::Linear);
        assert_eq!(p.delay(0), Duration::from_millis(200));
        assert_eq!(p.delay(1), Duration::from_millis(400));
        assert_eq!(p.delay(2), Duration::from_millis(600));
    }

    #[test]
    fn exponential_delays_double_and_cap() {
        let p = policy(RetryStrategy::Exponential);
        assert_eq!(p.delay(0), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(1600));
        assert_eq!(p.delay(40), MAX_DELAY);
    }

    #[test]
    fn oversized_base_delay_saturates_to_cap() {
        let p = RetryPolicy {
            base_delay: Duration::MAX,
            ..policy(RetryStrategy::Linear)
        };
        assert_eq!(p.delay(0), MAX_DELAY);
        assert_eq!(p.delay(5), MAX_DELAY);
    }

    #[test]
    fn transient_failure_is_requeued_until_budget_runs_out() {
        let p = policy(RetryStrategy::Linear);
        let err = PipelineError::SinkUnavailable("connection refused".into());

        assert_eq!(
            p.decide(&err, 0),
            Disposition::Requeue {
                attempt: 1,
                delay: Duration::from_millis(200)
            }
        );
        assert!(matches!(p.decide(&err, 2), Disposition::Requeue { attempt: 3, .. }));
        assert!(matches!(p.decide(&err, 3), Disposition::DeadLetter { .. }));
    }

    #[test]
    fn poison_message_is_dead_lettered_on_first_failure() {
        let p = policy(RetryStrategy::Linear);
        let err = PipelineError::ConstraintViolation("invalid input syntax for type json".into());
        match p.decide(&err, 0) {
            Disposition::DeadLetter { reason } => assert!(reason.contains("json")),
            other => panic!("expected dead-letter, got {other:?}"),
        }
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Exponential".parse::<RetryStrategy>(), Ok(RetryStrategy::Exponential));
        assert_eq!("linear".parse::<RetryStrategy>(), Ok(RetryStrategy::Linear));
        assert!("fibonacci".parse::<RetryStrategy>().is_err());
    }
}
