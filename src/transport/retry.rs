//! Bounded retries with exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::DeliveryError;
use crate::protocol::Message;

/// How many times a send is retried and how long to wait between attempts.
///
/// The delay before retry `n` (0-based) is `base * 2^n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retry_count: u32,
    base: Duration,
    max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    pub fn new(retry_count: u32, base: Duration, max: Duration) -> Self {
        Self {
            retry_count,
            base,
            max,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Delay to wait after failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// A single failed attempt.
#[derive(Debug, Clone)]
pub(crate) struct AttemptError {
    /// Status code if the endpoint answered.
    pub status: Option<u16>,
    pub reason: String,
}

/// Drive `attempt` until it succeeds or the policy is exhausted.
///
/// Each attempt receives its own copy of the message with
/// `metadata.retry_count` raised by the number of preceding attempts, so the
/// receiver can tell a retransmission from an original.
pub(crate) async fn deliver_with_retry<F, Fut>(
    policy: &RetryPolicy,
    url: &str,
    message: &Message,
    mut attempt: F,
) -> Result<serde_json::Value, DeliveryError>
where
    F: FnMut(Message) -> Fut,
    Fut: Future<Output = Result<serde_json::Value, AttemptError>>,
{
    let max_attempts = policy.max_attempts();
    let mut last_error = AttemptError {
        status: None,
        reason: "no attempt made".to_string(),
    };

    for n in 0..max_attempts {
        let mut copy = message.clone();
        copy.metadata.retry_count = message.metadata.retry_count.saturating_add(n);

        match attempt(copy).await {
            Ok(reply) => {
                if n > 0 {
                    tracing::debug!(url = %url, attempt = n + 1, "Delivered after retry");
                }
                return Ok(reply);
            }
            Err(e) => {
                tracing::warn!(
                    url = %url,
                    attempt = n + 1,
                    max_attempts,
                    status = ?e.status,
                    "Delivery attempt failed: {}",
                    e.reason
                );
                last_error = e;
            }
        }

        if n + 1 < max_attempts {
            tokio::time::sleep(policy.delay_for(n)).await;
        }
    }

    Err(DeliveryError {
        url: url.to_string(),
        last_status: last_error.status,
        attempts: max_attempts,
        reason: last_error.reason,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::protocol::{ControlCommand, Message};

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(63), Duration::from_millis(1000));
    }

    #[test]
    fn test_delays_never_decrease() {
        let policy = RetryPolicy::new(40, Duration::from_millis(7), Duration::from_secs(30));
        let delays: Vec<_> = (0..40).map(|n| policy.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_always_failing_attempts_exactly_retry_count_plus_one() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let message = Message::control("a", ControlCommand::Pause);

        let result = deliver_with_retry(&policy, "http://nowhere", &message, |copy| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(copy.metadata.retry_count);
                Err::<serde_json::Value, _>(AttemptError {
                    status: Some(503),
                    reason: "unavailable".to_string(),
                })
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_status, Some(503));
        assert_eq!(err.url, "http://nowhere");
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(1));
        let calls = Arc::new(Mutex::new(0u32));
        let message = Message::control("a", ControlCommand::Resume);

        let reply = deliver_with_retry(&policy, "http://flaky", &message, |_copy| {
            let calls = Arc::clone(&calls);
            async move {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                if *calls < 3 {
                    Err(AttemptError {
                        status: None,
                        reason: "connection refused".to_string(),
                    })
                } else {
                    Ok(json!({"status": "ok"}))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(reply["status"], "ok");
        assert_eq!(*calls.lock().unwrap(), 3);
    }
}
