//! Bounded exponential backoff for registry calls

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::types::Result;

/// Retry policy for transient registry failures
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the second attempt
    pub initial: Duration,
    /// Upper bound on any single delay
    pub max: Duration,
    /// Total attempts per operation, including the first
    pub max_attempts: u32,
    /// Relative jitter applied to each delay (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self.initial.saturating_mul(1u32 << exp).min(self.max);

        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor.max(0.0)).min(self.max)
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Only errors classified as transient are retried. `op` receives the
/// 1-based attempt number.
pub async fn retry<T, F, Fut>(config: &BackoffConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = config.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Registry call failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GatewayError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            max_attempts: 4,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let config = no_jitter();
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
        assert_eq!(config.delay_for(4), Duration::from_millis(500));
        assert_eq!(config.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = BackoffConfig {
            jitter: 0.2,
            ..no_jitter()
        };
        for _ in 0..100 {
            let d = config.delay_for(2);
            assert!(d >= Duration::from_millis(160) && d <= Duration::from_millis(240));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = retry(&no_jitter(), "renew", |_| async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GatewayError::Http("connection refused".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<()> = retry(&no_jitter(), "register", |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Timeout("slow".into()))
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<()> = retry(&no_jitter(), "renew", |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::NotFound("svc/a".into()))
        })
        .await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
