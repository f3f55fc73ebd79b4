//! The guarded remote call.

use std::future::Future;

use tracing::debug;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::error::{GuardedError, RemoteError};
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryConfig, ThrottleRetry};

/// Process-wide flow control: one rate limiter, one circuit breaker and the
/// throttle retry policy, composed around every remote call.
#[derive(Debug)]
pub struct FlowControl {
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    retry: ThrottleRetry,
}

impl FlowControl {
    pub fn new(limiter: RateLimiter, breaker: CircuitBreakerConfig, retry: RetryConfig) -> Self {
        Self {
            limiter,
            breaker: CircuitBreaker::new(breaker),
            retry: ThrottleRetry::new(retry),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Acquire a rate-limiter slot, pass the breaker gate, run `op` with
    /// throttle retries, and report the result to the breaker.
    ///
    /// The breaker hears about every exit path: if the returned future is
    /// dropped or `op` panics mid-call, the call counts as a failure.
    pub async fn call<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, GuardedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.limiter.acquire().await;
        self.breaker.before_call()?;

        let guard = CallGuard {
            breaker: &self.breaker,
            settled: false,
        };
        let result = self.retry.run(operation, op).await;
        match &result {
            Err(err) if err.is_endpoint_failure() => {
                debug!(operation, error = %err, "remote call failed");
                guard.settle(false);
            }
            _ => guard.settle(true),
        }
        result.map_err(GuardedError::Remote)
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(
            RateLimiter::default(),
            CircuitBreakerConfig::default(),
            RetryConfig::default(),
        )
    }
}

/// Reports a failure to the breaker unless settled explicitly.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.on_success();
        } else {
            self.breaker.on_failure();
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_failure();
        }
    }
}
