//! Retry orchestration.
//!
//! A retry decision is a pure function of the request's history and the
//! reason at hand. Reasons flagged as always-retry use a fixed controlled
//! back-off; every other reason is delegated to the request's strategy.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cbcore_errors::RetryReason;
use rand::Rng;
use tracing::debug;

/// What a strategy wants done with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    NoRetry,
    RetryAfter(Duration),
}

/// The view of a request a retry strategy gets to see.
pub trait RetryRequest: Send + Sync {
    fn retry_attempts(&self) -> u32;
    fn identifier(&self) -> String;
    fn idempotent(&self) -> bool;
    fn retry_reasons(&self) -> Vec<RetryReason>;
    fn retry_strategy(&self) -> Option<Arc<dyn RetryStrategy>>;
    fn record_retry_attempt(&self, reason: RetryReason);
}

/// Decides whether and when a failed request runs again.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    fn retry_after(&self, req: &dyn RetryRequest, reason: RetryReason) -> RetryAction;
}

/// Never retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn retry_after(&self, _req: &dyn RetryRequest, _reason: RetryReason) -> RetryAction {
        RetryAction::NoRetry
    }
}

/// Exponential back-off with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomised away, 0.0 to 1.0.
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_us = self.initial_delay.as_micros() as f64 * self.multiplier.powi(attempt as i32);
        let capped = delay_us.min(self.max_delay.as_micros() as f64);
        let jittered = if self.jitter > 0.0 {
            let factor = 1.0 - rand::thread_rng().gen_range(0.0..self.jitter);
            capped * factor
        } else {
            capped
        };
        Duration::from_micros(jittered as u64)
    }
}

/// Retries whenever the reason permits it for the request, backing off exponentially.
#[derive(Debug, Clone, Default)]
pub struct BestEffortRetryStrategy {
    backoff: ExponentialBackoff,
}

impl BestEffortRetryStrategy {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self { backoff }
    }
}

impl RetryStrategy for BestEffortRetryStrategy {
    fn retry_after(&self, req: &dyn RetryRequest, reason: RetryReason) -> RetryAction {
        if req.idempotent() || reason.allows_non_idempotent_retry() {
            RetryAction::RetryAfter(self.backoff.delay_for_attempt(req.retry_attempts()))
        } else {
            RetryAction::NoRetry
        }
    }
}

/// Fixed back-off ladder for reasons that always retry.
pub fn controlled_backoff(attempts: u32) -> Duration {
    let ms = match attempts {
        0 => 1,
        1 => 10,
        2 => 50,
        3 => 100,
        4 => 500,
        _ => 1000,
    };
    Duration::from_millis(ms)
}

/// Retry count and distinct reasons accumulated on a request.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub reasons: Vec<RetryReason>,
}

impl RetryState {
    pub fn record(&mut self, reason: RetryReason) {
        self.attempts += 1;
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }
}

/// Decides whether `req` retries for `reason`. On yes, records the attempt
/// and returns the earliest time the retry may run.
pub fn maybe_retry(req: &dyn RetryRequest, reason: RetryReason) -> Option<Instant> {
    maybe_retry_with_floor(req, reason, Duration::ZERO)
}

/// Like [`maybe_retry`] but never schedules sooner than `floor`.
pub fn maybe_retry_with_floor(req: &dyn RetryRequest, reason: RetryReason, floor: Duration) -> Option<Instant> {
    let delay = if reason.always_retry() {
        controlled_backoff(req.retry_attempts())
    } else {
        let strategy = req.retry_strategy()?;
        match strategy.retry_after(req, reason) {
            RetryAction::RetryAfter(d) if !d.is_zero() => d,
            _ => {
                debug!(operation_id = %req.identifier(), reason = %reason, "Won't retry request");
                return None;
            }
        }
    };
    let delay = delay.max(floor);
    debug!(
        operation_id = %req.identifier(),
        reason = %reason,
        backoff_ms = delay.as_millis() as u64,
        "Will retry request"
    );
    req.record_retry_attempt(reason);
    cbcore_telemetry::record_retry(reason.as_str());
    Some(Instant::now() + delay)
}
