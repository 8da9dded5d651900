//! Per-connection circuit breaker.
//!
//! Closed lets everything through. Once enough completions in a rolling
//! window are failures the breaker opens and short-circuits dispatch. After
//! the sleep window the next dispatch attempt flips it to half-open and a
//! single canary is sent; the canary's outcome closes or re-opens it.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cbcore_config::CircuitBreakerConfig;
use cbcore_errors::CoreError;
use parking_lot::Mutex;
use tracing::debug;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Classifies a completion: `true` counts as success.
pub type CompletionCallback = Arc<dyn Fn(Option<&CoreError>) -> bool + Send + Sync>;

/// Default classification: only timeouts count against the connection.
pub fn default_completion_callback() -> CompletionCallback {
    Arc::new(|err: Option<&CoreError>| !err.is_some_and(|e| e.is_timeout()))
}

pub trait CircuitBreaker: Send + Sync {
    fn allows_request(&self) -> bool;
    fn mark_successful(&self);
    fn mark_failure(&self);
    fn state(&self) -> BreakerState;
    fn reset(&self);
    fn completion_callback(&self, err: Option<&CoreError>) -> bool;
}

/// Breaker used when breakers are disabled.
pub struct NoopCircuitBreaker;

impl CircuitBreaker for NoopCircuitBreaker {
    fn allows_request(&self) -> bool {
        true
    }
    fn mark_successful(&self) {}
    fn mark_failure(&self) {}
    fn state(&self) -> BreakerState {
        BreakerState::Closed
    }
    fn reset(&self) {}
    fn completion_callback(&self, _err: Option<&CoreError>) -> bool {
        true
    }
}

struct Window {
    state: BreakerState,
    window_start: Instant,
    total: u64,
    failed: u64,
    opened_at: Instant,
}

/// Breaker that only evaluates its window when completions are recorded.
pub struct LazyCircuitBreaker {
    address: String,
    config: CircuitBreakerConfig,
    completion: CompletionCallback,
    send_canary: Box<dyn Fn() + Send + Sync>,
    window: Mutex<Window>,
}

impl fmt::Debug for LazyCircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyCircuitBreaker")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

impl LazyCircuitBreaker {
    pub fn new(
        address: impl Into<String>,
        config: CircuitBreakerConfig,
        completion: CompletionCallback,
        send_canary: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let now = Instant::now();
        Self {
            address: address.into(),
            config,
            completion,
            send_canary: Box::new(send_canary),
            window: Mutex::new(Window {
                state: BreakerState::Closed,
                window_start: now,
                total: 0,
                failed: 0,
                opened_at: now,
            }),
        }
    }

    pub fn canary_timeout(&self) -> Duration {
        self.config.canary_timeout
    }

    fn maybe_reset_rolling_window(&self, w: &mut Window, now: Instant) {
        if now.duration_since(w.window_start) <= self.config.rolling_window {
            return;
        }
        w.window_start = now;
        w.total = 0;
        w.failed = 0;
    }

    fn maybe_open(&self, w: &mut Window, now: Instant) {
        if w.total < self.config.volume_threshold {
            return;
        }
        let pct = w.failed as f64 / w.total as f64 * 100.0;
        if pct >= self.config.error_threshold_percentage && w.state == BreakerState::Closed {
            w.state = BreakerState::Open;
            w.opened_at = now;
            debug!(address = %self.address, failed = w.failed, total = w.total, "Circuit breaker opened");
            cbcore_telemetry::record_breaker_transition(&self.address, BreakerState::Open.as_str());
        }
    }
}

impl CircuitBreaker for LazyCircuitBreaker {
    fn allows_request(&self) -> bool {
        let send = {
            let mut w = self.window.lock();
            match w.state {
                BreakerState::Closed => return true,
                BreakerState::HalfOpen => false,
                BreakerState::Open => {
                    if w.opened_at.elapsed() > self.config.sleep_window {
                        w.state = BreakerState::HalfOpen;
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if send {
            debug!(address = %self.address, "Circuit breaker half open, sending canary");
            cbcore_telemetry::record_breaker_transition(&self.address, BreakerState::HalfOpen.as_str());
            (self.send_canary)();
        }
        false
    }

    fn mark_successful(&self) {
        let now = Instant::now();
        let mut w = self.window.lock();
        if w.state == BreakerState::HalfOpen {
            debug!(address = %self.address, "Circuit breaker closed");
            cbcore_telemetry::record_breaker_transition(&self.address, BreakerState::Closed.as_str());
            w.state = BreakerState::Closed;
            w.window_start = now;
            w.total = 0;
            w.failed = 0;
            return;
        }
        self.maybe_reset_rolling_window(&mut w, now);
        w.total += 1;
    }

    fn mark_failure(&self) {
        let now = Instant::now();
        let mut w = self.window.lock();
        if w.state == BreakerState::HalfOpen {
            debug!(address = %self.address, "Circuit breaker re-opened after failed canary");
            cbcore_telemetry::record_breaker_transition(&self.address, BreakerState::Open.as_str());
            w.state = BreakerState::Open;
            w.opened_at = now;
            return;
        }
        self.maybe_reset_rolling_window(&mut w, now);
        w.total += 1;
        w.failed += 1;
        self.maybe_open(&mut w, now);
    }

    fn state(&self) -> BreakerState {
        self.window.lock().state
    }

    fn reset(&self) {
        let mut w = self.window.lock();
        w.state = BreakerState::Closed;
        w.window_start = Instant::now();
        w.total = 0;
        w.failed = 0;
    }

    fn completion_callback(&self, err: Option<&CoreError>) -> bool {
        (self.completion)(err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cbcore_errors::{ErrorKind, TimeoutError};

    use super::*;

    fn breaker(canaries: Arc<AtomicUsize>, sleep: Duration) -> LazyCircuitBreaker {
        let config = CircuitBreakerConfig {
            volume_threshold: 4,
            error_threshold_percentage: 50.0,
            sleep_window: sleep,
            ..Default::default()
        };
        LazyCircuitBreaker::new("127.0.0.1:11210", config, default_completion_callback(), move || {
            canaries.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker(Arc::new(AtomicUsize::new(0)), Duration::from_secs(60));
        b.mark_successful();
        b.mark_failure();
        b.mark_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.mark_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allows_request());
    }

    #[test]
    fn test_canary_after_sleep_window() {
        let canaries = Arc::new(AtomicUsize::new(0));
        let b = breaker(canaries.clone(), Duration::ZERO);
        for _ in 0..4 {
            b.mark_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(2));

        assert!(!b.allows_request());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(!b.allows_request());
        assert_eq!(canaries.load(Ordering::SeqCst), 1);

        b.mark_successful();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allows_request());
    }

    #[test]
    fn test_failed_canary_reopens() {
        let b = breaker(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        for _ in 0..4 {
            b.mark_failure();
        }
        std::thread::sleep(Duration::from_millis(2));
        b.allows_request();
        b.mark_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn test_default_completion_counts_timeouts() {
        let cb = default_completion_callback();
        assert!(cb(None));
        assert!(cb(Some(&CoreError::from(ErrorKind::DocumentNotFound))));
        assert!(!cb(Some(&CoreError::from(TimeoutError::new(false)))));
    }

    #[test]
    fn test_noop_breaker() {
        let b = NoopCircuitBreaker;
        b.mark_failure();
        assert!(b.allows_request());
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
