//! Circuit breaker: threshold-based tripping, a single scheduled half-open
//! probe, cooldown-gated recovery.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    half_open_start: Option<Instant>,
}

/// A snapshot of breaker state for observability; not used on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failures: u32,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    /// `base_threshold * account_count` — with round-robin, each account
    /// failing once counts once.
    effective_threshold: u32,
    cooldown: Duration,
    half_open_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(
        base_threshold: u32,
        account_count: usize,
        cooldown: Duration,
        half_open_timeout: Duration,
    ) -> Self {
        let effective_threshold = base_threshold.saturating_mul(account_count as u32);
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                half_open_start: None,
            }),
            effective_threshold,
            cooldown,
            half_open_timeout,
        }
    }

    /// `CLOSED` -> true. `OPEN` -> true only once cooldown has elapsed,
    /// atomically transitioning to `HALF_OPEN`. Subsequent `HALF_OPEN`
    /// calls -> false until the outstanding probe resolves or times out; if
    /// the half-open timeout has elapsed without resolution, reverts to
    /// `OPEN` (releasing the gate for a future probe) and returns false.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooldown_elapsed = inner
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.cooldown);
                if cooldown_elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_start = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                let probe_timed_out = inner
                    .half_open_start
                    .is_none_or(|at| at.elapsed() >= self.half_open_timeout);
                if probe_timed_out {
                    inner.state = BreakerState::Open;
                    inner.last_failure = Some(Instant::now());
                    inner.half_open_start = None;
                }
                false
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        inner.state = BreakerState::Closed;
        inner.half_open_start = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        if inner.state == BreakerState::HalfOpen || inner.failures >= self.effective_threshold {
            inner.state = BreakerState::Open;
        }
        inner.last_failure = Some(Instant::now());
    }

    pub fn time_until_retry(&self) -> Duration {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Duration::ZERO,
            BreakerState::Open => inner
                .last_failure
                .map(|at| self.cooldown.saturating_sub(at.elapsed()))
                .unwrap_or(Duration::ZERO),
            BreakerState::HalfOpen => inner
                .half_open_start
                .map(|at| self.half_open_timeout.saturating_sub(at.elapsed()))
                .unwrap_or(Duration::ZERO),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.half_open_start = None;
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failures: inner.failures,
        }
    }
}
