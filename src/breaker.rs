//! Circuit breaker over task-execution infrastructure failures.
//!
//! Tracks consecutive infra failures (runtime unreachable, exec transport
//! errors, timeouts). After `failure_threshold` of them the circuit opens and
//! every admission is rejected until `open_duration` elapses. The first
//! admission after that is the single half-open trial: success closes the
//! circuit, failure re-opens it and restarts the timer.
//!
//! Application-level failures (non-zero exit codes) are reported as success.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::PoolError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Tasks flow normally.
    Closed,
    /// Tasks are rejected until the open duration elapses.
    Open,
    /// One trial task is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Pool-global circuit breaker.
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            open_duration,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Admit one task, or reject it with [`PoolError::CircuitOpen`].
    ///
    /// The returned permit must be resolved with [`BreakerPermit::succeed`]
    /// or [`BreakerPermit::fail`]; dropping it unresolved leaves the breaker
    /// untouched apart from freeing the half-open trial slot.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, PoolError> {
        let mut st = self.lock();

        if st.state == CircuitState::Open {
            let elapsed = st
                .opened_at
                .map_or(Duration::MAX, |opened| opened.elapsed());
            if elapsed >= self.open_duration {
                st.state = CircuitState::HalfOpen;
                tracing::info!("circuit breaker half-open, admitting trial task");
            }
        }

        match st.state {
            CircuitState::Closed => Ok(BreakerPermit {
                breaker: self,
                trial: false,
                resolved: false,
            }),
            CircuitState::HalfOpen if !st.trial_in_flight => {
                st.trial_in_flight = true;
                Ok(BreakerPermit {
                    breaker: self,
                    trial: true,
                    resolved: false,
                })
            }
            CircuitState::HalfOpen | CircuitState::Open => Err(PoolError::CircuitOpen {
                consecutive_failures: st.consecutive_failures,
            }),
        }
    }

    /// Current state, without evaluating the open timer.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Current consecutive infra failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn record_success(&self, trial: bool) {
        let mut st = self.lock();
        if trial {
            st.trial_in_flight = false;
            st.state = CircuitState::Closed;
            st.consecutive_failures = 0;
            st.opened_at = None;
            tracing::info!("circuit breaker closed after successful trial");
            return;
        }
        // Outcomes of tasks admitted before the circuit opened do not move it.
        if st.state == CircuitState::Closed {
            st.consecutive_failures = 0;
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut st = self.lock();
        if trial {
            st.trial_in_flight = false;
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            st.state = CircuitState::Open;
            st.opened_at = Some(Instant::now());
            tracing::warn!(
                failures = st.consecutive_failures,
                "circuit breaker re-opened after failed trial"
            );
            return;
        }
        if st.state != CircuitState::Closed {
            return;
        }
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        if st.consecutive_failures >= self.failure_threshold {
            st.state = CircuitState::Open;
            st.opened_at = Some(Instant::now());
            tracing::warn!(
                failures = st.consecutive_failures,
                open_for_ms = u64::try_from(self.open_duration.as_millis()).unwrap_or(u64::MAX),
                "circuit breaker opened"
            );
        }
    }

    fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission ticket handed out by [`CircuitBreaker::try_acquire`].
#[must_use = "a permit must be resolved with succeed() or fail()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit<'_> {
    /// True if this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report that the task reached the runtime and produced an exit code.
    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.trial);
    }

    /// Report an infrastructure failure.
    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}
