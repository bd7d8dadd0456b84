//! Errors returned by the container pool.
//!
//! Four families, each with a different caller reaction:
//! admission rejections (retry later), execution infra failures (reported
//! to the circuit breaker), caller-side outcomes (cancellation, deadline,
//! shutdown) and construction failures (fatal to the caller).

use std::time::Duration;

use crate::runtime::RuntimeError;

/// Errors that can occur while building or using a [`ContainerPool`](crate::ContainerPool).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The rate limiter has no token left.
    #[error("Rate limit exceeded, retry later")]
    RateLimited,

    /// The circuit breaker is open, or a half-open trial is already running.
    #[error("Circuit breaker is open: {consecutive_failures} consecutive infrastructure failures")]
    CircuitOpen { consecutive_failures: u32 },

    /// No environment is currently healthy.
    #[error("No healthy environment available")]
    NoHealthyEnvironment,

    /// The least-loaded environment is already at its concurrency ceiling.
    #[error("Pool saturated: environment is running {limit} tasks")]
    PoolSaturated { limit: usize },

    /// The task ran past its execution bound; only its process was killed.
    #[error("Task timed out after {}ms", timeout.as_millis())]
    TaskTimeout { timeout: Duration },

    /// A secret reference could not be resolved.
    #[error("Failed to resolve secret '{reference}': {message}")]
    SecretResolution { reference: String, message: String },

    /// Container runtime failure.
    #[error(transparent)]
    Runtime(RuntimeError),

    /// The caller cancelled the task, or the pool force-stopped it.
    #[error("Task was cancelled")]
    Cancelled,

    /// The task deadline passed before it could be admitted.
    #[error("Task deadline exceeded")]
    DeadlineExceeded,

    /// The pool is shutting down and accepts no new tasks.
    #[error("Pool is shutting down")]
    ShuttingDown,

    /// The configuration is contradictory or malformed.
    #[error("Invalid pool configuration: {message}")]
    InvalidConfig { message: String },
}

impl From<RuntimeError> for PoolError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Timeout { timeout } => Self::TaskTimeout { timeout },
            other => Self::Runtime(other),
        }
    }
}

impl PoolError {
    /// Creates an `InvalidConfig` error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a `SecretResolution` error.
    pub fn secret_resolution(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SecretResolution {
            reference: reference.into(),
            message: message.into(),
        }
    }

    /// Returns true for synchronous admission rejections. These are expected
    /// under load and the caller may retry later.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::CircuitOpen { .. }
                | Self::NoHealthyEnvironment
                | Self::PoolSaturated { .. }
        )
    }

    /// Returns true for failures of the sandboxing infrastructure itself.
    pub fn is_infra_failure(&self) -> bool {
        matches!(
            self,
            Self::Runtime(_) | Self::TaskTimeout { .. } | Self::SecretResolution { .. }
        )
    }

    /// Returns true if this failure is counted by the circuit breaker.
    ///
    /// Secret resolution failures are infra failures for their task only and
    /// are not a signal about runtime health.
    pub(crate) fn trips_breaker(&self) -> bool {
        matches!(self, Self::Runtime(_) | Self::TaskTimeout { .. })
    }

    /// Returns true if this is a `TaskTimeout`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TaskTimeout { .. })
    }
}
