//! Task submitted to the pool and the result it produces.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A unit of delegated work.
#[derive(Debug, Clone)]
pub struct Task {
    /// Caller-assigned unique ID.
    pub id: String,
    /// Session the task belongs to; scopes secret lookups.
    pub session_id: String,
    /// Prompt or instruction handed to the agent command.
    pub payload: String,
    /// Extra environment; `$NAME` values are secret references.
    pub env: BTreeMap<String, String>,
    /// Absolute deadline, if any.
    pub deadline: Option<Instant>,
    /// Cancelled by the caller to abandon the task.
    pub cancel: CancellationToken,
}

impl Task {
    /// Create a task with no deadline and a fresh cancellation token.
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: String::new(),
            payload: payload.into(),
            env: BTreeMap::new(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the session used for secret scoping.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Add one environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set an absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tie the task to a caller-owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Execution bound: the smaller of the remaining deadline and `cap`.
    pub(crate) fn execution_bound(&self, cap: Duration) -> Duration {
        self.remaining().map_or(cap, |left| left.min(cap))
    }
}

/// Output of a task that ran to completion.
///
/// A non-zero `exit_code` is an application-level failure, not a pool error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    /// ID of the task.
    pub task_id: String,
    /// Container the task ran in.
    pub container_id: String,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code of the task process.
    pub exit_code: i64,
    /// Wall-clock execution time.
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl TaskResult {
    /// True if the task process exited with code 0.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}
