//! One long-lived sandbox container and its bookkeeping.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use crate::error::PoolError;

/// Lifecycle of a managed environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    /// Container created, not yet confirmed running.
    Starting,
    /// Accepting tasks.
    Healthy,
    /// Flagged for recycling; accepts no tasks.
    Unhealthy,
    /// Draining or being replaced.
    Recycling,
    /// Removed at shutdown.
    Stopped,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Recycling => write!(f, "recycling"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of an environment, for [`PoolStats`](super::PoolStats).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentSnapshot {
    /// Position in the pool; stable across recycles.
    pub slot: usize,
    /// Container currently backing the slot.
    pub container_id: String,
    /// Lifecycle state.
    pub lifecycle: Lifecycle,
    /// Tasks currently executing.
    pub in_flight: usize,
    /// When the current container was created.
    pub created_at: DateTime<Utc>,
    /// Last completed health check of the current container.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Consecutive failed recycle attempts.
    pub recycle_failures: u32,
}

#[derive(Debug)]
struct EnvState {
    container_id: String,
    lifecycle: Lifecycle,
    in_flight: usize,
    created_at: DateTime<Utc>,
    last_health_check: Option<DateTime<Utc>>,
    recycle_failures: u32,
}

/// A container owned by the pool.
///
/// `state` is only ever held for short synchronous sections. `lifecycle`
/// serializes recycle and shutdown so that at most one actor replaces the
/// container at a time.
#[derive(Debug)]
pub(crate) struct ManagedEnvironment {
    slot: usize,
    state: Mutex<EnvState>,
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
    idle: Notify,
}

impl ManagedEnvironment {
    /// A freshly started, confirmed-running environment.
    pub(crate) fn new(slot: usize, container_id: String) -> Self {
        Self {
            slot,
            state: Mutex::new(EnvState {
                container_id,
                lifecycle: Lifecycle::Healthy,
                in_flight: 0,
                created_at: Utc::now(),
                last_health_check: None,
                recycle_failures: 0,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            idle: Notify::new(),
        }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn container_id(&self) -> String {
        self.lock().container_id.clone()
    }

    pub(crate) fn lifecycle_state(&self) -> Lifecycle {
        self.lock().lifecycle
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// In-flight count if the environment accepts tasks.
    pub(crate) fn load(&self) -> Option<usize> {
        let st = self.lock();
        (st.lifecycle == Lifecycle::Healthy).then_some(st.in_flight)
    }

    /// Reserve one execution slot.
    ///
    /// Re-checks state under the lock, so a concurrent flag or a racing
    /// reservation is reported rather than overcommitted.
    pub(crate) fn try_reserve(self: &Arc<Self>, max_pending: usize) -> Result<EnvironmentLease, PoolError> {
        let mut st = self.lock();
        if st.lifecycle != Lifecycle::Healthy {
            return Err(PoolError::NoHealthyEnvironment);
        }
        if st.in_flight >= max_pending {
            return Err(PoolError::PoolSaturated { limit: max_pending });
        }
        st.in_flight += 1;
        Ok(EnvironmentLease {
            environment: Arc::clone(self),
            container_id: st.container_id.clone(),
        })
    }

    /// Flag the environment for recycling if it still runs `container_id`.
    ///
    /// Returns true when the state changed.
    pub(crate) fn flag_unhealthy(&self, container_id: &str) -> bool {
        let mut st = self.lock();
        if st.container_id != container_id {
            return false;
        }
        match st.lifecycle {
            Lifecycle::Healthy | Lifecycle::Starting => {
                st.lifecycle = Lifecycle::Unhealthy;
                true
            }
            Lifecycle::Unhealthy | Lifecycle::Recycling | Lifecycle::Stopped => false,
        }
    }

    pub(crate) fn record_health_check(&self) {
        self.lock().last_health_check = Some(Utc::now());
    }

    /// Enter `Recycling` and return the container being replaced.
    pub(crate) fn begin_recycle(&self) -> String {
        let mut st = self.lock();
        st.lifecycle = Lifecycle::Recycling;
        st.container_id.clone()
    }

    /// Track a replacement container that is not yet confirmed running.
    pub(crate) fn replace_container(&self, container_id: String) {
        let mut st = self.lock();
        st.container_id = container_id;
        st.lifecycle = Lifecycle::Starting;
        st.created_at = Utc::now();
        st.last_health_check = None;
    }

    pub(crate) fn mark_healthy(&self) {
        let mut st = self.lock();
        st.lifecycle = Lifecycle::Healthy;
        st.recycle_failures = 0;
    }

    /// Record a failed recycle; returns the consecutive failure count.
    pub(crate) fn recycle_failed(&self) -> u32 {
        let mut st = self.lock();
        st.lifecycle = Lifecycle::Unhealthy;
        st.recycle_failures += 1;
        st.recycle_failures
    }

    /// Enter `Stopped` and return the container to remove.
    pub(crate) fn mark_stopped(&self) -> String {
        let mut st = self.lock();
        st.lifecycle = Lifecycle::Stopped;
        st.container_id.clone()
    }

    /// Resolve once no task holds a lease.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn snapshot(&self) -> EnvironmentSnapshot {
        let st = self.lock();
        EnvironmentSnapshot {
            slot: self.slot,
            container_id: st.container_id.clone(),
            lifecycle: st.lifecycle,
            in_flight: st.in_flight,
            created_at: st.created_at,
            last_health_check: st.last_health_check,
            recycle_failures: st.recycle_failures,
        }
    }

    fn release(&self) {
        let mut st = self.lock();
        st.in_flight = st.in_flight.saturating_sub(1);
        if st.in_flight == 0 {
            self.idle.notify_waiters();
        }
    }

    fn lock(&self) -> MutexGuard<'_, EnvState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One reserved execution slot. Dropping it frees the slot.
#[derive(Debug)]
pub(crate) struct EnvironmentLease {
    environment: Arc<ManagedEnvironment>,
    container_id: String,
}

impl EnvironmentLease {
    pub(crate) fn environment(&self) -> &ManagedEnvironment {
        &self.environment
    }

    /// Container the slot was reserved on.
    pub(crate) fn container_id(&self) -> &str {
        &self.container_id
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        self.environment.release();
    }
}
