//! Background health checking and environment recycling.
//!
//! The checker only observes and flags. Replacing a container goes through
//! [`recycle`], spawned on the pool's recycle tracker, which holds the
//! environment's lifecycle lock for the whole drain/stop/create sequence; a
//! second attempt while one is running is skipped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::environment::{Lifecycle, ManagedEnvironment};
use super::PoolInner;

/// Consecutive recycle failures before they are logged as warnings.
const RECYCLE_WARN_THRESHOLD: u32 = 3;

/// Spawn the health-check loop.
///
/// The loop ends when `shutdown` changes or the pool is dropped.
pub(super) fn spawn_health_checker(
    pool: Weak<PoolInner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let Some(inner) = pool.upgrade() else {
                        return;
                    };
                    tokio::select! {
                        _ = check_all(&inner) => {}
                        _ = shutdown.changed() => {
                            debug!("health checker stopping mid-check");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("health checker stopping");
                    return;
                }
            }
        }
    })
}

/// Check every environment once, concurrently.
///
/// Environments needing replacement get a recycle task of their own, so a
/// slow drain never holds up the next tick. Returns the handles of the
/// recycles started by this pass.
pub(super) async fn check_all(inner: &Arc<PoolInner>) -> Vec<JoinHandle<()>> {
    let flagged = join_all(
        inner
            .environments
            .iter()
            .map(|env| check_environment(inner, env)),
    )
    .await;

    inner
        .environments
        .iter()
        .zip(flagged)
        .filter(|(_, needs_recycle)| *needs_recycle)
        .map(|(env, _)| {
            inner
                .recycles
                .spawn(recycle(Arc::clone(inner), Arc::clone(env)))
        })
        .collect()
}

/// Returns true if the environment should be recycled.
async fn check_environment(inner: &PoolInner, env: &ManagedEnvironment) -> bool {
    let slot = env.slot();
    match env.lifecycle_state() {
        Lifecycle::Stopped | Lifecycle::Recycling => return false,
        Lifecycle::Unhealthy => return !inner.is_closed(),
        Lifecycle::Starting | Lifecycle::Healthy => {}
    }

    let id = env.container_id();
    let status = inner
        .inspect_cache
        .get_or_fetch(id.clone(), || inner.runtime.inspect(&id))
        .await;
    env.record_health_check();

    let reason = match status {
        Ok(status) if status.is_healthy() => return false,
        Ok(status) if !status.running => format!("container is {}", status.status),
        Ok(_) => "health probe reports unhealthy".to_string(),
        Err(e) if e.is_container_lost() => e.to_string(),
        Err(e) => {
            // Runtime trouble is not the container's fault.
            warn!(slot, container = %id, error = %e, "health inspect failed");
            return false;
        }
    };

    if env.flag_unhealthy(&id) {
        warn!(slot, container = %id, reason = %reason, "environment unhealthy");
    }
    inner.inspect_cache.invalidate(&id);
    !inner.is_closed()
}

/// Replace the environment's container with a new one from the same spec.
pub(super) async fn recycle(inner: Arc<PoolInner>, env: Arc<ManagedEnvironment>) {
    let slot = env.slot();
    let Ok(_guard) = env.lifecycle.try_lock() else {
        debug!(slot, "recycle already in progress");
        return;
    };
    if inner.is_closed() || env.lifecycle_state() == Lifecycle::Stopped {
        return;
    }

    let old_id = env.begin_recycle();
    info!(slot, container = %old_id, "recycling environment");

    let drained = tokio::select! {
        result = tokio::time::timeout(inner.settings.task_timeout, env.wait_idle()) => result.is_ok(),
        () = inner.force_stop.cancelled() => return,
    };
    if !drained {
        warn!(
            slot,
            in_flight = env.in_flight(),
            "drain timed out, replacing container under running tasks"
        );
    }

    inner.discard_container(&old_id).await;

    match inner.replace_container(&env).await {
        Ok(new_id) => {
            env.mark_healthy();
            info!(slot, old = %old_id, container = %new_id, "environment recycled");
        }
        Err(e) => {
            let failures = env.recycle_failed();
            if failures >= RECYCLE_WARN_THRESHOLD {
                warn!(slot, failures, error = %e, "recycle keeps failing");
            } else {
                info!(slot, failures, error = %e, "recycle failed, retrying next interval");
            }
        }
    }
}
