//! The sandboxed task-execution pool.
//!
//! A [`ContainerPool`] owns a fixed set of long-lived containers. Each
//! submitted task passes admission (rate limiter, then circuit breaker),
//! is placed on the least-loaded healthy environment, has its secret
//! references resolved and runs as an exec inside that container. Runtime
//! failures and timeouts feed the breaker; exit codes never do.

mod environment;
mod health;
mod task;


use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::{BreakerPermit, CircuitBreaker, CircuitState};
use crate::cache::TtlCache;
use crate::config::{PoolConfig, PoolSettings, PullPolicy};
use crate::error::PoolError;
use crate::limiter::RateLimiter;
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, DockerRuntime, ExecOutput, ExecRequest,
    RuntimeError, POOL_LABEL,
};
use crate::secrets::{secret_reference, EnvSecretResolver, SecretResolver};

pub use environment::{EnvironmentSnapshot, Lifecycle};
pub use task::{Task, TaskResult};

use environment::{EnvironmentLease, ManagedEnvironment};

/// Handle to a running pool. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct ContainerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    settings: PoolSettings,
    spec: ContainerSpec,
    runtime: Arc<dyn ContainerRuntime>,
    secrets: Arc<dyn SecretResolver>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    inspect_cache: TtlCache<String, ContainerStatus, RuntimeError>,
    secret_cache: TtlCache<(String, String), String, PoolError>,
    environments: Vec<Arc<ManagedEnvironment>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    force_stop: CancellationToken,
    health: Mutex<Option<JoinHandle<()>>>,
    recycles: TaskTracker,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Pool name.
    pub name: String,
    /// Set once shutdown has begun.
    pub closed: bool,
    /// Current breaker state.
    pub breaker_state: CircuitState,
    /// Infra failures since the last success.
    pub consecutive_failures: u32,
    /// Tokens left in the rate limiter, fractional.
    pub available_tokens: f64,
    /// One entry per environment, in slot order.
    pub environments: Vec<EnvironmentSnapshot>,
}

impl std::fmt::Debug for ContainerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerPool")
            .field("name", &self.inner.settings.name)
            .field("environments", &self.inner.environments.len())
            .field("closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

impl ContainerPool {
    /// Build a pool against the local Docker daemon, resolving secrets from
    /// the host environment.
    pub async fn connect(config: &PoolConfig) -> Result<Self, PoolError> {
        let runtime = DockerRuntime::connect()?;
        Self::new(config, Arc::new(runtime), Arc::new(EnvSecretResolver::new())).await
    }

    /// Validate `config`, prepare the image and start every environment.
    ///
    /// Either all environments start or none are left behind.
    pub async fn new(
        config: &PoolConfig,
        runtime: Arc<dyn ContainerRuntime>,
        secrets: Arc<dyn SecretResolver>,
    ) -> Result<Self, PoolError> {
        let settings = config.resolve()?;

        runtime.ping().await?;
        ensure_image(runtime.as_ref(), &settings.image, settings.pull_policy).await?;

        let orphans = remove_orphans(runtime.as_ref(), &settings.name).await?;
        if !orphans.is_empty() {
            info!(count = orphans.len(), pool = %settings.name, "removed orphaned containers");
        }

        let spec = settings.container_spec();
        let mut environments: Vec<Arc<ManagedEnvironment>> = Vec::with_capacity(settings.pool_size);
        for slot in 0..settings.pool_size {
            match launch(runtime.as_ref(), &spec, &container_name(&settings.name, slot)).await {
                Ok(id) => {
                    debug!(slot, container = %id, "environment started");
                    environments.push(Arc::new(ManagedEnvironment::new(slot, id)));
                }
                Err(e) => {
                    warn!(slot, error = %e, "environment failed to start, tearing down");
                    for env in &environments {
                        let id = env.container_id();
                        let _ = runtime.stop(&id).await;
                        let _ = runtime.remove(&id).await;
                    }
                    return Err(e.into());
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            limiter: RateLimiter::new(settings.rate_limit_per_minute),
            breaker: CircuitBreaker::new(settings.failure_threshold, settings.open_duration),
            inspect_cache: TtlCache::new(settings.inspect_ttl),
            secret_cache: TtlCache::new(settings.secret_ttl),
            spec,
            runtime,
            secrets,
            environments,
            closed: AtomicBool::new(false),
            shutdown_tx,
            force_stop: CancellationToken::new(),
            health: Mutex::new(None),
            recycles: TaskTracker::new(),
            settings,
        });

        let handle = health::spawn_health_checker(
            Arc::downgrade(&inner),
            inner.settings.health_interval,
            shutdown_rx,
        );
        *inner.health.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(
            pool = %inner.settings.name,
            image = %inner.settings.image,
            environments = inner.environments.len(),
            "pool ready"
        );
        Ok(Self { inner })
    }

    /// Run one task to completion.
    ///
    /// Admission rejections return immediately without touching the
    /// runtime. A non-zero exit code is returned as a normal [`TaskResult`].
    pub async fn submit(&self, task: Task) -> Result<TaskResult, PoolError> {
        let inner = &*self.inner;

        if task.cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        if task.remaining().is_some_and(|left| left.is_zero()) {
            return Err(PoolError::DeadlineExceeded);
        }
        if inner.is_closed() {
            return Err(PoolError::ShuttingDown);
        }

        let (permit, lease) = match inner.admit() {
            Ok(admitted) => admitted,
            Err(err) => {
                debug!(task_id = %task.id, error = %err, "task rejected");
                return Err(err);
            }
        };

        let slot = lease.environment().slot();
        let container_id = lease.container_id().to_string();
        debug!(task_id = %task.id, slot, container = %container_id, trial = permit.is_trial(), "task admitted");

        let started = Instant::now();
        let result = tokio::select! {
            () = task.cancel.cancelled() => Err(PoolError::Cancelled),
            () = inner.force_stop.cancelled() => Err(PoolError::Cancelled),
            result = inner.execute(&task, &container_id) => result,
        };
        let duration = started.elapsed();

        match result {
            Ok(output) => {
                permit.succeed();
                debug!(
                    task_id = %task.id,
                    exit_code = output.exit_code,
                    duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                    "task finished"
                );
                Ok(TaskResult {
                    task_id: task.id,
                    container_id,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.exit_code,
                    duration,
                })
            }
            Err(err) => {
                if err.trips_breaker() {
                    permit.fail();
                } else {
                    drop(permit);
                }

                if let PoolError::Runtime(e) = &err {
                    if e.is_container_lost() && lease.environment().flag_unhealthy(&container_id) {
                        inner.inspect_cache.invalidate(&container_id);
                        warn!(slot, container = %container_id, "container lost, environment flagged for recycling");
                    }
                }

                if err.is_infra_failure() {
                    warn!(task_id = %task.id, container = %container_id, error = %err, "task failed");
                } else {
                    debug!(task_id = %task.id, error = %err, "task abandoned");
                }
                Err(err)
            }
        }
    }

    /// Stop accepting tasks, drain, and remove every container.
    ///
    /// Tasks still running after `grace` are cancelled and complete with
    /// [`PoolError::Cancelled`]. Calling this again is a no-op.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), PoolError> {
        let inner = &*self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(pool = %inner.settings.name, "shutting down pool");

        let _ = inner.shutdown_tx.send(true);

        let idle = join_all(inner.environments.iter().map(|env| env.wait_idle()));
        if tokio::time::timeout(grace, idle).await.is_err() {
            warn!(grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX), "grace period elapsed, cancelling running tasks");
        }
        inner.force_stop.cancel();

        let handle = inner
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        // Recycles observe the closed flag and force_stop; let them unwind.
        inner.recycles.close();
        if tokio::time::timeout(grace, inner.recycles.wait()).await.is_err() {
            debug!("recycle still running, waiting on its lifecycle lock");
        }

        let mut first_error: Option<RuntimeError> = None;
        for env in &inner.environments {
            let _guard = env.lifecycle.lock().await;
            let id = env.mark_stopped();
            for result in [inner.runtime.stop(&id).await, inner.runtime.remove(&id).await] {
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_container_lost() => {}
                    Err(e) => {
                        warn!(slot = env.slot(), container = %id, error = %e, "failed to remove container");
                        first_error.get_or_insert(e);
                    }
                }
            }
            inner.inspect_cache.invalidate(&id);
        }

        // Containers created by an interrupted recycle carry the label too.
        match remove_orphans(inner.runtime.as_ref(), &inner.settings.name).await {
            Ok(leftover) if !leftover.is_empty() => {
                debug!(count = leftover.len(), "removed leftover containers");
            }
            Ok(_) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => {
                info!(pool = %inner.settings.name, "pool stopped");
                Ok(())
            }
        }
    }

    /// Current breaker, limiter and environment state.
    pub fn stats(&self) -> PoolStats {
        let inner = &*self.inner;
        PoolStats {
            name: inner.settings.name.clone(),
            closed: inner.is_closed(),
            breaker_state: inner.breaker.state(),
            consecutive_failures: inner.breaker.consecutive_failures(),
            available_tokens: inner.limiter.available(),
            environments: inner.environments.iter().map(|env| env.snapshot()).collect(),
        }
    }

    /// The resolved settings the pool runs with.
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Rate limit, breaker, then environment selection.
    fn admit(&self) -> Result<(BreakerPermit<'_>, EnvironmentLease), PoolError> {
        if !self.limiter.try_acquire() {
            return Err(PoolError::RateLimited);
        }
        let permit = self.breaker.try_acquire()?;
        let lease = self.reserve()?;
        Ok((permit, lease))
    }

    /// Least-loaded healthy environment; ties go to the lowest slot.
    fn reserve(&self) -> Result<EnvironmentLease, PoolError> {
        let mut candidates: Vec<_> = self
            .environments
            .iter()
            .filter_map(|env| env.load().map(|in_flight| (in_flight, env)))
            .collect();
        candidates.sort_by_key(|(in_flight, env)| (*in_flight, env.slot()));

        reserve_first(
            candidates.into_iter().map(|(_, env)| env),
            self.settings.max_pending,
        )
    }

    async fn execute(&self, task: &Task, container_id: &str) -> Result<ExecOutput, PoolError> {
        let env = self.task_env(task).await?;

        let timeout = task.execution_bound(self.settings.task_timeout);
        if timeout.is_zero() {
            return Err(PoolError::DeadlineExceeded);
        }

        let mut command = self.settings.agent_command.clone();
        command.push(task.payload.clone());
        let request = ExecRequest {
            task_id: task.id.clone(),
            command,
            env,
            timeout,
        };
        Ok(self.runtime.exec(container_id, &request).await?)
    }

    /// Config env, then task env with secret references resolved, then the
    /// API key.
    async fn task_env(&self, task: &Task) -> Result<BTreeMap<String, String>, PoolError> {
        let mut env = self.settings.env.clone();
        for (key, value) in &task.env {
            let value = match secret_reference(value) {
                Some(reference) => self.resolve_secret(&task.session_id, reference).await?,
                None => value.clone(),
            };
            env.insert(key.clone(), value);
        }
        if let Some(name) = &self.settings.api_key_env {
            let value = self.resolve_secret(&task.session_id, name).await?;
            env.insert(name.clone(), value);
        }
        Ok(env)
    }

    async fn resolve_secret(&self, session_id: &str, reference: &str) -> Result<String, PoolError> {
        let key = (session_id.to_string(), reference.to_string());
        self.secret_cache
            .get_or_fetch(key, || async {
                self.secrets
                    .resolve(session_id, reference)
                    .await
                    .map_err(|e| PoolError::secret_resolution(reference, format!("{e:#}")))
            })
            .await
    }

    /// Stop and remove a container that is being replaced; failures are logged.
    async fn discard_container(&self, id: &str) {
        if let Err(e) = self.runtime.stop(id).await {
            debug!(container = %id, error = %e, "stop failed");
        }
        match self.runtime.remove(id).await {
            Ok(()) => {}
            Err(e) if e.is_container_lost() => {}
            Err(e) => warn!(container = %id, error = %e, "failed to remove container"),
        }
        self.inspect_cache.invalidate(id);
    }

    /// Create a new container for `env` from the pool's spec and confirm it runs.
    async fn replace_container(&self, env: &ManagedEnvironment) -> Result<String, RuntimeError> {
        let name = container_name(&self.settings.name, env.slot());
        let id = self.runtime.create(&name, &self.spec).await?;
        env.replace_container(id.clone());
        start_confirmed(self.runtime.as_ref(), &id).await?;
        Ok(id)
    }
}

/// Reserve on the first candidate that is still healthy when the
/// reservation is taken. Loads are read without the environment lock, so a
/// candidate may have been flagged since it was picked.
fn reserve_first<'a>(
    candidates: impl IntoIterator<Item = &'a Arc<ManagedEnvironment>>,
    max_pending: usize,
) -> Result<EnvironmentLease, PoolError> {
    for env in candidates {
        match env.try_reserve(max_pending) {
            Err(PoolError::NoHealthyEnvironment) => continue,
            other => return other,
        }
    }
    Err(PoolError::NoHealthyEnvironment)
}

/// Make the image available according to `policy`.
async fn ensure_image(
    runtime: &dyn ContainerRuntime,
    image: &str,
    policy: PullPolicy,
) -> Result<(), RuntimeError> {
    let pull = match policy {
        PullPolicy::Always => true,
        PullPolicy::IfNotPresent => !runtime.image_exists(image).await?,
        PullPolicy::Never => {
            if runtime.image_exists(image).await? {
                false
            } else {
                return Err(RuntimeError::image_not_found(image));
            }
        }
    };
    if pull {
        info!(image, "pulling image");
        runtime.pull_image(image).await?;
    }
    Ok(())
}

/// Force-remove every container labelled as belonging to `pool_name`.
///
/// Returns the IDs that were removed.
pub async fn remove_orphans(
    runtime: &dyn ContainerRuntime,
    pool_name: &str,
) -> Result<Vec<String>, RuntimeError> {
    let ids = runtime.list_labeled(POOL_LABEL, pool_name).await?;
    let mut removed = Vec::with_capacity(ids.len());
    for id in ids {
        match runtime.remove(&id).await {
            Ok(()) => removed.push(id),
            Err(e) if e.is_container_lost() => {}
            Err(e) => warn!(container = %id, error = %e, "failed to remove orphaned container"),
        }
    }
    Ok(removed)
}

/// Create, start and confirm one container; nothing is left behind on failure.
async fn launch(
    runtime: &dyn ContainerRuntime,
    spec: &ContainerSpec,
    name: &str,
) -> Result<String, RuntimeError> {
    let id = runtime.create(name, spec).await?;
    start_confirmed(runtime, &id).await?;
    Ok(id)
}

/// Start a created container and confirm it is running; removes it on failure.
async fn start_confirmed(runtime: &dyn ContainerRuntime, id: &str) -> Result<(), RuntimeError> {
    let result = async {
        runtime.start(id).await?;
        let status = runtime.inspect(id).await?;
        if status.running {
            Ok(())
        } else {
            Err(RuntimeError::container_unhealthy(format!(
                "container {id} is {} after start",
                status.status
            )))
        }
    }
    .await;

    if result.is_err() {
        if let Err(e) = runtime.remove(id).await {
            debug!(container = %id, error = %e, "cleanup after failed start");
        }
    }
    result
}

fn container_name(pool_name: &str, slot: usize) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{pool_name}-{slot}-{}", &suffix[..8])
}
