//! Container runtime seam.
//!
//! The pool talks to its sandboxes only through [`ContainerRuntime`].
//! [`DockerRuntime`] is the production implementation; tests use an
//! in-memory mock.

mod docker;
mod error;
#[cfg(test)]
pub(crate) mod mock;

pub use docker::DockerRuntime;
pub use error::RuntimeError;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// Label attached to every container a pool creates, valued with the pool name.
pub const POOL_LABEL: &str = "warden.pool";

/// Directory inside each container where task PID files are written. Must be
/// writable even when the root filesystem is read-only.
pub const TASK_SCRATCH_DIR: &str = "/tmp";

/// Everything needed to create one sandbox container.
///
/// Built once per pool so recycled containers are identical to the ones
/// they replace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Prefix for generated container names.
    pub name_prefix: String,
    /// Keep-alive command run as the container's main process.
    pub command: Vec<String>,
    /// Static `KEY=VALUE` environment.
    pub env: Vec<String>,
    /// Labels, including [`POOL_LABEL`].
    pub labels: HashMap<String, String>,
    /// Bind mounts in `host:container:mode` form.
    pub binds: Vec<String>,
    /// tmpfs mounts, container path to mount options.
    pub tmpfs: HashMap<String, String>,
    /// Memory ceiling in bytes.
    pub memory_bytes: i64,
    /// CPU ceiling in billionths of a CPU.
    pub nano_cpus: i64,
    /// Process-count ceiling.
    pub pids_limit: i64,
    /// Security options such as `no-new-privileges:true`.
    pub security_opt: Vec<String>,
    /// Capabilities to drop.
    pub cap_drop: Vec<String>,
    /// Mount the root filesystem read-only.
    pub read_only_rootfs: bool,
    /// Disable networking entirely.
    pub network_disabled: bool,
}

/// Result of inspecting a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStatus {
    /// Whether the main process is running.
    pub running: bool,
    /// Health probe result, if the image defines one.
    pub health: HealthProbe,
    /// Raw runtime status string (`running`, `exited`, ...).
    pub status: String,
}

impl ContainerStatus {
    /// A container is usable when it runs and no probe reports it unhealthy.
    pub fn is_healthy(&self) -> bool {
        self.running && self.health != HealthProbe::Unhealthy
    }
}

/// Health probe state reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthProbe {
    /// The image defines no probe.
    None,
    /// Probe has not settled yet.
    Starting,
    /// Probe passes.
    Healthy,
    /// Probe fails.
    Unhealthy,
}

/// A command to execute inside a running container.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Identifier used to tag the process so it alone can be killed.
    pub task_id: String,
    /// Command line.
    pub command: Vec<String>,
    /// Environment variables for the process only.
    pub env: BTreeMap<String, String>,
    /// Execution bound; the process is killed when it elapses.
    pub timeout: Duration,
}

/// Captured output of an exec'd process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Process exit code.
    pub exit_code: i64,
}

/// Operations the pool needs from a container runtime.
///
/// Every method must be safe to call concurrently.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime is reachable.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Whether `image` is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Pull `image` from its registry.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a container named `name` and return its ID.
    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Start a created container.
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stop a running container.
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Report running and health status.
    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError>;

    /// Run a process inside a container, bounded by `request.timeout`.
    ///
    /// Returns [`RuntimeError::Timeout`] after killing the process when the
    /// bound elapses. If the returned future is dropped early the process is
    /// killed as well. The container itself is never stopped.
    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError>;

    /// IDs of all containers (running or not) labelled `label=value`.
    async fn list_labeled(&self, label: &str, value: &str) -> Result<Vec<String>, RuntimeError>;
}
