//! Pool configuration.
//!
//! [`PoolConfig`] is the serde shape of `warden.toml`. Numeric limits and
//! durations left at zero mean "use the default"; [`PoolConfig::resolve`]
//! fills them in, rejects contradictory settings and produces the immutable
//! [`PoolSettings`] a pool runs with.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::runtime::{ContainerSpec, POOL_LABEL, TASK_SCRATCH_DIR};

/// Default config file name.
pub const CONFIG_FILE: &str = "warden.toml";

/// Default memory ceiling per environment.
pub const DEFAULT_MEMORY: &str = "512m";
/// Default CPU ceiling per environment.
pub const DEFAULT_CPUS: f64 = 1.0;
/// Default process-count ceiling per environment.
pub const DEFAULT_PIDS_LIMIT: u32 = 256;
/// Default admission ceiling, tasks per minute.
pub const DEFAULT_RATE_LIMIT: u32 = 60;
/// Default consecutive infra failures before the breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default time the breaker stays open.
pub const DEFAULT_OPEN_DURATION: Duration = Duration::from_secs(30);
/// Default health-check interval.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
/// Default concurrent tasks per environment.
pub const DEFAULT_MAX_PENDING: usize = 4;
/// Default inspect-cache TTL.
pub const DEFAULT_INSPECT_TTL: Duration = Duration::from_secs(5);
/// Default secret-cache TTL.
pub const DEFAULT_SECRET_TTL: Duration = Duration::from_secs(300);
/// Default per-task execution bound.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);
/// Default number of environments.
pub const DEFAULT_POOL_SIZE: usize = 2;

/// Shortest open duration accepted when one is configured.
const MIN_OPEN_DURATION: Duration = Duration::from_secs(1);

/// When to pull the sandbox image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull on every pool start.
    Always,
    /// Pull only if the image is missing locally.
    #[default]
    IfNotPresent,
    /// Never pull; fail if the image is missing.
    Never,
}

impl std::fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::IfNotPresent => write!(f, "if-not-present"),
            Self::Never => write!(f, "never"),
        }
    }
}

/// Network access policy for sandbox containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    /// Default bridge network.
    #[default]
    AllowAll,
    /// No network access.
    Deny,
}

impl std::fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllowAll => write!(f, "allow-all"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

/// Contents of `warden.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name; labels containers and prefixes their names.
    #[serde(default = "default_name")]
    pub name: String,

    /// Sandbox image.
    #[serde(default = "default_image")]
    pub image: String,

    /// When to pull the image.
    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Number of long-lived environments.
    #[serde(default)]
    pub pool_size: usize,

    /// Command the task payload is appended to, shell-split.
    #[serde(default = "default_agent_command")]
    pub agent_command: String,

    /// Name of the env var carrying the LLM API key, resolved as a secret.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Static environment injected into every task.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Upper bound on a single task's execution.
    #[serde(default, with = "duration_str")]
    pub task_timeout: Duration,

    /// Resource ceilings.
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Bind mounts.
    #[serde(default)]
    pub mounts: MountsConfig,

    /// Container hardening.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Network access.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Rate limit and per-environment concurrency.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Circuit breaker.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Health checking.
    #[serde(default)]
    pub health: HealthConfig,

    /// Cache lifetimes.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            image: default_image(),
            pull_policy: PullPolicy::default(),
            pool_size: 0,
            agent_command: default_agent_command(),
            api_key_env: None,
            env: BTreeMap::new(),
            task_timeout: Duration::ZERO,
            resources: ResourceConfig::default(),
            mounts: MountsConfig::default(),
            security: SecurityConfig::default(),
            network: NetworkConfig::default(),
            admission: AdmissionConfig::default(),
            breaker: BreakerConfig::default(),
            health: HealthConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Per-environment resource ceilings, applied at container creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit (e.g., "512m", "2g")
    #[serde(default)]
    pub memory: String,

    /// CPU fraction (e.g., 0.5)
    #[serde(default)]
    pub cpus: f64,

    /// Max processes inside the container
    #[serde(default)]
    pub pids_limit: u32,
}

/// Bind mounts. The four named mounts are always read-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountsConfig {
    /// Agent binary.
    #[serde(default)]
    pub binary: Option<Mount>,
    /// Prompt templates.
    #[serde(default)]
    pub prompts: Option<Mount>,
    /// Skills directory.
    #[serde(default)]
    pub skills: Option<Mount>,
    /// Workspace config.
    #[serde(default)]
    pub config: Option<Mount>,
    /// Additional mounts with their own mode.
    #[serde(default)]
    pub extra: Vec<Mount>,
}

/// One bind mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    /// Host path; a leading `~/` is expanded.
    pub host: String,
    /// Absolute path inside the container.
    pub container: String,
    /// Mount read-only. Ignored for the named mounts, which always are.
    #[serde(default = "default_true")]
    pub readonly: bool,
}

/// Container hardening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Docker security options.
    #[serde(default = "default_security_opt")]
    pub security_opt: Vec<String>,

    /// Capabilities to drop.
    #[serde(default = "default_cap_drop")]
    pub cap_drop: Vec<String>,

    /// Mount the root filesystem read-only.
    #[serde(default = "default_true")]
    pub read_only_rootfs: bool,

    /// Writable scratch mounts; task PID files live in `/tmp`.
    #[serde(default = "default_tmpfs")]
    pub tmpfs: BTreeMap<String, String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            security_opt: default_security_opt(),
            cap_drop: default_cap_drop(),
            read_only_rootfs: true,
            tmpfs: default_tmpfs(),
        }
    }
}

/// Network settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Whether containers get a network.
    #[serde(default)]
    pub policy: NetworkPolicy,
}

/// Admission control.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Tasks accepted per minute.
    #[serde(default)]
    pub rate_limit_per_minute: u32,

    /// Concurrent tasks per environment.
    #[serde(default)]
    pub max_pending: usize,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive infra failures that open the breaker.
    #[serde(default)]
    pub failure_threshold: u32,

    /// How long the breaker stays open before a trial task.
    #[serde(default, with = "duration_str")]
    pub open_duration: Duration,
}

/// Health-check settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Time between checks.
    #[serde(default, with = "duration_str")]
    pub interval: Duration,
}

/// Cache lifetimes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a container inspect result is reused.
    #[serde(default, with = "duration_str")]
    pub inspect_ttl: Duration,

    /// How long a resolved secret is reused within a session.
    #[serde(default, with = "duration_str")]
    pub secret_ttl: Duration,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_name() -> String {
    "warden".to_string()
}

fn default_image() -> String {
    "warden-agent:latest".to_string()
}

fn default_agent_command() -> String {
    "agent run --prompt".to_string()
}

fn default_security_opt() -> Vec<String> {
    vec!["no-new-privileges:true".to_string()]
}

fn default_cap_drop() -> Vec<String> {
    vec!["ALL".to_string()]
}

fn default_tmpfs() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "/tmp".to_string(),
        "rw,nosuid,nodev,size=64m".to_string(),
    )])
}

impl PoolConfig {
    /// Load configuration from file, using defaults if not found
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply defaults to zero-valued fields and validate.
    pub fn resolve(&self) -> Result<PoolSettings, PoolError> {
        if self.image.trim().is_empty() {
            return Err(PoolError::invalid_config("image must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(PoolError::invalid_config("name must not be empty"));
        }

        let agent_command = shell_words::split(&self.agent_command).map_err(|e| {
            PoolError::invalid_config(format!("agent_command cannot be parsed: {e}"))
        })?;
        if agent_command.is_empty() {
            return Err(PoolError::invalid_config("agent_command must not be empty"));
        }

        let memory = if self.resources.memory.trim().is_empty() {
            DEFAULT_MEMORY
        } else {
            self.resources.memory.as_str()
        };
        let memory_bytes = parse_memory_limit(memory)?;
        let memory_bytes = if memory_bytes == 0 {
            parse_memory_limit(DEFAULT_MEMORY)?
        } else {
            memory_bytes
        };

        let cpus = self.resources.cpus;
        if !cpus.is_finite() || cpus < 0.0 {
            return Err(PoolError::invalid_config(format!(
                "cpus must be a non-negative number, got {cpus}"
            )));
        }
        let cpus = if cpus == 0.0 { DEFAULT_CPUS } else { cpus };

        let pids_limit = or_default(self.resources.pids_limit, DEFAULT_PIDS_LIMIT);
        let max_pending = or_default(self.admission.max_pending, DEFAULT_MAX_PENDING);
        if max_pending > usize::try_from(pids_limit).unwrap_or(usize::MAX) {
            return Err(PoolError::invalid_config(format!(
                "max_pending ({max_pending}) exceeds pids_limit ({pids_limit})"
            )));
        }

        // Killing a single task needs its PID file; a read-only root leaves
        // nowhere to write it unless the scratch directory is a tmpfs.
        if self.security.read_only_rootfs
            && !self.security.tmpfs.contains_key(TASK_SCRATCH_DIR)
        {
            return Err(PoolError::invalid_config(format!(
                "read_only_rootfs requires a tmpfs mount at {TASK_SCRATCH_DIR}"
            )));
        }

        let open_duration = self.breaker.open_duration;
        if !open_duration.is_zero() && open_duration < MIN_OPEN_DURATION {
            return Err(PoolError::invalid_config(format!(
                "breaker open_duration must be at least 1s, got {}ms",
                open_duration.as_millis()
            )));
        }

        Ok(PoolSettings {
            name: self.name.clone(),
            image: self.image.clone(),
            pull_policy: self.pull_policy,
            pool_size: or_default(self.pool_size, DEFAULT_POOL_SIZE),
            agent_command,
            api_key_env: self.api_key_env.clone().filter(|name| !name.is_empty()),
            env: self.env.clone(),
            memory_bytes,
            cpus,
            pids_limit,
            binds: self.mounts.binds()?,
            security_opt: self.security.security_opt.clone(),
            cap_drop: self.security.cap_drop.clone(),
            read_only_rootfs: self.security.read_only_rootfs,
            tmpfs: self.security.tmpfs.clone(),
            network: self.network.policy,
            rate_limit_per_minute: or_default(
                self.admission.rate_limit_per_minute,
                DEFAULT_RATE_LIMIT,
            ),
            max_pending,
            failure_threshold: or_default(
                self.breaker.failure_threshold,
                DEFAULT_FAILURE_THRESHOLD,
            ),
            open_duration: or_default(open_duration, DEFAULT_OPEN_DURATION),
            health_interval: or_default(self.health.interval, DEFAULT_HEALTH_INTERVAL),
            inspect_ttl: or_default(self.cache.inspect_ttl, DEFAULT_INSPECT_TTL),
            secret_ttl: or_default(self.cache.secret_ttl, DEFAULT_SECRET_TTL),
            task_timeout: or_default(self.task_timeout, DEFAULT_TASK_TIMEOUT),
        })
    }
}

impl MountsConfig {
    fn binds(&self) -> Result<Vec<String>, PoolError> {
        let named = [&self.binary, &self.prompts, &self.skills, &self.config];
        let mut binds = Vec::new();

        for mount in named.into_iter().flatten() {
            binds.push(bind(mount, true)?);
        }
        for mount in &self.extra {
            binds.push(bind(mount, mount.readonly)?);
        }
        Ok(binds)
    }
}

fn bind(mount: &Mount, readonly: bool) -> Result<String, PoolError> {
    if !mount.container.starts_with('/') {
        return Err(PoolError::invalid_config(format!(
            "mount target must be an absolute path: {}",
            mount.container
        )));
    }
    let host_path = expand_path(&mount.host)?;
    let mode = if readonly { "ro" } else { "rw" };
    Ok(format!("{}:{}:{}", host_path, mount.container, mode))
}

fn or_default<T: Default + PartialEq>(value: T, default: T) -> T {
    if value == T::default() {
        default
    } else {
        value
    }
}

/// Fully resolved pool settings. Immutable once a pool is built.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    /// Pool name.
    pub name: String,
    /// Sandbox image.
    pub image: String,
    /// When to pull the image.
    pub pull_policy: PullPolicy,
    /// Number of environments.
    pub pool_size: usize,
    /// Agent command, already split; the payload is appended.
    pub agent_command: Vec<String>,
    /// Env var carrying the API key, if any.
    pub api_key_env: Option<String>,
    /// Static task environment.
    pub env: BTreeMap<String, String>,
    /// Memory ceiling in bytes.
    pub memory_bytes: i64,
    /// CPU ceiling.
    pub cpus: f64,
    /// Process-count ceiling.
    pub pids_limit: u32,
    /// Bind mounts in `host:container:mode` form.
    pub binds: Vec<String>,
    /// Docker security options.
    pub security_opt: Vec<String>,
    /// Dropped capabilities.
    pub cap_drop: Vec<String>,
    /// Read-only root filesystem.
    pub read_only_rootfs: bool,
    /// Tmpfs mounts and their options.
    pub tmpfs: BTreeMap<String, String>,
    /// Network policy.
    pub network: NetworkPolicy,
    /// Admission rate, tasks per minute.
    pub rate_limit_per_minute: u32,
    /// Concurrent tasks per environment.
    pub max_pending: usize,
    /// Breaker failure threshold.
    pub failure_threshold: u32,
    /// Breaker open duration.
    pub open_duration: Duration,
    /// Health-check interval.
    pub health_interval: Duration,
    /// Inspect-cache TTL.
    pub inspect_ttl: Duration,
    /// Secret-cache TTL.
    pub secret_ttl: Duration,
    /// Per-task execution bound.
    pub task_timeout: Duration,
}

impl PoolSettings {
    /// The container description every environment is created from.
    pub fn container_spec(&self) -> ContainerSpec {
        #[allow(clippy::cast_possible_truncation)] // cpus is validated finite and small
        let nano_cpus = (self.cpus * 1_000_000_000.0) as i64;

        ContainerSpec {
            image: self.image.clone(),
            name_prefix: self.name.clone(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            env: self
                .env
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect(),
            labels: HashMap::from([(POOL_LABEL.to_string(), self.name.clone())]),
            binds: self.binds.clone(),
            tmpfs: self
                .tmpfs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            memory_bytes: self.memory_bytes,
            nano_cpus,
            pids_limit: i64::from(self.pids_limit),
            security_opt: self.security_opt.clone(),
            cap_drop: self.cap_drop.clone(),
            read_only_rootfs: self.read_only_rootfs,
            network_disabled: self.network == NetworkPolicy::Deny,
        }
    }
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> Result<String, PoolError> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| PoolError::invalid_config("Could not determine home directory"))?;
        Ok(home.join(rest).display().to_string())
    } else {
        Ok(path.to_string())
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64, PoolError> {
    let limit = limit.trim().to_lowercase();
    let invalid = || PoolError::invalid_config(format!("Invalid memory limit: {limit}"));

    let (num, multiplier) = if let Some(num) = limit.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        (num, 1024)
    } else {
        (limit.as_str(), 1)
    };

    let value: i64 = num.parse().map_err(|_| invalid())?;
    if value < 0 {
        return Err(invalid());
    }
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Parse a duration string ("500ms", "30s", "5m", "1h"; bare numbers are seconds).
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim().to_lowercase();
    let invalid = || format!("Invalid duration: '{value}'");

    let (num, unit_ms): (&str, u64) = if let Some(num) = value.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = value.strip_suffix('s') {
        (num, 1_000)
    } else if let Some(num) = value.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = value.strip_suffix('h') {
        (num, 3_600_000)
    } else {
        (value.as_str(), 1_000)
    };

    let amount: u64 = num.trim().parse().map_err(|_| invalid())?;
    amount
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// Format a duration the way [`parse_duration`] reads it.
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms % 1_000 != 0 {
        format!("{ms}ms")
    } else if ms % 60_000 != 0 || ms == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{}m", ms / 60_000)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_values_resolve_to_defaults() {
        let settings = PoolConfig::default().resolve().unwrap();
        assert_eq!(settings.memory_bytes, 512 * 1024 * 1024);
        assert!((settings.cpus - DEFAULT_CPUS).abs() < f64::EPSILON);
        assert_eq!(settings.pids_limit, DEFAULT_PIDS_LIMIT);
        assert_eq!(settings.rate_limit_per_minute, DEFAULT_RATE_LIMIT);
        assert_eq!(settings.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(settings.open_duration, DEFAULT_OPEN_DURATION);
        assert_eq!(settings.health_interval, DEFAULT_HEALTH_INTERVAL);
        assert_eq!(settings.max_pending, DEFAULT_MAX_PENDING);
        assert_eq!(settings.inspect_ttl, DEFAULT_INSPECT_TTL);
        assert_eq!(settings.secret_ttl, DEFAULT_SECRET_TTL);
        assert_eq!(settings.task_timeout, DEFAULT_TASK_TIMEOUT);
        assert_eq!(settings.pool_size, DEFAULT_POOL_SIZE);
    }

    #[test]
    fn test_explicit_zeros_in_file_resolve_to_defaults() {
        let toml = r#"
task_timeout = "0s"

[resources]
memory = "0"
cpus = 0.0
pids_limit = 0

[admission]
rate_limit_per_minute = 0
max_pending = 0

[breaker]
failure_threshold = 0
open_duration = "0s"

[health]
interval = "0s"

[cache]
inspect_ttl = "0ms"
secret_ttl = "0"
"#;
        let config: PoolConfig = toml::from_str(toml).unwrap();
        let settings = config.resolve().unwrap();
        assert_eq!(settings, PoolConfig::default().resolve().unwrap());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
name = "subagents"
image = "registry.local/agent:1.2"
pull_policy = "never"
pool_size = 3
agent_command = "/opt/agent/bin/agent run --message"
api_key_env = "ANTHROPIC_API_KEY"
task_timeout = "2m"

[env]
RUST_LOG = "info"

[resources]
memory = "1g"
cpus = 0.5
pids_limit = 128

[mounts.binary]
host = "/usr/local/bin/agent"
container = "/opt/agent/bin/agent"
readonly = false

[[mounts.extra]]
host = "/srv/workspace"
container = "/workspace"
readonly = false

[network]
policy = "deny"

[admission]
rate_limit_per_minute = 120
max_pending = 8

[breaker]
failure_threshold = 3
open_duration = "10s"

[health]
interval = "15s"
"#;
        let config: PoolConfig = toml::from_str(toml).unwrap();
        let settings = config.resolve().unwrap();

        assert_eq!(settings.name, "subagents");
        assert_eq!(settings.pull_policy, PullPolicy::Never);
        assert_eq!(settings.pool_size, 3);
        assert_eq!(
            settings.agent_command,
            vec!["/opt/agent/bin/agent", "run", "--message"]
        );
        assert_eq!(settings.api_key_env.as_deref(), Some("ANTHROPIC_API_KEY"));
        assert_eq!(settings.task_timeout, Duration::from_secs(120));
        assert_eq!(settings.memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(settings.pids_limit, 128);
        assert_eq!(settings.max_pending, 8);
        assert_eq!(settings.failure_threshold, 3);
        assert_eq!(settings.open_duration, Duration::from_secs(10));
        assert_eq!(settings.health_interval, Duration::from_secs(15));
        assert_eq!(settings.network, NetworkPolicy::Deny);
        // Named mounts are forced read-only.
        assert_eq!(
            settings.binds,
            vec![
                "/usr/local/bin/agent:/opt/agent/bin/agent:ro".to_string(),
                "/srv/workspace:/workspace:rw".to_string(),
            ]
        );
    }

    #[test]
    fn test_rejects_short_open_duration() {
        let mut config = PoolConfig::default();
        config.breaker.open_duration = Duration::from_millis(500);
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("open_duration"));
    }

    #[test]
    fn test_rejects_concurrency_above_pids_limit() {
        let mut config = PoolConfig::default();
        config.resources.pids_limit = 4;
        config.admission.max_pending = 8;
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_rejects_negative_cpus_and_relative_mounts() {
        let mut config = PoolConfig::default();
        config.resources.cpus = -1.0;
        assert!(config.resolve().is_err());

        let mut config = PoolConfig::default();
        config.mounts.extra.push(Mount {
            host: "/srv".to_string(),
            container: "workspace".to_string(),
            readonly: true,
        });
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_read_only_rootfs_requires_scratch_tmpfs() {
        let mut config = PoolConfig::default();
        config.security.tmpfs.clear();
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("/tmp"), "unexpected error: {err}");

        config.security.tmpfs.insert("/var/scratch".to_string(), "rw".to_string());
        assert!(config.resolve().is_err());

        config.security.read_only_rootfs = false;
        assert!(config.resolve().is_ok());
    }

    #[test]
    fn test_rejects_unparseable_agent_command() {
        let mut config = PoolConfig::default();
        config.agent_command = "agent 'unterminated".to_string();
        assert!(config.resolve().is_err());
        config.agent_command = "   ".to_string();
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_container_spec_carries_limits_and_label() {
        let settings = PoolConfig::default().resolve().unwrap();
        let spec = settings.container_spec();
        assert_eq!(spec.nano_cpus, 1_000_000_000);
        assert_eq!(spec.pids_limit, 256);
        assert!(spec.read_only_rootfs);
        assert_eq!(spec.security_opt, vec!["no-new-privileges:true"]);
        assert_eq!(spec.labels.get(POOL_LABEL).map(String::as_str), Some("warden"));
        assert!(spec.tmpfs.contains_key("/tmp"));
        assert!(!spec.network_disabled);
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("8g").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("2048").unwrap(), 2048);
        assert!(parse_memory_limit("-1g").is_err());
        assert!(parse_memory_limit("lots").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(600)), "10m");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/usr/bin").unwrap(), "/usr/bin");

        if dirs::home_dir().is_some() {
            let expanded = expand_path("~/.ssh").unwrap();
            assert!(!expanded.starts_with('~'));
            assert!(expanded.ends_with("/.ssh"));
        }
    }
}
