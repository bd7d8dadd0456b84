//! Sandboxed task-execution pool for LLM subagents.
//!
//! A [`ContainerPool`] keeps a small set of hardened, long-lived containers
//! and runs delegated tasks inside them. Admission is fast-fail: a token
//! bucket bounds the task rate, a circuit breaker sheds load while the
//! container runtime is failing, and a full environment rejects work
//! instead of queuing it. A background health checker replaces containers
//! that stop or report unhealthy.
//!
//! ```no_run
//! use warden::{ContainerPool, PoolConfig, Task};
//!
//! # async fn demo() -> Result<(), warden::PoolError> {
//! let pool = ContainerPool::connect(&PoolConfig::default()).await?;
//! let result = pool.submit(Task::new("task-1", "summarise README.md")).await?;
//! println!("exit {}: {}", result.exit_code, result.stdout);
//! pool.shutdown(std::time::Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod limiter;
pub mod pool;
pub mod runtime;
pub mod secrets;

pub use breaker::CircuitState;
pub use config::{NetworkPolicy, PoolConfig, PoolSettings, PullPolicy};
pub use error::PoolError;
pub use pool::{
    remove_orphans, ContainerPool, EnvironmentSnapshot, Lifecycle, PoolStats, Task, TaskResult,
};
pub use runtime::{ContainerRuntime, DockerRuntime, RuntimeError};
pub use secrets::{EnvSecretResolver, SecretResolver, StaticSecretResolver};
