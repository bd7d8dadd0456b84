//! Domain-specific error types for container runtime operations.
//!
//! Typed errors let the pool tell transport failures from a vanished
//! container or an expired task without parsing message strings.

use std::time::Duration;

/// Errors returned by a [`ContainerRuntime`](super::ContainerRuntime).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// Runtime daemon is not running or not reachable.
    #[error("Container runtime is not available: {message}")]
    Unavailable { message: String },

    /// Container image was not found locally.
    #[error("Container image not found: {image}")]
    ImageNotFound { image: String },

    /// The referenced container does not exist (anymore).
    #[error("Container not found: {id}")]
    ContainerNotFound { id: String },

    /// Task process exceeded its execution bound and was killed.
    #[error("Task execution timed out after {}ms", timeout.as_millis())]
    Timeout { timeout: Duration },

    /// Container exists but is not in a usable state (exited, dead, ...).
    #[error("Container is unhealthy: {message}")]
    ContainerUnhealthy { message: String },

    /// Container operation failed (create, start, exec, ...).
    #[error("Container operation failed: {message}")]
    OperationFailed { message: String },
}

impl RuntimeError {
    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `ContainerNotFound` error.
    pub fn container_not_found(id: impl Into<String>) -> Self {
        Self::ContainerNotFound { id: id.into() }
    }

    /// Creates a `Timeout` error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Creates a `ContainerUnhealthy` error.
    pub fn container_unhealthy(message: impl Into<String>) -> Self {
        Self::ContainerUnhealthy {
            message: message.into(),
        }
    }

    /// Creates an `OperationFailed` error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the runtime itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns true if the failure means the container is gone or unusable,
    /// so the environment hosting it must be recycled.
    pub fn is_container_lost(&self) -> bool {
        matches!(
            self,
            Self::ContainerNotFound { .. } | Self::ContainerUnhealthy { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_error() {
        let err = RuntimeError::unavailable("daemon not running");
        assert!(err.is_unavailable());
        assert!(!err.is_timeout());
        assert_eq!(
            err.to_string(),
            "Container runtime is not available: daemon not running"
        );
    }

    #[test]
    fn test_image_not_found_error() {
        let err = RuntimeError::image_not_found("warden-agent:latest");
        assert_eq!(
            err.to_string(),
            "Container image not found: warden-agent:latest"
        );
    }

    #[test]
    fn test_timeout_error() {
        let err = RuntimeError::timeout(Duration::from_secs(3));
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Task execution timed out after 3000ms");
    }

    #[test]
    fn test_container_lost_variants() {
        assert!(RuntimeError::container_not_found("abc").is_container_lost());
        assert!(RuntimeError::container_unhealthy("exited").is_container_lost());
        assert!(!RuntimeError::unavailable("x").is_container_lost());
        assert!(!RuntimeError::operation_failed("x").is_container_lost());
        assert!(!RuntimeError::timeout(Duration::from_secs(1)).is_container_lost());
    }
}
