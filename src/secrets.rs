//! Secret resolution for task environments.
//!
//! Task environment values of the form `$NAME` or `${NAME}` are references
//! to secrets, turned into concrete values by a [`SecretResolver`] just
//! before the task runs. Values never appear in logs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;

/// Turns a secret reference into its value for a given session.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolve `reference` (the name, without `$`) for `session_id`.
    async fn resolve(&self, session_id: &str, reference: &str) -> Result<String>;
}

/// Extract the reference name from a `$NAME` / `${NAME}` value.
///
/// Returns `None` for plain values.
pub fn secret_reference(value: &str) -> Option<&str> {
    let name = value.strip_prefix('$')?;
    let name = match name.strip_prefix('{') {
        Some(inner) => inner.strip_suffix('}')?,
        None => name,
    };
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    valid.then_some(name)
}

/// Resolves references from the host process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretResolver;

impl EnvSecretResolver {
    /// Creates a new `EnvSecretResolver`.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve(&self, _session_id: &str, reference: &str) -> Result<String> {
        match std::env::var(reference) {
            Ok(value) => Ok(value),
            Err(_) => bail!("environment variable {reference} is not set"),
        }
    }
}

/// In-memory resolver, optionally scoped per session.
///
/// Session-scoped values take precedence over global ones.
#[derive(Clone, Default)]
pub struct StaticSecretResolver {
    global: Arc<RwLock<HashMap<String, String>>>,
    scoped: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl std::fmt::Debug for StaticSecretResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.global.read().map(|g| g.len()).unwrap_or_default()
            + self.scoped.read().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("StaticSecretResolver")
            .field("count", &count)
            .finish()
    }
}

impl StaticSecretResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value visible to every session.
    pub fn insert(&self, reference: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut global) = self.global.write() {
            global.insert(reference.into(), value.into());
        }
    }

    /// Set a value visible to one session only.
    pub fn insert_scoped(
        &self,
        session_id: impl Into<String>,
        reference: impl Into<String>,
        value: impl Into<String>,
    ) {
        if let Ok(mut scoped) = self.scoped.write() {
            scoped.insert((session_id.into(), reference.into()), value.into());
        }
    }
}

#[async_trait]
impl SecretResolver for StaticSecretResolver {
    async fn resolve(&self, session_id: &str, reference: &str) -> Result<String> {
        let scoped = self
            .scoped
            .read()
            .ok()
            .and_then(|s| s.get(&(session_id.to_string(), reference.to_string())).cloned());
        if let Some(value) = scoped {
            return Ok(value);
        }
        let global = self
            .global
            .read()
            .ok()
            .and_then(|g| g.get(reference).cloned());
        match global {
            Some(value) => Ok(value),
            None => bail!("secret {reference} is not defined"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_reference_forms() {
        assert_eq!(secret_reference("$GITHUB_TOKEN"), Some("GITHUB_TOKEN"));
        assert_eq!(secret_reference("${API_KEY}"), Some("API_KEY"));
        assert_eq!(secret_reference("plain value"), None);
        assert_eq!(secret_reference("$"), None);
        assert_eq!(secret_reference("${UNCLOSED"), None);
        assert_eq!(secret_reference("$1ABC"), None);
        assert_eq!(secret_reference("$with space"), None);
    }

    #[tokio::test]
    async fn test_static_resolver_prefers_session_scope() {
        let secrets = StaticSecretResolver::new();
        secrets.insert("TOKEN", "global");
        secrets.insert_scoped("session-a", "TOKEN", "scoped");

        assert_eq!(secrets.resolve("session-a", "TOKEN").await.unwrap(), "scoped");
        assert_eq!(secrets.resolve("session-b", "TOKEN").await.unwrap(), "global");
        assert!(secrets.resolve("session-a", "MISSING").await.is_err());
    }

    #[tokio::test]
    async fn test_env_resolver_missing_variable() {
        let resolver = EnvSecretResolver::new();
        let err = resolver
            .resolve("s", "WARDEN_TEST_SURELY_UNSET_VARIABLE")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not set"));
    }

    #[test]
    fn test_debug_hides_values() {
        let secrets = StaticSecretResolver::new();
        secrets.insert("TOKEN", "hunter2");
        let rendered = format!("{secrets:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("count"));
    }
}
