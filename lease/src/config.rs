use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    acquire::{LeaseCoordinator, RetryPolicy},
    allocator::DEFAULT_LEASE_DURATION,
    store::HttpObjectStore,
    Error, Result,
};

pub const ENV_ENDPOINT: &str = "SLOTLEASE_ENDPOINT";
pub const ENV_NAMESPACE: &str = "SLOTLEASE_NAMESPACE";
pub const ENV_BUCKET: &str = "SLOTLEASE_BUCKET";
pub const ENV_OBJECT: &str = "SLOTLEASE_OBJECT";
pub const ENV_LEASE_SECS: &str = "SLOTLEASE_LEASE_SECS";
pub const ENV_MAX_ATTEMPTS: &str = "SLOTLEASE_MAX_ATTEMPTS";

/// Where the ledger lives and how the coordinator talks to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoint: String,
    pub namespace: String,
    pub bucket: String,
    pub object: String,
    pub lease_duration_secs: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:7070".to_string(),
            namespace: "default".to_string(),
            bucket: "lease-bucket".to_string(),
            object: "leases".to_string(),
            lease_duration_secs: DEFAULT_LEASE_DURATION.as_secs(),
            connect_timeout_ms: 3_000,
            request_timeout_ms: 60_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `SLOTLEASE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps an env var name to its value.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = endpoint;
        }
        if let Some(namespace) = lookup(ENV_NAMESPACE) {
            self.namespace = namespace;
        }
        if let Some(bucket) = lookup(ENV_BUCKET) {
            self.bucket = bucket;
        }
        if let Some(object) = lookup(ENV_OBJECT) {
            self.object = object;
        }
        if let Some(secs) = lookup(ENV_LEASE_SECS) {
            self.lease_duration_secs = parse_number(ENV_LEASE_SECS, &secs)?;
        }
        if let Some(attempts) = lookup(ENV_MAX_ATTEMPTS) {
            self.retry.max_attempts = parse_number(ENV_MAX_ATTEMPTS, &attempts)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("namespace", &self.namespace),
            ("bucket", &self.bucket),
            ("object", &self.object),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!("{name} must not be empty")));
            }
        }
        if self.lease_duration_secs == 0 {
            return Err(Error::Config("lease duration must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(Error::Config(
                "retry.initial_backoff exceeds retry.max_backoff".into(),
            ));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn store(&self) -> Result<HttpObjectStore> {
        HttpObjectStore::new(
            &self.endpoint,
            &self.namespace,
            &self.bucket,
            &self.object,
            Duration::from_millis(self.connect_timeout_ms),
            Duration::from_millis(self.request_timeout_ms),
        )
    }

    /// Coordinator over the configured HTTP object store.
    pub fn coordinator(&self) -> Result<LeaseCoordinator> {
        Ok(LeaseCoordinator::new(Arc::new(self.store()?))
            .with_retry(self.retry)
            .with_lease_duration(self.lease_duration()))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bucket, "lease-bucket");
        assert_eq!(config.object, "leases");
        assert_eq!(config.lease_duration(), Duration::from_secs(3 * 60 * 60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::default()
            .with_overrides(env(&[
                (ENV_ENDPOINT, "http://objects:8080"),
                (ENV_NAMESPACE, "ci"),
                (ENV_LEASE_SECS, "600"),
                (ENV_MAX_ATTEMPTS, " 4 "),
            ]))
            .unwrap();

        assert_eq!(config.endpoint, "http://objects:8080");
        assert_eq!(config.namespace, "ci");
        assert_eq!(config.bucket, "lease-bucket");
        assert_eq!(config.lease_duration(), Duration::from_secs(600));
        assert_eq!(config.retry.max_attempts, 4);
    }

    #[test]
    fn test_bad_env_values() {
        assert!(matches!(
            Config::default().with_overrides(env(&[(ENV_LEASE_SECS, "3h")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::default().with_overrides(env(&[(ENV_MAX_ATTEMPTS, "0")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::default().with_overrides(env(&[(ENV_BUCKET, "")])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"namespace": "ci", "object": "ci-leases", "retry": {{"max_attempts": 3}}}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.namespace, "ci");
        assert_eq!(config.object, "ci-leases");
        assert_eq!(config.bucket, "lease-bucket");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.max_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "endpoint = 'toml is not json'").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_coordinator_from_config() {
        let config = Config::default()
            .with_overrides(env(&[(ENV_LEASE_SECS, "60")]))
            .unwrap();
        let coordinator = config.coordinator().unwrap();
        assert_eq!(coordinator.lease_duration(), Duration::from_secs(60));
        assert_eq!(coordinator.retry_policy(), &config.retry);
    }
}
