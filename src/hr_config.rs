// Harness Configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Main Configuration
// ============================================================================

/// Everything one restart run needs, built once and never mutated
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Enable hot-restart persistence on the cluster
    pub persistence_enabled: bool,

    /// Work directory of the run, used as the persistence base directory
    pub persistence_base_dir: PathBuf,

    /// Name of the cache the clients write to
    pub cache_name: String,

    /// Number of cluster members started per iteration
    pub cluster_size: usize,

    /// Number of client contexts
    pub client_count: usize,

    /// Worker threads spawned per client context
    pub workers_per_client: usize,

    /// Number of stop/start cycles
    pub iteration_count: usize,

    /// Time the cluster runs under load before each restart
    pub iteration_duration_seconds: u64,

    /// Keys cycled through by every worker
    pub key_space_size: u64,

    /// Interval between throughput samples
    pub sample_interval_seconds: u64,

    /// What a worker does after a failed write
    pub retry: RetryPolicy,

    /// Connection attempts a client makes before giving up
    pub connection_attempt_limit: u32,

    /// Pause between two connection attempts (milliseconds)
    pub connection_attempt_period_ms: u64,

    /// Export samples as CSV for plotting
    pub csv_output_path: Option<PathBuf>,
}

/// Worker behaviour after a failed write
///
/// The default keeps retrying the same key forever without pausing, which
/// keeps the cluster under full load while it restarts.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per key before the worker moves on (`None` = never give up)
    pub max_attempts: Option<u32>,

    /// Sleep between attempts (milliseconds)
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Whether `attempts` failed writes on one key exhaust the policy
    pub fn exhausted(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) if max > 0 => attempts >= max,
            _ => false,
        }
    }

    pub fn backoff(&self) -> Option<Duration> {
        (self.backoff_ms > 0).then(|| Duration::from_millis(self.backoff_ms))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl HarnessConfig {
    pub fn iteration_duration(&self) -> Duration {
        Duration::from_secs(self.iteration_duration_seconds)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_seconds)
    }

    pub fn connection_attempt_period(&self) -> Duration {
        Duration::from_millis(self.connection_attempt_period_ms)
    }

    /// Total number of worker threads the run keeps alive
    pub fn total_workers(&self) -> usize {
        self.client_count * self.workers_per_client
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject values the driver cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("cluster_size", self.cluster_size as u64),
            ("client_count", self.client_count as u64),
            ("workers_per_client", self.workers_per_client as u64),
            ("key_space_size", self.key_space_size),
            ("sample_interval_seconds", self.sample_interval_seconds),
            ("connection_attempt_limit", self.connection_attempt_limit as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
            }
        }
        if self.cache_name.is_empty() {
            return Err(ConfigError::Invalid("cache_name must not be empty".into()));
        }
        if self.persistence_base_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "persistence_base_dir must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// One-line summary for log output
    pub fn summary(&self) -> String {
        format!(
            "cluster={} clients={}x{} iterations={}x{}s keys={} persistence={} dir={}",
            self.cluster_size,
            self.client_count,
            self.workers_per_client,
            self.iteration_count,
            self.iteration_duration_seconds,
            self.key_space_size,
            self.persistence_enabled,
            self.persistence_base_dir.display()
        )
    }
}

// ============================================================================
// Default Configuration
// ============================================================================

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            persistence_enabled: true,
            persistence_base_dir: PathBuf::from("CacheHRTest_test"),
            cache_name: "test-cache".to_string(),
            cluster_size: 3,
            client_count: 5,
            workers_per_client: 5,
            iteration_count: 20,
            iteration_duration_seconds: 30,
            key_space_size: 1_000_000,
            sample_interval_seconds: 1,
            retry: RetryPolicy::default(),
            connection_attempt_limit: 100,
            connection_attempt_period_ms: 100,
            csv_output_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.total_workers(), 25);
        assert_eq!(config.iteration_duration(), Duration::from_secs(30));
        assert!(config.persistence_enabled);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "
cluster_size: 2
iteration_count: 1
retry:
  max_attempts: 3
";
        let config = HarnessConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cluster_size, 2);
        assert_eq!(config.iteration_count, 1);
        assert_eq!(config.client_count, 5);
        assert_eq!(config.key_space_size, 1_000_000);
        assert_eq!(config.retry.max_attempts, Some(3));
        assert_eq!(config.retry.backoff_ms, 0);
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let config = HarnessConfig {
            key_space_size: 0,
            ..HarnessConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let result = HarnessConfig::from_yaml_str("cluster_size: 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unparseable_yaml() {
        let result = HarnessConfig::from_yaml_str("cluster_size: [not, a, number]");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_retry_policy() {
        let unlimited = RetryPolicy::default();
        assert!(!unlimited.exhausted(u32::MAX));
        assert_eq!(unlimited.backoff(), None);

        let zero = RetryPolicy {
            max_attempts: Some(0),
            backoff_ms: 0,
        };
        assert!(!zero.exhausted(10));

        let bounded = RetryPolicy {
            max_attempts: Some(2),
            backoff_ms: 5,
        };
        assert!(!bounded.exhausted(1));
        assert!(bounded.exhausted(2));
        assert_eq!(bounded.backoff(), Some(Duration::from_millis(5)));
    }
}
