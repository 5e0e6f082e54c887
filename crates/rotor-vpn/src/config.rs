//! Rotor Configuration
//!
//! Operator settings for the candidate list location, rotation cadence,
//! failover policy and probes. Loadable from TOML or JSON; every field
//! has a default so partial files are fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Failover policy constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    /// Candidates at or above this many consecutive failures are skipped
    pub max_failures: u32,
    /// A tunnel is usable iff its latency is strictly below this (ms)
    pub usable_latency_ms: f64,
    /// Wait after stopping tunnels before starting the next one
    pub stop_settle_ms: u64,
    /// Wait after launch before verifying
    pub start_settle_ms: u64,
    /// Upper bound on the launcher call
    pub start_timeout_ms: u64,
    /// Wait between failed attempts within one rotation
    pub retry_backoff_ms: u64,
    /// Attempts per rotation before giving up
    pub max_rotation_attempts: u32,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_failures: 3,
            usable_latency_ms: 500.0,
            stop_settle_ms: 2_000,
            start_settle_ms: 3_000,
            start_timeout_ms: 10_000,
            retry_backoff_ms: 2_000,
            max_rotation_attempts: 5,
        }
    }
}

impl RotationPolicy {
    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Latency probe implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// System `ping` (ICMP echo)
    Ping,
    /// TCP connect timing
    Tcp,
}

/// Probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub kind: ProbeKind,
    /// Latency probe timeout
    pub timeout_ms: u64,
    /// Port used by the TCP probe
    pub tcp_port: u16,
    /// Well-known endpoint for the reachability check (plain HTTP)
    pub reachability_url: String,
    pub reachability_timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            kind: ProbeKind::Ping,
            timeout_ms: 2_000,
            tcp_port: 443,
            reachability_url: "http://1.1.1.1".to_string(),
            reachability_timeout_ms: 3_000,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_millis(self.reachability_timeout_ms)
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotorConfig {
    /// Base directory; relative paths below resolve against it
    pub config_dir: PathBuf,
    /// Candidate list (one configuration path per line)
    pub list_file: PathBuf,
    /// Usage statistics file
    pub stats_file: PathBuf,
    /// Seconds between scheduled rotations
    pub rotation_interval_secs: u64,
    /// Seconds between health checks of the active tunnel
    pub health_interval_secs: u64,
    pub policy: RotationPolicy,
    pub probe: ProbeConfig,
}

impl Default for RotorConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("~/vpn-advanced"),
            list_file: PathBuf::from("lists/config_list.txt"),
            stats_file: PathBuf::from("logs/rotation_stats.json"),
            rotation_interval_secs: 300,
            health_interval_secs: 60,
            policy: RotationPolicy::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl RotorConfig {
    /// Load from a file, picking the format from the extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config = match ext {
            "toml" => Self::from_toml_file(path)?,
            "json" => Self::from_json_file(path)?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rotation_interval_secs == 0 {
            return Err(ConfigError::Invalid("rotation_interval_secs must be > 0".into()));
        }
        if self.health_interval_secs == 0 {
            return Err(ConfigError::Invalid("health_interval_secs must be > 0".into()));
        }
        if self.policy.max_failures == 0 {
            return Err(ConfigError::Invalid("policy.max_failures must be > 0".into()));
        }
        if self.policy.max_rotation_attempts == 0 {
            return Err(ConfigError::Invalid(
                "policy.max_rotation_attempts must be > 0".into(),
            ));
        }
        if self.policy.usable_latency_ms.is_nan() || self.policy.usable_latency_ms <= 0.0 {
            return Err(ConfigError::Invalid("policy.usable_latency_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// Base directory with `~` expanded
    pub fn base_dir(&self) -> PathBuf {
        expand_home(&self.config_dir)
    }

    /// Absolute path of the candidate list
    pub fn list_path(&self) -> PathBuf {
        self.resolve(&self.list_file)
    }

    /// Absolute path of the statistics file
    pub fn stats_path(&self) -> PathBuf {
        self.resolve(&self.stats_file)
    }

    /// Resolve a path against the base directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let expanded = expand_home(path);
        if expanded.is_absolute() {
            expanded
        } else {
            self.base_dir().join(expanded)
        }
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RotorConfig::default();

        assert_eq!(config.rotation_interval(), Duration::from_secs(300));
        assert_eq!(config.health_interval(), Duration::from_secs(60));
        assert_eq!(config.policy.max_failures, 3);
        assert_eq!(config.policy.usable_latency_ms, 500.0);
        assert_eq!(config.policy.stop_settle(), Duration::from_secs(2));
        assert_eq!(config.policy.start_settle(), Duration::from_secs(3));
        assert_eq!(config.policy.start_timeout(), Duration::from_secs(10));
        assert_eq!(config.probe.timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = RotorConfig::from_toml(
            r#"
            config_dir = "/etc/rotor"
            rotation_interval_secs = 120

            [policy]
            max_rotation_attempts = 2

            [probe]
            kind = "tcp"
            "#,
        )
        .unwrap();

        assert_eq!(config.rotation_interval_secs, 120);
        assert_eq!(config.policy.max_rotation_attempts, 2);
        assert_eq!(config.policy.max_failures, 3);
        assert_eq!(config.probe.kind, ProbeKind::Tcp);
        assert_eq!(config.list_path(), PathBuf::from("/etc/rotor/lists/config_list.txt"));
    }

    #[test]
    fn test_json_and_toml_agree() {
        let config = RotorConfig::default();
        let from_toml = RotorConfig::from_toml(&config.to_toml()).unwrap();
        let from_json = RotorConfig::from_json(r#"{"health_interval_secs": 60}"#).unwrap();

        assert_eq!(from_toml, config);
        assert_eq!(from_json, config);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = RotorConfig::default();
        config.policy.max_rotation_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RotorConfig::default();
        config.rotation_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("rotor.toml");
        std::fs::write(&toml_path, "health_interval_secs = 30\n").unwrap();
        assert_eq!(RotorConfig::load(&toml_path).unwrap().health_interval_secs, 30);

        let yaml_path = dir.path().join("rotor.yaml");
        std::fs::write(&yaml_path, "").unwrap();
        assert!(matches!(
            RotorConfig::load(&yaml_path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_absolute_paths_kept() {
        let mut config = RotorConfig::default();
        config.stats_file = PathBuf::from("/var/lib/rotor/stats.json");
        assert_eq!(config.stats_path(), PathBuf::from("/var/lib/rotor/stats.json"));
    }
}
