//! Candidate Model
//!
//! A candidate is one tunnel configuration on disk plus the health state
//! observed for it at runtime. The configuration path is its identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// Priority assigned to entries without a `#PRIORITY:` annotation
pub const DEFAULT_PRIORITY: u8 = 5;

/// Latency sentinel for "unreachable or never measured" (ms)
pub const UNREACHABLE_MS: f64 = 9999.0;

/// Candidate tier, fixed when the list is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Annotated with `#PRIORITY:N`
    Priority,
    /// Plain entry
    Normal,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Priority => write!(f, "priority"),
            Tier::Normal => write!(f, "normal"),
        }
    }
}

/// Measured round-trip latency in milliseconds
///
/// Failures of any kind collapse into [`Latency::UNREACHABLE`], which sorts
/// after every real measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Latency(f64);

impl Latency {
    /// Unreachable / unknown
    pub const UNREACHABLE: Latency = Latency(UNREACHABLE_MS);

    /// Create from milliseconds, rounded to two decimals
    ///
    /// Negative, non-finite and sentinel-or-above values map to unreachable.
    pub fn from_millis(ms: f64) -> Self {
        if !ms.is_finite() || ms < 0.0 || ms >= UNREACHABLE_MS {
            return Self::UNREACHABLE;
        }
        Self((ms * 100.0).round() / 100.0)
    }

    /// Create from an elapsed duration
    pub fn from_duration(elapsed: std::time::Duration) -> Self {
        Self::from_millis(elapsed.as_secs_f64() * 1000.0)
    }

    /// Value in milliseconds (the sentinel for unreachable)
    pub fn as_millis(&self) -> f64 {
        self.0
    }

    /// Was a real measurement taken?
    pub fn is_reachable(&self) -> bool {
        self.0 < UNREACHABLE_MS
    }

    /// Total order used for ranking
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Default for Latency {
    fn default() -> Self {
        Self::UNREACHABLE
    }
}

impl std::fmt::Display for Latency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_reachable() {
            write!(f, "{:.2}ms", self.0)
        } else {
            write!(f, "unreachable")
        }
    }
}

/// Candidate as produced by a [`ConfigSource`](crate::ConfigSource)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSpec {
    /// Path of the tunnel configuration file
    pub path: PathBuf,
    /// Ranking priority (higher = preferred)
    pub priority: u8,
    /// Tier membership
    pub tier: Tier,
    /// Endpoint host extracted from the configuration, if any
    pub host: Option<String>,
}

impl CandidateSpec {
    /// Plain entry with the default priority
    pub fn normal(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            priority: DEFAULT_PRIORITY,
            tier: Tier::Normal,
            host: None,
        }
    }

    /// Entry annotated with an explicit priority
    pub fn prioritized(path: impl Into<PathBuf>, priority: u8) -> Self {
        Self {
            path: path.into(),
            priority,
            tier: Tier::Priority,
            host: None,
        }
    }

    /// Attach the endpoint host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// A known tunnel configuration and its health state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Configuration path (identity)
    pub path: PathBuf,
    /// Ranking priority (higher = preferred)
    pub priority: u8,
    /// Tier membership
    pub tier: Tier,
    /// Endpoint host used for latency probes
    pub host: Option<String>,
    /// Failures since the last successful activation
    pub consecutive_failures: u32,
    /// When this candidate was last committed
    pub last_activated_at: Option<DateTime<Utc>>,
    /// Most recent latency measurement
    pub latency: Latency,
}

impl Candidate {
    /// Build a candidate with fresh health state
    pub fn new(spec: CandidateSpec) -> Result<Self, CandidateError> {
        if spec.path.as_os_str().is_empty() {
            return Err(CandidateError::EmptyPath);
        }
        let host = spec
            .host
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());

        Ok(Self {
            path: spec.path,
            priority: spec.priority,
            tier: spec.tier,
            host,
            consecutive_failures: 0,
            last_activated_at: None,
            latency: Latency::UNREACHABLE,
        })
    }

    /// Short display name (file name of the configuration)
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Does this candidate have the given identity?
    pub fn is(&self, path: &Path) -> bool {
        self.path == path
    }
}

/// Candidate construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CandidateError {
    #[error("Candidate path is empty")]
    EmptyPath,
}
