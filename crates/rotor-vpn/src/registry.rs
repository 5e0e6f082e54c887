//! Candidate Registry
//!
//! Holds every known candidate for the lifetime of the process, split
//! into the priority tier and the normal tier. Candidates are never
//! removed; only their health fields change.

use crate::candidate::{Candidate, CandidateSpec, Latency, Tier};
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

/// In-memory set of candidates
#[derive(Debug, Clone, Default)]
pub struct CandidateRegistry {
    /// Candidates annotated with an explicit priority
    priority: Vec<Candidate>,
    /// Everything else
    normal: Vec<Candidate>,
}

impl CandidateRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from loaded specs
    ///
    /// Duplicate paths and invalid specs are skipped with a warning;
    /// the first occurrence of a path wins.
    pub fn from_specs(specs: impl IntoIterator<Item = CandidateSpec>) -> Self {
        let mut registry = Self::new();
        let mut seen = HashSet::new();

        for spec in specs {
            if !seen.insert(spec.path.clone()) {
                warn!("Duplicate candidate {} ignored", spec.path.display());
                continue;
            }
            match Candidate::new(spec) {
                Ok(candidate) => registry.push(candidate),
                Err(e) => warn!("Invalid candidate skipped: {}", e),
            }
        }

        debug!(
            "Registry loaded: {} priority, {} normal",
            registry.priority.len(),
            registry.normal.len()
        );
        registry
    }

    fn push(&mut self, candidate: Candidate) {
        match candidate.tier {
            Tier::Priority => self.priority.push(candidate),
            Tier::Normal => self.normal.push(candidate),
        }
    }

    /// All candidates, priority tier first, each tier in load order
    pub fn all(&self) -> impl Iterator<Item = &Candidate> {
        self.priority.iter().chain(self.normal.iter())
    }

    /// Owned copy of [`all`](Self::all)
    pub fn snapshot(&self) -> Vec<Candidate> {
        self.all().cloned().collect()
    }

    /// Look up a candidate by path
    pub fn get(&self, path: &Path) -> Option<&Candidate> {
        self.all().find(|c| c.is(path))
    }

    fn get_mut(&mut self, path: &Path) -> Option<&mut Candidate> {
        self.priority
            .iter_mut()
            .chain(self.normal.iter_mut())
            .find(|c| c.is(path))
    }

    /// Number of candidates
    pub fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Candidate count per tier: (priority, normal)
    pub fn tier_counts(&self) -> (usize, usize) {
        (self.priority.len(), self.normal.len())
    }

    /// Increment the failure counter, returning the new count
    pub fn record_failure(&mut self, path: &Path) -> Option<u32> {
        let candidate = self.get_mut(path)?;
        candidate.consecutive_failures = candidate.consecutive_failures.saturating_add(1);
        Some(candidate.consecutive_failures)
    }

    /// Mark a successful activation
    ///
    /// Clears the failure counter, stores the latency and stamps the
    /// activation time.
    pub fn record_success(&mut self, path: &Path, latency: Latency) -> bool {
        match self.get_mut(path) {
            Some(candidate) => {
                candidate.consecutive_failures = 0;
                candidate.latency = latency;
                candidate.last_activated_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Store a latency measurement without touching failure state
    pub fn record_latency(&mut self, path: &Path, latency: Latency) -> bool {
        match self.get_mut(path) {
            Some(candidate) => {
                candidate.latency = latency;
                true
            }
            None => false,
        }
    }

    /// Zero every failure counter
    pub fn reset_all_failures(&mut self) {
        for candidate in self.priority.iter_mut().chain(self.normal.iter_mut()) {
            candidate.consecutive_failures = 0;
        }
    }
}
