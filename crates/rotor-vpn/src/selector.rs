//! Candidate Selection
//!
//! Greedy ranking of the registry:
//!
//! 1. Priority tier followed by normal tier
//! 2. Drop candidates at or above the failure threshold
//! 3. If nothing is left, reset every failure counter and use everyone
//! 4. Stable sort: priority descending, then latency ascending
//! 5. Skip the top entry if it is the tunnel already running and there
//!    is an alternative

use crate::candidate::Candidate;
use crate::registry::CandidateRegistry;
use std::path::Path;
use tracing::{debug, warn};

/// Selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selector {
    max_failures: u32,
}

impl Selector {
    /// Create a selector with the given failure threshold
    pub fn new(max_failures: u32) -> Self {
        Self { max_failures }
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Is this candidate still eligible?
    pub fn is_eligible(&self, candidate: &Candidate) -> bool {
        candidate.consecutive_failures < self.max_failures
    }

    /// Pick the next candidate to activate
    ///
    /// Returns `None` only when the registry is empty. When every
    /// candidate is over the threshold, all failure counters are reset
    /// first.
    pub fn select_best(
        &self,
        registry: &mut CandidateRegistry,
        current: Option<&Path>,
    ) -> Option<Candidate> {
        if registry.is_empty() {
            return None;
        }

        if !registry.all().any(|c| self.is_eligible(c)) {
            warn!(
                "All {} candidates reached {} failures, resetting counters",
                registry.len(),
                self.max_failures
            );
            registry.reset_all_failures();
        }

        let ranked = self.rank(registry);
        let top = ranked.first()?;

        let chosen = match (current, ranked.get(1)) {
            (Some(current), Some(second)) if top.is(current) => {
                debug!("Skipping {} (already active)", top.name());
                *second
            }
            _ => *top,
        };

        Some(chosen.clone())
    }

    /// Eligible candidates in ranking order, without side effects
    pub fn rank<'a>(&self, registry: &'a CandidateRegistry) -> Vec<&'a Candidate> {
        let mut working: Vec<&Candidate> =
            registry.all().filter(|c| self.is_eligible(c)).collect();

        // slice::sort_by is stable; ties keep registry order
        working.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.latency.total_cmp(&b.latency))
        });
        working
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new(3)
    }
}
