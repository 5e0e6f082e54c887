//! Tunnel Supervisor
//!
//! Owns the active tunnel and drives each rotation attempt through:
//!
//! ```text
//! Idle -> Stopping -> Starting -> Verifying -> Committed
//!                        |            |
//!                        +------------+------> Failed -> (backoff, next attempt)
//! ```
//!
//! A rotation retries whole attempts (select, stop, start, verify) until
//! one commits, the registry turns out to be empty, or the attempt
//! budget runs out.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut supervisor = TunnelSupervisor::new(registry, policy, prober, launcher, stats);
//! supervisor.test_all().await;
//! match supervisor.rotate().await {
//!     Ok(RotationOutcome::Committed(candidate)) => println!("Using {}", candidate.name()),
//!     Ok(RotationOutcome::NoCandidates) => println!("Nothing to rotate to"),
//!     Err(e) => eprintln!("{}", e),
//! }
//! ```

use crate::candidate::{Candidate, Latency};
use crate::config::RotationPolicy;
use crate::launcher::{LaunchError, ProcessLauncher};
use crate::probe::{HealthProber, ProbeReport};
use crate::registry::CandidateRegistry;
use crate::selector::Selector;
use crate::stats::StatsSink;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Phase of the current (or last) rotation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    Idle,
    Stopping,
    Starting,
    Verifying,
    Committed,
    Failed,
}

/// Successful result of [`TunnelSupervisor::rotate`]
#[derive(Debug, Clone, PartialEq)]
pub enum RotationOutcome {
    /// A tunnel is up and verified
    Committed(Candidate),
    /// The registry is empty
    NoCandidates,
}

/// Tunnel came up but is not fit for use
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerificationError {
    #[error("Latency {latency} is not below {threshold_ms}ms")]
    LatencyTooHigh { latency: Latency, threshold_ms: f64 },

    #[error("Reachability check failed (latency {latency})")]
    Unreachable { latency: Latency },
}

/// Why a single attempt failed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttemptError {
    #[error("Launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("Verification failed: {0}")]
    Verification(#[from] VerificationError),
}

/// Rotation errors surfaced to the caller
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RotationError {
    #[error("Rotation gave up after {attempts} failed attempts (last: {last})")]
    Exhausted { attempts: u32, last: AttemptError },
}

/// State owned by the supervisor
#[derive(Debug, Clone, Default)]
pub struct SupervisorState {
    /// Every known candidate and its health
    pub registry: CandidateRegistry,
    /// Committed tunnel, if any
    current: Option<Candidate>,
}

impl SupervisorState {
    pub fn new(registry: CandidateRegistry) -> Self {
        Self {
            registry,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&Candidate> {
        self.current.as_ref()
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|c| c.path.as_path())
    }
}

/// Serializes stop/start/verify against the external tunnel
pub struct TunnelSupervisor {
    state: SupervisorState,
    selector: Selector,
    policy: RotationPolicy,
    prober: HealthProber,
    launcher: Arc<dyn ProcessLauncher>,
    stats: Arc<dyn StatsSink>,
    phase: RotationPhase,
    current_tx: watch::Sender<Option<Candidate>>,
}

impl TunnelSupervisor {
    pub fn new(
        registry: CandidateRegistry,
        policy: RotationPolicy,
        prober: HealthProber,
        launcher: Arc<dyn ProcessLauncher>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        let (current_tx, _) = watch::channel(None);
        Self {
            state: SupervisorState::new(registry),
            selector: Selector::new(policy.max_failures),
            policy,
            prober,
            launcher,
            stats,
            phase: RotationPhase::Idle,
            current_tx,
        }
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    pub fn registry(&self) -> &CandidateRegistry {
        &self.state.registry
    }

    pub fn registry_mut(&mut self) -> &mut CandidateRegistry {
        &mut self.state.registry
    }

    pub fn current(&self) -> Option<&Candidate> {
        self.state.current()
    }

    pub fn phase(&self) -> RotationPhase {
        self.phase
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    pub fn prober(&self) -> &HealthProber {
        &self.prober
    }

    pub fn stats(&self) -> &Arc<dyn StatsSink> {
        &self.stats
    }

    /// Watch the committed tunnel (`None` while down or rotating)
    pub fn subscribe(&self) -> watch::Receiver<Option<Candidate>> {
        self.current_tx.subscribe()
    }

    fn set_phase(&mut self, phase: RotationPhase) {
        debug!("Rotation phase: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn set_current(&mut self, current: Option<Candidate>) {
        self.state.current = current.clone();
        self.current_tx.send_replace(current);
    }

    /// Probe every candidate and record latencies
    pub async fn test_all(&mut self) -> Vec<ProbeReport> {
        self.prober.test_all(&mut self.state.registry).await
    }

    /// Run the selector against the current state without rotating
    pub fn select_next(&mut self) -> Option<Candidate> {
        let current = self.state.current.as_ref().map(|c| c.path.clone());
        self.selector
            .select_best(&mut self.state.registry, current.as_deref())
    }

    /// Replace the active tunnel with the best alternative
    ///
    /// Failed attempts are retried after the backoff, each time
    /// reselecting. Gives up with [`RotationError::Exhausted`] after
    /// `max_rotation_attempts`.
    pub async fn rotate(&mut self) -> Result<RotationOutcome, RotationError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let Some(next) = self.select_next() else {
                warn!("No candidates available, nothing to rotate to");
                self.set_phase(RotationPhase::Idle);
                return Ok(RotationOutcome::NoCandidates);
            };

            info!(
                "Rotation attempt {}/{}: {} (priority {}, {})",
                attempt,
                self.policy.max_rotation_attempts,
                next.name(),
                next.priority,
                next.latency
            );

            match self.attempt(&next).await {
                Ok(committed) => return Ok(RotationOutcome::Committed(committed)),
                Err(e) if attempt >= self.policy.max_rotation_attempts => {
                    error!("Rotation exhausted after {} attempts: {}", attempt, e);
                    return Err(RotationError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    warn!(
                        "{} failed: {}; retrying in {:?}",
                        next.name(),
                        e,
                        self.policy.retry_backoff()
                    );
                    tokio::time::sleep(self.policy.retry_backoff()).await;
                }
            }
        }
    }

    /// One stop/start/verify pass for a chosen candidate
    ///
    /// On failure the candidate's failure counter is incremented, the
    /// launched tunnel is rolled back and no tunnel is current.
    pub async fn attempt(&mut self, candidate: &Candidate) -> Result<Candidate, AttemptError> {
        self.set_phase(RotationPhase::Stopping);
        self.stop_current().await;
        tokio::time::sleep(self.policy.stop_settle()).await;

        self.set_phase(RotationPhase::Starting);
        if let Err(e) = self.launch(candidate).await {
            return Err(self.fail(candidate, e.into()).await);
        }

        self.set_phase(RotationPhase::Verifying);
        tokio::time::sleep(self.policy.start_settle()).await;

        let report = self.prober.check(candidate).await;
        self.state
            .registry
            .record_latency(&candidate.path, report.latency);

        if !report.latency_ok {
            let e = VerificationError::LatencyTooHigh {
                latency: report.latency,
                threshold_ms: self.prober.threshold_ms(),
            };
            return Err(self.fail(candidate, e.into()).await);
        }
        if !report.reachable {
            let e = VerificationError::Unreachable {
                latency: report.latency,
            };
            return Err(self.fail(candidate, e.into()).await);
        }

        Ok(self.commit(candidate, report.latency))
    }

    async fn launch(&self, candidate: &Candidate) -> Result<(), LaunchError> {
        let timeout = self.policy.start_timeout();
        let report = tokio::time::timeout(timeout, self.launcher.start(&candidate.path))
            .await
            .map_err(|_| LaunchError::Timeout(timeout))??;

        if !report.success() {
            return Err(LaunchError::NonZeroExit {
                code: report.exit_code,
                stderr: report.stderr,
            });
        }
        debug!("{} launched in {:?}", candidate.name(), report.duration);
        Ok(())
    }

    /// Count the failure and tear down whatever the attempt brought up
    ///
    /// A timed-out or failed start may leave a half-configured tunnel
    /// behind, so the rollback runs for launch errors too.
    async fn fail(&mut self, candidate: &Candidate, error: AttemptError) -> AttemptError {
        let failures = self
            .state
            .registry
            .record_failure(&candidate.path)
            .unwrap_or_default();
        warn!(
            "{} failed ({} consecutive): {}",
            candidate.name(),
            failures,
            error
        );
        self.launcher.stop().await;
        self.set_phase(RotationPhase::Failed);
        error
    }

    fn commit(&mut self, candidate: &Candidate, latency: Latency) -> Candidate {
        self.state.registry.record_success(&candidate.path, latency);
        let committed = self
            .state
            .registry
            .get(&candidate.path)
            .cloned()
            .unwrap_or_else(|| candidate.clone());

        if let Err(e) = self.stats.record_use(&candidate.path, latency) {
            warn!("Failed to record usage for {}: {}", candidate.name(), e);
        }

        info!("Connected to {} - latency {}", committed.name(), latency);
        self.set_current(Some(committed.clone()));
        self.set_phase(RotationPhase::Committed);
        committed
    }

    /// Stop every tunnel process and forget the current one
    pub async fn stop_current(&mut self) {
        if let Some(current) = self.state.current() {
            info!("Stopping current tunnel {}", current.name());
        }
        self.launcher.stop().await;
        self.set_current(None);
    }

    /// Tear down on exit
    pub async fn shutdown(&mut self) {
        info!("Shutting down tunnel supervisor");
        self.stop_current().await;
        self.set_phase(RotationPhase::Idle);
    }
}
