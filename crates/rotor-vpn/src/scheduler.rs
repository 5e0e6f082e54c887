//! Rotation Scheduler
//!
//! Drives the supervisor from three sources:
//!
//! - a periodic timer (scheduled rotation)
//! - a health monitor checking the committed tunnel
//! - manual requests through a [`RotationHandle`]
//!
//! All of them feed one bounded queue with room for a single pending
//! request. A single executor drains it, so at most one rotation runs at
//! a time and requests arriving while one is already queued are
//! coalesced into it.
//!
//! On cancellation the producers stop, an in-flight rotation finishes,
//! and the active tunnel is torn down.

use crate::candidate::{Candidate, Latency};
use crate::probe::HealthProber;
use crate::supervisor::{RotationOutcome, TunnelSupervisor};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shortest accepted timer period
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Why a rotation was requested
#[derive(Debug, Clone, PartialEq)]
pub enum RotationTrigger {
    Startup,
    Scheduled,
    /// The committed tunnel failed its health check
    HealthCheckFailed { path: PathBuf, latency: Latency },
    Manual,
}

impl fmt::Display for RotationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationTrigger::Startup => write!(f, "startup"),
            RotationTrigger::Scheduled => write!(f, "scheduled"),
            RotationTrigger::HealthCheckFailed { path, latency } => {
                write!(f, "health check failed ({}, {})", path.display(), latency)
            }
            RotationTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// Queue a trigger unless one is already pending
fn submit(tx: &mpsc::Sender<RotationTrigger>, trigger: RotationTrigger) -> bool {
    match tx.try_send(trigger) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(trigger)) => {
            debug!("Rotation already pending, {} request coalesced", trigger);
            false
        }
        Err(mpsc::error::TrySendError::Closed(trigger)) => {
            debug!("Scheduler stopped, {} request dropped", trigger);
            false
        }
    }
}

/// Requests rotations from outside the scheduler
#[derive(Debug, Clone)]
pub struct RotationHandle {
    tx: mpsc::Sender<RotationTrigger>,
}

impl RotationHandle {
    /// Ask for a rotation; `false` if it was coalesced or the scheduler is gone
    pub fn request(&self) -> bool {
        submit(&self.tx, RotationTrigger::Manual)
    }
}

/// Owns the supervisor while running
pub struct Scheduler {
    supervisor: TunnelSupervisor,
    rotation_interval: Duration,
    health_interval: Duration,
    shutdown: CancellationToken,
    tx: mpsc::Sender<RotationTrigger>,
    rx: mpsc::Receiver<RotationTrigger>,
}

impl Scheduler {
    pub fn new(
        supervisor: TunnelSupervisor,
        rotation_interval: Duration,
        health_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            supervisor,
            rotation_interval: rotation_interval.max(MIN_INTERVAL),
            health_interval: health_interval.max(MIN_INTERVAL),
            shutdown,
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> RotationHandle {
        RotationHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run until the shutdown token is cancelled
    ///
    /// Probes every candidate, performs the startup rotation, then serves
    /// triggers. Returns the supervisor after the tunnel is stopped.
    pub async fn run(self) -> TunnelSupervisor {
        let Scheduler {
            mut supervisor,
            rotation_interval,
            health_interval,
            shutdown,
            tx,
            mut rx,
        } = self;

        info!(
            "Scheduler started: rotation every {:?}, health check every {:?}",
            rotation_interval, health_interval
        );

        let timer = tokio::spawn(rotation_timer(
            tx.clone(),
            rotation_interval,
            shutdown.clone(),
        ));
        let monitor = tokio::spawn(health_monitor(
            supervisor.subscribe(),
            supervisor.prober().clone(),
            tx,
            health_interval,
            shutdown.clone(),
        ));

        let reports = supervisor.test_all().await;
        let usable = reports.iter().filter(|r| r.usable).count();
        info!("{} of {} candidates usable", usable, reports.len());

        execute(&mut supervisor, RotationTrigger::Startup).await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                trigger = rx.recv() => match trigger {
                    Some(trigger) => execute(&mut supervisor, trigger).await,
                    None => break,
                },
            }
        }

        info!("Scheduler stopping");
        rx.close();
        if let Err(e) = timer.await {
            warn!("Rotation timer task failed: {}", e);
        }
        if let Err(e) = monitor.await {
            warn!("Health monitor task failed: {}", e);
        }

        supervisor.shutdown().await;
        supervisor
    }
}

/// Perform one requested rotation
async fn execute(supervisor: &mut TunnelSupervisor, trigger: RotationTrigger) {
    if let RotationTrigger::HealthCheckFailed { path, latency } = &trigger {
        if supervisor.state().current_path() != Some(path.as_path()) {
            debug!("Stale health failure for {}, ignored", path.display());
            return;
        }
        supervisor.registry_mut().record_latency(path, *latency);
    }

    info!("Rotation triggered: {}", trigger);
    match supervisor.rotate().await {
        Ok(RotationOutcome::Committed(candidate)) => {
            info!("Rotation complete: {}", candidate.name());
        }
        Ok(RotationOutcome::NoCandidates) => {
            warn!("Rotation skipped: no candidates");
        }
        Err(e) => {
            error!("{}", e);
        }
    }
}

async fn rotation_timer(
    tx: mpsc::Sender<RotationTrigger>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if tx.is_closed() {
                    break;
                }
                submit(&tx, RotationTrigger::Scheduled);
            }
        }
    }
    debug!("Rotation timer stopped");
}

async fn health_monitor(
    current: watch::Receiver<Option<Candidate>>,
    prober: HealthProber,
    tx: mpsc::Sender<RotationTrigger>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Nothing committed, or a rotation is in progress
        let Some(candidate) = current.borrow().clone() else {
            continue;
        };

        let report = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            report = prober.check(&candidate) => report,
        };

        if report.is_usable() {
            debug!("{} healthy ({})", candidate.name(), report.latency);
            continue;
        }

        warn!(
            "Health check failed for {}: {} (reachable: {})",
            candidate.name(),
            report.latency,
            report.reachable
        );
        submit(
            &tx,
            RotationTrigger::HealthCheckFailed {
                path: candidate.path.clone(),
                latency: report.latency,
            },
        );
    }
    debug!("Health monitor stopped");
}
