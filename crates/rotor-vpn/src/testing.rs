//! In-process fakes for the collaborator traits.

use crate::candidate::Latency;
use crate::launcher::{LaunchError, LaunchReport, ProcessLauncher};
use crate::probe::{LatencyProbe, ReachabilityProbe};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Latency per host; unknown hosts are unreachable
#[derive(Debug, Default)]
pub struct FakeLatency {
    hosts: Mutex<HashMap<String, f64>>,
    calls: AtomicUsize,
}

impl FakeLatency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, host: &str, ms: f64) {
        self.hosts.lock().unwrap().insert(host.to_string(), ms);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LatencyProbe for FakeLatency {
    async fn measure(&self, host: &str) -> Latency {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .map(|ms| Latency::from_millis(*ms))
            .unwrap_or(Latency::UNREACHABLE)
    }
}

/// Reachability that can be toggled
#[derive(Debug)]
pub struct FakeReachability {
    reachable: AtomicBool,
}

impl FakeReachability {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
        }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReachabilityProbe for FakeReachability {
    async fn check(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Records launcher calls; exit codes and delays are scripted per path
#[derive(Debug, Default)]
pub struct FakeLauncher {
    starts: Mutex<Vec<PathBuf>>,
    stops: AtomicUsize,
    running: AtomicBool,
    exit_codes: Mutex<HashMap<PathBuf, i32>>,
    delays: Mutex<HashMap<PathBuf, Duration>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit_with(&self, path: &str, code: i32) {
        self.exit_codes
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), code);
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(PathBuf::from(path), delay);
    }

    pub fn starts(&self) -> Vec<PathBuf> {
        self.starts.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Did the last successful start happen after the last stop?
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    async fn start(&self, config: &Path) -> Result<LaunchReport, LaunchError> {
        self.starts.lock().unwrap().push(config.to_path_buf());

        let delay = self.delays.lock().unwrap().get(config).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let exit_code = self
            .exit_codes
            .lock()
            .unwrap()
            .get(config)
            .copied()
            .unwrap_or(0);
        if exit_code == 0 {
            self.running.store(true, Ordering::SeqCst);
        }

        Ok(LaunchReport {
            exit_code,
            duration: delay.unwrap_or_default(),
            stderr: String::new(),
        })
    }
}
