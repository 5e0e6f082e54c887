//! Rotor VPN - Tunnel Rotation Engine
//!
//! Keeps a host connected through the best available VPN tunnel out of
//! a list of OpenVPN and WireGuard configurations, rotating on a timer
//! and whenever the active tunnel degrades.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Scheduler                            │
//! │                                                               │
//! │  ┌───────────┐   ┌────────────────┐   ┌───────────────────┐  │
//! │  │   Timer   │──▶│ trigger queue  │◀──│  Health monitor   │  │
//! │  └───────────┘   │  (1 pending)   │   └─────────▲─────────┘  │
//! │                  └───────┬────────┘             │ watch      │
//! │                          ▼                      │            │
//! │              ┌────────────────────────┐         │            │
//! │              │   Tunnel supervisor    │─────────┘            │
//! │              │ select → stop → start  │                      │
//! │              │   → verify → commit    │                      │
//! │              └──┬─────────┬────────┬──┘                      │
//! └─────────────────│─────────│────────│─────────────────────────┘
//!                   ▼         ▼        ▼
//!             Registry   Launcher   Prober
//!             Selector  (openvpn,  (ping/tcp,
//!                       wg-quick)   http)
//! ```
//!
//! # Features
//!
//! - **Two-tier candidates**: `#PRIORITY:N` entries rank before the rest
//! - **Failure tracking**: candidates sit out after repeated failures,
//!   and the whole registry is forgiven once everyone has failed
//! - **Verified commits**: a tunnel only becomes current after passing
//!   the latency and reachability checks
//! - **Single rotation at a time**: concurrent requests coalesce

mod candidate;
mod config;
mod launcher;
mod probe;
mod registry;
mod scheduler;
mod selector;
mod source;
mod stats;
mod supervisor;

#[cfg(test)]
mod testing;

pub use candidate::{
    Candidate, CandidateError, CandidateSpec, Latency, Tier, DEFAULT_PRIORITY, UNREACHABLE_MS,
};
pub use config::{expand_home, ConfigError, ProbeConfig, ProbeKind, RotationPolicy, RotorConfig};
pub use launcher::{LaunchError, LaunchReport, ProcessLauncher, SystemLauncher, TunnelKind};
pub use probe::{
    parse_ping_time, HealthProber, HealthReport, HttpReachability, LatencyProbe, PingProbe,
    ProbeError, ProbeReport, ReachabilityProbe, TcpConnectProbe,
};
pub use registry::CandidateRegistry;
pub use scheduler::{RotationHandle, RotationTrigger, Scheduler};
pub use selector::Selector;
pub use source::{
    extract_host, parse_list, parse_openvpn_remote, parse_wireguard_endpoint, ConfigSource,
    ListFileSource, SourceError,
};
pub use stats::{JsonStatsStore, MemoryStats, StatsError, StatsSink, UsageRecord, UsageReport};
pub use supervisor::{
    AttemptError, RotationError, RotationOutcome, RotationPhase, SupervisorState,
    TunnelSupervisor, VerificationError,
};
