//! Tunnel Process Launcher
//!
//! Starts and stops the external tunnel implementations. OpenVPN
//! configurations (`.ovpn`) run as `openvpn --daemon`; WireGuard
//! configurations (`.conf`) are brought up with `wg-quick`.
//!
//! The launcher only reports what the process did. Deadlines and the
//! decision of what counts as a failure belong to the supervisor.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Tunnel implementation, derived from the configuration extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    OpenVpn,
    WireGuard,
}

impl TunnelKind {
    /// Detect from the configuration path
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("ovpn") => Some(TunnelKind::OpenVpn),
            Some("conf") => Some(TunnelKind::WireGuard),
            _ => None,
        }
    }
}

/// What happened when a tunnel process was started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    /// Exit code (`-1` when terminated by a signal)
    pub exit_code: i32,
    /// Time the launcher command took
    pub duration: Duration,
    /// Captured standard error, trimmed
    pub stderr: String,
}

impl LaunchReport {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Starts and stops tunnel processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Terminate every managed tunnel process
    ///
    /// Must be safe to call when nothing is running.
    async fn stop(&self);

    /// Launch the tunnel for a configuration file
    async fn start(&self, config: &Path) -> Result<LaunchReport, LaunchError>;
}

/// Launcher backed by the system `openvpn` and `wg-quick` binaries
#[derive(Debug, Default)]
pub struct SystemLauncher {
    /// WireGuard config brought up last, needed for `wg-quick down`
    wireguard_up: Mutex<Option<PathBuf>>,
}

impl SystemLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn command_for(kind: TunnelKind, config: &Path) -> Command {
        let mut cmd = match kind {
            TunnelKind::OpenVpn => {
                let mut cmd = Command::new("openvpn");
                cmd.arg("--config").arg(config).arg("--daemon");
                cmd
            }
            TunnelKind::WireGuard => {
                let mut cmd = Command::new("wg-quick");
                cmd.arg("up").arg(config);
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Teardown commands for [`stop`](ProcessLauncher::stop)
    ///
    /// OpenVPN daemons are matched on the exact process name, so processes
    /// that merely mention "openvpn" in their arguments survive.
    fn teardown_commands(wireguard: Option<&Path>) -> Vec<(&'static str, Vec<OsString>)> {
        let mut commands: Vec<(&'static str, Vec<OsString>)> =
            vec![("pkill", vec!["-x".into(), "openvpn".into()])];
        if let Some(config) = wireguard {
            commands.push(("wg-quick", vec!["down".into(), config.as_os_str().to_owned()]));
        }
        commands
    }

    /// Run a teardown command, ignoring every outcome
    async fn run_quietly(program: &str, args: &[OsString]) {
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        debug!("{} {:?} -> {:?}", program, args, status.map(|s| s.code()));
    }
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn stop(&self) {
        info!("Stopping tunnel processes");

        let wireguard = self.wireguard_up.lock().await.take();
        for (program, args) in Self::teardown_commands(wireguard.as_deref()) {
            Self::run_quietly(program, &args).await;
        }
    }

    async fn start(&self, config: &Path) -> Result<LaunchReport, LaunchError> {
        let kind = TunnelKind::from_path(config)
            .ok_or_else(|| LaunchError::UnsupportedFormat(config.to_path_buf()))?;

        info!("Starting {:?} tunnel: {}", kind, config.display());

        // Recorded before spawning: a killed or failed `wg-quick up` can
        // leave the interface half configured
        if kind == TunnelKind::WireGuard {
            *self.wireguard_up.lock().await = Some(config.to_path_buf());
        }

        let start = Instant::now();

        let output = Self::command_for(kind, config)
            .output()
            .await
            .map_err(|e| LaunchError::Spawn(e.to_string()))?;

        let report = LaunchReport {
            exit_code: output.status.code().unwrap_or(-1),
            duration: start.elapsed(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };

        Ok(report)
    }
}

/// Launch failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("Unsupported config format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Failed to spawn tunnel process: {0}")]
    Spawn(String),

    #[error("Tunnel start timed out after {0:?}")]
    Timeout(Duration),

    #[error("Tunnel process exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(
            TunnelKind::from_path(Path::new("/vpn/us.ovpn")),
            Some(TunnelKind::OpenVpn)
        );
        assert_eq!(
            TunnelKind::from_path(Path::new("/etc/wireguard/wg0.conf")),
            Some(TunnelKind::WireGuard)
        );
        assert_eq!(TunnelKind::from_path(Path::new("/vpn/readme.txt")), None);
        assert_eq!(TunnelKind::from_path(Path::new("/vpn/noext")), None);
    }

    #[tokio::test]
    async fn test_unsupported_format_rejected_before_spawn() {
        let launcher = SystemLauncher::new();
        let result = launcher.start(Path::new("/vpn/server.txt")).await;

        assert_eq!(
            result,
            Err(LaunchError::UnsupportedFormat(PathBuf::from("/vpn/server.txt")))
        );
    }

    #[test]
    fn test_teardown_matches_exact_name() {
        let commands = SystemLauncher::teardown_commands(None);

        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0, "pkill");
        assert_eq!(commands[0].1, vec![OsString::from("-x"), OsString::from("openvpn")]);
    }

    #[test]
    fn test_teardown_brings_wireguard_down() {
        let commands = SystemLauncher::teardown_commands(Some(Path::new("/etc/wireguard/wg0.conf")));

        assert_eq!(commands[1].0, "wg-quick");
        assert_eq!(
            commands[1].1,
            vec![OsString::from("down"), OsString::from("/etc/wireguard/wg0.conf")]
        );
    }

    #[tokio::test]
    async fn test_wireguard_recorded_even_when_start_fails() {
        let launcher = SystemLauncher::new();
        let config = Path::new("/nonexistent/rotor-test/wg9.conf");

        // Either wg-quick is missing or it rejects the path
        let result = launcher.start(config).await;
        assert!(!matches!(result, Ok(ref report) if report.success()));

        assert_eq!(launcher.wireguard_up.lock().await.as_deref(), Some(config));
    }

    #[test]
    fn test_report_success() {
        let ok = LaunchReport {
            exit_code: 0,
            duration: Duration::from_millis(120),
            stderr: String::new(),
        };
        let killed = LaunchReport {
            exit_code: -1,
            ..ok.clone()
        };

        assert!(ok.success());
        assert!(!killed.success());
    }
}
