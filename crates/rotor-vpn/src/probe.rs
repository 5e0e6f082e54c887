//! Health Probes
//!
//! Latency and reachability checks used to rank candidates and to
//! verify a freshly started tunnel.
//!
//! Probe failures never surface as errors: DNS failures, timeouts and
//! missing hosts all collapse into [`Latency::UNREACHABLE`], which ranks
//! a candidate last instead of aborting a rotation.

use crate::candidate::{Candidate, Latency};
use crate::config::{ProbeConfig, ProbeKind};
use crate::registry::CandidateRegistry;
use async_trait::async_trait;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

/// Measures round-trip latency to a host
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Latency to `host`, or [`Latency::UNREACHABLE`] on any failure
    async fn measure(&self, host: &str) -> Latency;
}

/// Checks that traffic reaches a well-known endpoint
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// ICMP echo through the system `ping` binary
#[derive(Debug, Clone)]
pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Arguments for a single echo, with the host after `--`
    fn args(&self, host: &str) -> Vec<String> {
        let wait_secs = self.timeout.as_secs().max(1).to_string();
        vec![
            "-c".to_string(),
            "1".to_string(),
            "-W".to_string(),
            wait_secs,
            "--".to_string(),
            host.to_string(),
        ]
    }
}

#[async_trait]
impl LatencyProbe for PingProbe {
    async fn measure(&self, host: &str) -> Latency {
        let mut cmd = Command::new("ping");
        cmd.args(self.args(host))
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // Allow the process a little longer than its own -W deadline
        let deadline = self.timeout + Duration::from_millis(500);
        let output = match tokio::time::timeout(deadline, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Failed to run ping for {}: {}", host, e);
                return Latency::UNREACHABLE;
            }
            Err(_) => {
                debug!("Ping to {} timed out", host);
                return Latency::UNREACHABLE;
            }
        };

        if !output.status.success() {
            debug!("Ping to {} failed ({})", host, output.status);
            return Latency::UNREACHABLE;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ping_time(&stdout)
            .map(Latency::from_millis)
            .unwrap_or(Latency::UNREACHABLE)
    }
}

/// Extract the round-trip time from `ping` output
///
/// Handles `time=12.3 ms`, `time=12.3ms` and `time<1 ms`.
pub fn parse_ping_time(output: &str) -> Option<f64> {
    let start = output
        .find("time=")
        .or_else(|| output.find("time<"))
        .map(|i| i + 5)?;
    let value: String = output[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    value.parse().ok()
}

/// Times a TCP connect to `host:port`
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    port: u16,
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl LatencyProbe for TcpConnectProbe {
    async fn measure(&self, host: &str) -> Latency {
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, self.port))).await {
            Ok(Ok(_stream)) => Latency::from_duration(start.elapsed()),
            Ok(Err(e)) => {
                debug!("TCP probe to {}:{} failed: {}", host, self.port, e);
                Latency::UNREACHABLE
            }
            Err(_) => {
                debug!("TCP probe to {}:{} timed out", host, self.port);
                Latency::UNREACHABLE
            }
        }
    }
}

/// Plain HTTP/1.1 GET against a well-known endpoint
///
/// Any response, whatever the status, counts as reachable.
#[derive(Debug, Clone)]
pub struct HttpReachability {
    uri: Uri,
    timeout: Duration,
}

impl HttpReachability {
    /// Create a probe for an `http://` URL
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let uri: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ProbeError::InvalidUrl(e.to_string()))?;

        match uri.scheme_str() {
            Some("http") => {}
            other => {
                return Err(ProbeError::InvalidUrl(format!(
                    "unsupported scheme {:?} (only http)",
                    other
                )));
            }
        }
        if uri.host().is_none() {
            return Err(ProbeError::InvalidUrl("No host in URL".to_string()));
        }

        Ok(Self { uri, timeout })
    }

    async fn request(&self) -> Result<u16, ProbeError> {
        let host = self.uri.host().unwrap_or_default();
        let port = self.uri.port_u16().unwrap_or(80);
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ProbeError::Connection(e.to_string()))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProbeError::Http(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Reachability connection error: {}", e);
            }
        });

        let path = self.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, host)
            .header(USER_AGENT, "rotor/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProbeError::Http(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ProbeError::Http(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

#[async_trait]
impl ReachabilityProbe for HttpReachability {
    async fn check(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.request()).await {
            Ok(Ok(status)) => {
                debug!("Reachability {} -> {}", self.uri, status);
                true
            }
            Ok(Err(e)) => {
                debug!("Reachability check failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Reachability check timed out");
                false
            }
        }
    }
}

/// Result of checking one tunnel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthReport {
    pub latency: Latency,
    pub latency_ok: bool,
    pub reachable: bool,
}

impl HealthReport {
    /// Usable latency and reachable endpoint
    pub fn is_usable(&self) -> bool {
        self.latency_ok && self.reachable
    }
}

/// Per-candidate line of a test-all run
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub path: PathBuf,
    pub name: String,
    pub latency: Latency,
    pub usable: bool,
}

/// Combines latency and reachability probes with the usability threshold
#[derive(Clone)]
pub struct HealthProber {
    latency: Arc<dyn LatencyProbe>,
    reachability: Arc<dyn ReachabilityProbe>,
    usable_latency_ms: f64,
}

impl HealthProber {
    pub fn new(
        latency: Arc<dyn LatencyProbe>,
        reachability: Arc<dyn ReachabilityProbe>,
        usable_latency_ms: f64,
    ) -> Self {
        Self {
            latency,
            reachability,
            usable_latency_ms,
        }
    }

    /// Build the system probes described by the configuration
    pub fn from_config(config: &ProbeConfig, usable_latency_ms: f64) -> Result<Self, ProbeError> {
        let latency: Arc<dyn LatencyProbe> = match config.kind {
            ProbeKind::Ping => Arc::new(PingProbe::new(config.timeout())),
            ProbeKind::Tcp => Arc::new(TcpConnectProbe::new(config.tcp_port, config.timeout())),
        };
        let reachability = Arc::new(HttpReachability::new(
            &config.reachability_url,
            config.reachability_timeout(),
        )?);
        Ok(Self::new(latency, reachability, usable_latency_ms))
    }

    /// Latency a tunnel must stay below (ms)
    pub fn threshold_ms(&self) -> f64 {
        self.usable_latency_ms
    }

    /// Is this latency good enough to keep a tunnel?
    pub fn is_usable(&self, latency: Latency) -> bool {
        latency.as_millis() < self.usable_latency_ms
    }

    /// Measure a candidate's endpoint
    pub async fn measure(&self, candidate: &Candidate) -> Latency {
        match candidate.host.as_deref() {
            Some(host) => self.latency.measure(host).await,
            None => {
                debug!("{} has no endpoint host", candidate.name());
                Latency::UNREACHABLE
            }
        }
    }

    /// Measure a candidate and store the result in the registry
    pub async fn measure_into(
        &self,
        registry: &mut CandidateRegistry,
        candidate: &Candidate,
    ) -> Latency {
        let latency = self.measure(candidate).await;
        registry.record_latency(&candidate.path, latency);
        latency
    }

    /// Full usability check: latency threshold and reachability
    pub async fn check(&self, candidate: &Candidate) -> HealthReport {
        let (latency, reachable) =
            tokio::join!(self.measure(candidate), self.reachability.check());
        HealthReport {
            latency,
            latency_ok: self.is_usable(latency),
            reachable,
        }
    }

    /// Probe every candidate, recording latencies
    ///
    /// Returned sorted by latency, fastest first.
    pub async fn test_all(&self, registry: &mut CandidateRegistry) -> Vec<ProbeReport> {
        let mut reports = Vec::with_capacity(registry.len());

        for candidate in registry.snapshot() {
            let latency = self.measure_into(registry, &candidate).await;
            debug!("{}: {}", candidate.name(), latency);
            reports.push(ProbeReport {
                name: candidate.name(),
                path: candidate.path,
                latency,
                usable: self.is_usable(latency),
            });
        }

        reports.sort_by(|a, b| a.latency.total_cmp(&b.latency));
        reports
    }
}

/// Probe construction and transport errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateSpec;
    use crate::testing::{FakeLatency, FakeReachability};

    fn prober(latency: Arc<FakeLatency>, reachable: bool) -> HealthProber {
        HealthProber::new(latency, Arc::new(FakeReachability::new(reachable)), 500.0)
    }

    fn candidate(name: &str, host: Option<&str>) -> Candidate {
        let mut spec = CandidateSpec::normal(format!("/vpn/{name}"));
        spec.host = host.map(str::to_string);
        Candidate::new(spec).unwrap()
    }

    #[test]
    fn test_parse_ping_time() {
        let linux = "64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=12.4 ms";
        let busybox = "64 bytes from 1.1.1.1: seq=0 ttl=57 time=8.123ms";
        let local = "64 bytes from 127.0.0.1: icmp_seq=1 ttl=64 time<1 ms";

        assert_eq!(parse_ping_time(linux), Some(12.4));
        assert_eq!(parse_ping_time(busybox), Some(8.123));
        assert_eq!(parse_ping_time(local), Some(1.0));
        assert_eq!(parse_ping_time("Request timeout for icmp_seq 0"), None);
    }

    #[test]
    fn test_ping_host_after_separator() {
        let ping = PingProbe::new(Duration::from_millis(2500));
        let args = ping.args("-oProxyCommand=x");

        assert_eq!(args, vec!["-c", "1", "-W", "2", "--", "-oProxyCommand=x"]);
    }

    #[test]
    fn test_reachability_url_validation() {
        let timeout = Duration::from_secs(3);
        assert!(HttpReachability::new("http://1.1.1.1", timeout).is_ok());
        assert!(HttpReachability::new("https://1.1.1.1", timeout).is_err());
        assert!(HttpReachability::new("not a url", timeout).is_err());
    }

    #[test]
    fn test_usability_threshold() {
        let prober = prober(Arc::new(FakeLatency::new()), true);

        assert!(prober.is_usable(Latency::from_millis(499.99)));
        assert!(!prober.is_usable(Latency::from_millis(500.0)));
        assert!(!prober.is_usable(Latency::UNREACHABLE));
    }

    #[tokio::test]
    async fn test_missing_host_is_unreachable() {
        let fake = Arc::new(FakeLatency::new());
        let prober = prober(fake.clone(), true);
        let latency = prober.measure(&candidate("a.ovpn", None)).await;
        assert_eq!(latency, Latency::UNREACHABLE);
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test]
    async fn test_check_requires_both() {
        let latency = Arc::new(FakeLatency::new());
        latency.set("fast.example", 40.0);
        latency.set("slow.example", 600.0);

        let reachable = prober(latency.clone(), true);
        let fast = reachable.check(&candidate("fast.ovpn", Some("fast.example"))).await;
        let slow = reachable.check(&candidate("slow.ovpn", Some("slow.example"))).await;
        assert!(fast.is_usable());
        assert!(!slow.is_usable());
        assert!(slow.reachable);

        let offline = prober(latency, false);
        let report = offline.check(&candidate("fast.ovpn", Some("fast.example"))).await;
        assert!(report.latency_ok);
        assert!(!report.is_usable());
    }

    #[tokio::test]
    async fn test_test_all_records_and_sorts() {
        let latency = Arc::new(FakeLatency::new());
        latency.set("b.example", 20.0);
        latency.set("c.example", 700.0);

        let mut registry = crate::registry::CandidateRegistry::from_specs(vec![
            CandidateSpec::normal("/vpn/a.ovpn").with_host("a.example"),
            CandidateSpec::normal("/vpn/b.ovpn").with_host("b.example"),
            CandidateSpec::normal("/vpn/c.ovpn").with_host("c.example"),
        ]);

        let reports = prober(latency, true).test_all(&mut registry).await;
        let names: Vec<_> = reports.iter().map(|r| r.name.as_str()).collect();

        assert_eq!(names, vec!["b.ovpn", "c.ovpn", "a.ovpn"]);
        assert!(reports[0].usable);
        assert!(!reports[1].usable);
        assert_eq!(
            registry.get(std::path::Path::new("/vpn/b.ovpn")).unwrap().latency,
            Latency::from_millis(20.0)
        );
    }
}
