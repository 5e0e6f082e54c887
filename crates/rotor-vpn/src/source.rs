//! Candidate Source
//!
//! Reads the operator's candidate list: one configuration path per line,
//! optionally annotated with `#PRIORITY:N` to place it in the priority
//! tier.
//!
//! ```text
//! # comment
//! /home/me/vpn-advanced/configs/servidor-usa.ovpn
//! /etc/wireguard/fast.conf #PRIORITY:8
//! ```
//!
//! The endpoint host of each configuration is extracted for latency
//! probes: the `remote` line of OpenVPN files, the `Endpoint` line of
//! WireGuard files.

use crate::candidate::{CandidateSpec, Tier};
use crate::config::expand_home;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Inline annotation marking a priority-tier entry
const PRIORITY_MARKER: &str = "#PRIORITY:";

/// Placeholder configurations written when no list exists
const SAMPLE_CONFIGS: &[&str] = &[
    "configs/servidor-usa.ovpn",
    "configs/servidor-europa.ovpn",
    "configs/servidor-asia.ovpn",
];

/// Supplies the candidate set at startup
pub trait ConfigSource {
    fn load(&self) -> Result<Vec<CandidateSpec>, SourceError>;
}

/// Candidate list stored in a text file
#[derive(Debug, Clone)]
pub struct ListFileSource {
    /// Base directory for relative entries and samples
    base_dir: PathBuf,
    /// The list file itself
    list_file: PathBuf,
}

impl ListFileSource {
    pub fn new(base_dir: impl Into<PathBuf>, list_file: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            list_file: list_file.into(),
        }
    }

    pub fn list_file(&self) -> &Path {
        &self.list_file
    }

    /// Write placeholder configurations and a list naming them
    pub fn create_samples(&self) -> Result<Vec<PathBuf>, SourceError> {
        let samples: Vec<PathBuf> = SAMPLE_CONFIGS
            .iter()
            .map(|rel| self.base_dir.join(rel))
            .collect();

        for sample in &samples {
            if let Some(parent) = sample.parent() {
                std::fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;
            }
            std::fs::write(
                sample,
                "# Sample VPN configuration\n# Replace with your real configuration\n",
            )
            .map_err(|e| SourceError::io(sample, e))?;
        }

        if let Some(parent) = self.list_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;
        }
        let list: String = samples
            .iter()
            .map(|p| format!("{}\n", p.display()))
            .collect();
        std::fs::write(&self.list_file, list).map_err(|e| SourceError::io(&self.list_file, e))?;

        info!(
            "Created {} sample configurations in {}",
            samples.len(),
            self.base_dir.display()
        );
        Ok(samples)
    }

    fn resolve(&self, entry: &Path) -> PathBuf {
        let path = expand_home(entry);
        if path.is_absolute() {
            path
        } else {
            self.base_dir.join(path)
        }
    }
}

impl ConfigSource for ListFileSource {
    fn load(&self) -> Result<Vec<CandidateSpec>, SourceError> {
        if !self.list_file.exists() {
            warn!("{} does not exist", self.list_file.display());
            self.create_samples()?;
        }

        let content = std::fs::read_to_string(&self.list_file)
            .map_err(|e| SourceError::io(&self.list_file, e))?;

        let specs: Vec<CandidateSpec> = parse_list(&content)
            .into_iter()
            .map(|mut spec| {
                spec.path = self.resolve(&spec.path);
                spec.host = extract_host(&spec.path);
                spec
            })
            .collect();

        let priority = specs.iter().filter(|s| s.tier == Tier::Priority).count();
        info!("Loaded {} normal configurations", specs.len() - priority);
        info!("Loaded {} priority configurations", priority);
        Ok(specs)
    }
}

/// Parse list file content into specs (paths as written, no hosts)
///
/// Blank lines and `#` comments are skipped. A malformed priority
/// annotation skips the line with a warning.
pub fn parse_list(content: &str) -> Vec<CandidateSpec> {
    let mut specs = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match line.split_once(PRIORITY_MARKER) {
            Some((path, annotation)) => {
                let path = path.trim();
                let value = annotation.split_whitespace().next().unwrap_or("");
                match value.parse::<u8>() {
                    Ok(priority) if !path.is_empty() => {
                        specs.push(CandidateSpec::prioritized(path, priority));
                    }
                    _ => warn!(
                        "Line {}: invalid priority annotation {:?}, skipped",
                        index + 1,
                        line
                    ),
                }
            }
            None => specs.push(CandidateSpec::normal(line)),
        }
    }

    specs
}

/// Endpoint host of a configuration file, if it can be determined
pub fn extract_host(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("ovpn") => parse_openvpn_remote(&content),
        Some("conf") => parse_wireguard_endpoint(&content),
        _ => None,
    }
}

/// Host from the first `remote <host> [port]` line
pub fn parse_openvpn_remote(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("remote "))
        .and_then(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
}

/// Host from `Endpoint = host:port`
///
/// Bracketed IPv6 endpoints (`[2001:db8::1]:51820`) are unwrapped.
pub fn parse_wireguard_endpoint(content: &str) -> Option<String> {
    let value = content.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "Endpoint").then(|| value.trim())
    })?;

    let host = if let Some(rest) = value.strip_prefix('[') {
        rest.split(']').next()?
    } else {
        match value.rsplit_once(':') {
            Some((host, _port)) => host,
            None => value,
        }
    };

    (!host.is_empty()).then(|| host.to_string())
}

/// Candidate source errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("IO error on {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
}

impl SourceError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        SourceError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}
