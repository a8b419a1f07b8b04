//! CLI configuration at `~/.roomhub/config.toml`.
//!
//! Provides the hub address, credentials, agent policy and client tunnels.
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubSection,

    #[serde(default)]
    pub agent: AgentSection,

    /// Client tunnels, `[[tunnels]]`.
    #[serde(default)]
    pub tunnels: Vec<TunnelEntry>,
}

/// `[hub]`: where to connect and which control room to use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Hub WebSocket URL, e.g. `wss://hub.example.com/hub`.
    #[serde(default)]
    pub url: Option<String>,

    /// Shared token presented to the hub.
    #[serde(default)]
    pub token: Option<String>,

    /// Control room name.
    #[serde(default = "default_room")]
    pub room: String,

    /// Control room password.
    #[serde(default = "default_password")]
    pub password: String,

    /// HTTP proxy URL; overrides `HTTPS_PROXY` / `HTTP_PROXY`.
    #[serde(default)]
    pub proxy: Option<String>,

    /// Ignore any proxy and connect directly.
    #[serde(default)]
    pub bypass_proxy: bool,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            room: default_room(),
            password: default_password(),
            proxy: None,
            bypass_proxy: false,
        }
    }
}

/// `[agent]`: destination policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Allowed `host` / `host:port` patterns. Empty = any.
    #[serde(default)]
    pub allowed_destinations: Vec<String>,

    #[serde(default = "default_max_tunnels")]
    pub max_tunnels: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            allowed_destinations: Vec::new(),
            max_tunnels: default_max_tunnels(),
        }
    }
}

/// One `[[tunnels]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEntry {
    /// Local `ip:port` to listen on. Random loopback when absent.
    #[serde(default)]
    pub listen: Option<String>,
    pub destination: String,
}

fn default_room() -> String {
    "control room".to_string()
}

fn default_password() -> String {
    "my room password".to_string()
}

fn default_max_tunnels() -> usize {
    256
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_existing(path)
    }

    /// Load a file that must exist (e.g. one named by `--tunnels`).
    pub fn load_existing(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), tunnels = config.tunnels.len(), "loaded config");
        Ok(config)
    }
}

/// Parse durations like `90s`, `1h30m`, `500ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in {input:?}"))?;
        if digits == 0 {
            return Err(format!("expected a number in {input:?}"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("invalid number in {input:?}: {e}"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let too_long = || format!("duration {input:?} is too long");
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(too_long)?),
            "h" => Duration::from_secs(value.checked_mul(3600).ok_or_else(too_long)?),
            other => return Err(format!("unknown unit {other:?} in {input:?}")),
        };
        total = total.checked_add(unit).ok_or_else(too_long)?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}
