//! Destination policy for the agent.
//!
//! - [`DestinationPolicy`]: plain configuration (allowlist, tunnel cap).
//! - [`PolicyEnforcer`]: runtime counterpart owning the policy plus an
//!   atomic count of live tunnels.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Which destinations the agent may dial, and how many tunnels at once.
///
/// | Pattern             | Matches                              |
/// |---------------------|--------------------------------------|
/// | `"*"`               | Any host and port.                   |
/// | `"db.internal"`     | That host on any port.               |
/// | `"db.internal:5432"`| That host and port only.             |
///
/// An empty allowlist allows every destination.
#[derive(Debug, Clone)]
pub struct DestinationPolicy {
    pub allowed_destinations: Vec<String>,
    /// Maximum concurrent tunnels.
    pub max_tunnels: usize,
}

impl Default for DestinationPolicy {
    fn default() -> Self {
        Self {
            allowed_destinations: Vec::new(),
            max_tunnels: 256,
        }
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    NotAllowed,
    TooManyTunnels,
}

/// Runtime policy checks with atomic tunnel tracking.
pub struct PolicyEnforcer {
    policy: DestinationPolicy,
    active: Arc<AtomicUsize>,
    allowed_set: HashSet<String>,
    allow_all: bool,
}

impl PolicyEnforcer {
    pub fn new(policy: DestinationPolicy) -> Self {
        let allow_all = policy.allowed_destinations.is_empty()
            || policy.allowed_destinations.iter().any(|d| d == "*");
        let allowed_set = policy
            .allowed_destinations
            .iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
        Self {
            policy,
            active: Arc::new(AtomicUsize::new(0)),
            allowed_set,
            allow_all,
        }
    }

    /// Check `destination` (`host:port`) against the allowlist.
    pub fn check(&self, destination: &str) -> Result<(), Refusal> {
        if self.allow_all {
            return Ok(());
        }
        let destination = destination.to_ascii_lowercase();
        let host = split_host_port(&destination)
            .map(|(host, _)| host)
            .unwrap_or(destination.as_str());

        if self.allowed_set.contains(&destination) || self.allowed_set.contains(host) {
            Ok(())
        } else {
            Err(Refusal::NotAllowed)
        }
    }

    /// Reserve a tunnel slot. The slot is released when the guard drops.
    pub fn try_acquire(&self) -> Result<TunnelGuard, Refusal> {
        let max = self.policy.max_tunnels;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| Refusal::TooManyTunnels)?;
        Ok(TunnelGuard {
            counter: self.active.clone(),
        })
    }

    /// Number of tunnels currently holding a slot.
    pub fn active_tunnels(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// RAII guard that frees a tunnel slot on drop.
pub struct TunnelGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Split `host:port`, accepting bracketed IPv6 (`[::1]:22`).
pub fn split_host_port(destination: &str) -> Option<(&str, u16)> {
    let (host, port) = destination.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host, port))
}
