//! `roomhub agent`: serve tunnel requests from the private side.

use anyhow::{Context, Result};
use roomhub_client::{AgentConfig, AgentRole};
use tracing::info;

use super::HubSettings;
use crate::config::Config;

/// Agent-specific flags.
#[derive(Debug, Clone, Default)]
pub struct AgentFlags {
    pub allow: Vec<String>,
    pub max_tunnels: Option<usize>,
    pub exit_on_disconnect: bool,
}

pub fn build_config(hub: &HubSettings, flags: AgentFlags, config: &Config) -> AgentConfig {
    let mut agent = AgentConfig::new(hub.room.clone(), hub.password.clone());
    agent.policy.allowed_destinations = if flags.allow.is_empty() {
        config.agent.allowed_destinations.clone()
    } else {
        flags.allow
    };
    agent.policy.max_tunnels = flags.max_tunnels.unwrap_or(config.agent.max_tunnels);
    agent.exit_on_disconnect = flags.exit_on_disconnect;
    agent
}

pub async fn run(hub: HubSettings, flags: AgentFlags, config: &Config) -> Result<()> {
    let agent_config = build_config(&hub, flags, config);
    info!(hub = %hub.url, room = %hub.room, "starting agent");

    let agent = AgentRole::start(hub.client(), agent_config)
        .await
        .with_context(|| format!("failed to join room {:?} on {}", hub.room, hub.url))?;
    agent.run().await.context("agent stopped")
}
