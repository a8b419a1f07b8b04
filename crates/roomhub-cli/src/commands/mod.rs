//! CLI subcommand implementations.

pub mod agent;
pub mod client;

use anyhow::{Context, Result};
use roomhub_client::{ConnectConfig, HubClient, ProxyMode};

use crate::config::Config;

/// Hub connection settings after merging flags over the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSettings {
    pub url: String,
    pub token: String,
    pub room: String,
    pub password: String,
    pub proxy: ProxyMode,
}

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct HubFlags {
    pub hub: Option<String>,
    pub token: Option<String>,
    pub room: Option<String>,
    pub password: Option<String>,
    pub proxy: Option<String>,
    pub bypass_proxy: bool,
}

impl HubSettings {
    pub fn resolve(flags: HubFlags, config: &Config) -> Result<Self> {
        let url = flags
            .hub
            .or_else(|| config.hub.url.clone())
            .context("no hub given (use --hub or [hub].url)")?;
        let token = flags
            .token
            .or_else(|| config.hub.token.clone())
            .context("no token given (use --token or [hub].token)")?;
        let proxy = if flags.bypass_proxy {
            ProxyMode::Direct
        } else if let Some(proxy) = flags.proxy {
            ProxyMode::Explicit(proxy)
        } else if config.hub.bypass_proxy {
            ProxyMode::Direct
        } else if let Some(proxy) = &config.hub.proxy {
            ProxyMode::Explicit(proxy.clone())
        } else {
            ProxyMode::System
        };
        Ok(Self {
            url,
            token,
            room: flags.room.unwrap_or_else(|| config.hub.room.clone()),
            password: flags.password.unwrap_or_else(|| config.hub.password.clone()),
            proxy,
        })
    }

    pub fn client(&self) -> HubClient {
        let config = ConnectConfig {
            proxy: self.proxy.clone(),
            ..ConnectConfig::default()
        };
        HubClient::with_config(self.url.clone(), self.token.clone(), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let mut config = Config::default();
        config.hub.url = Some("ws://file/hub".into());
        config.hub.token = Some("file-token".into());
        let settings = HubSettings::resolve(
            HubFlags {
                hub: Some("ws://flag/hub".into()),
                room: Some("ops".into()),
                ..Default::default()
            },
            &config,
        )
        .unwrap();
        assert_eq!(settings.url, "ws://flag/hub");
        assert_eq!(settings.token, "file-token");
        assert_eq!(settings.room, "ops");
        assert_eq!(settings.password, "my room password");
        assert_eq!(settings.proxy, ProxyMode::System);
    }

    #[test]
    fn proxy_flags_and_config() {
        let mut config = Config::default();
        config.hub.url = Some("wss://hub/hub".into());
        config.hub.token = Some("t".into());
        config.hub.proxy = Some("http://file-proxy:3128".into());

        let from_file = HubSettings::resolve(HubFlags::default(), &config).unwrap();
        assert_eq!(from_file.proxy, ProxyMode::Explicit("http://file-proxy:3128".into()));

        let flag = HubFlags {
            proxy: Some("flag-proxy:8080".into()),
            ..Default::default()
        };
        let from_flag = HubSettings::resolve(flag, &config).unwrap();
        assert_eq!(from_flag.proxy, ProxyMode::Explicit("flag-proxy:8080".into()));

        let bypass = HubFlags {
            bypass_proxy: true,
            ..Default::default()
        };
        assert_eq!(HubSettings::resolve(bypass, &config).unwrap().proxy, ProxyMode::Direct);
    }

    #[test]
    fn missing_hub_or_token_fails() {
        let config = Config::default();
        assert!(HubSettings::resolve(HubFlags::default(), &config).is_err());
        let only_hub = HubFlags {
            hub: Some("ws://h/hub".into()),
            ..Default::default()
        };
        assert!(HubSettings::resolve(only_hub, &config).is_err());
    }
}
