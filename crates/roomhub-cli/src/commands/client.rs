//! `roomhub client`: expose remote destinations on local addresses.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use roomhub_client::client::RDP_PORT;
use roomhub_client::{ClientConfig, ClientRole, TunnelSpec};
use tracing::info;

use super::HubSettings;
use crate::config::{Config, TunnelEntry};

/// Client-specific flags.
#[derive(Debug, Clone, Default)]
pub struct ClientFlags {
    pub tunnels: Vec<String>,
    pub rdp: Option<String>,
    pub listen: Option<SocketAddr>,
    pub tunnels_file: Option<PathBuf>,
    pub exit_on_disconnect: bool,
}

/// Work out which tunnels to serve.
///
/// Precedence: `--tunnel` (repeatable, `[LISTEN=]DEST`), then `--rdp`, then
/// `--tunnels <file>`, then the config file's `[[tunnels]]`. `--listen` only
/// applies to a single tunnel.
pub fn tunnel_specs(flags: &ClientFlags, config: &Config) -> Result<Vec<TunnelSpec>> {
    if !flags.tunnels.is_empty() {
        if flags.listen.is_some() && flags.tunnels.len() > 1 {
            bail!("--listen needs exactly one --tunnel; use LISTEN=DEST for several");
        }
        return flags
            .tunnels
            .iter()
            .map(|arg| {
                let entry = parse_tunnel_arg(arg);
                let mut spec = spec_from_entry(&entry)?;
                if let Some(listen) = flags.listen {
                    spec.listen = listen;
                }
                Ok(spec)
            })
            .collect();
    }
    if let Some(host) = &flags.rdp {
        return Ok(vec![TunnelSpec::new(flags.listen, host, Some(RDP_PORT))]);
    }

    let entries = match &flags.tunnels_file {
        Some(path) => Config::load_existing(path)?.tunnels,
        None => config.tunnels.clone(),
    };
    if entries.is_empty() {
        bail!("client needs --tunnel, --rdp, --tunnels or [[tunnels]] in the config file");
    }
    entries.iter().map(spec_from_entry).collect()
}

fn parse_tunnel_arg(arg: &str) -> TunnelEntry {
    match arg.split_once('=') {
        Some((listen, destination)) => TunnelEntry {
            listen: Some(listen.to_string()),
            destination: destination.to_string(),
        },
        None => TunnelEntry {
            listen: None,
            destination: arg.to_string(),
        },
    }
}

fn spec_from_entry(entry: &TunnelEntry) -> Result<TunnelSpec> {
    let listen = entry
        .listen
        .as_deref()
        .map(|l| {
            l.parse::<SocketAddr>()
                .with_context(|| format!("invalid listen address {l:?}"))
        })
        .transpose()?;
    Ok(TunnelSpec::new(listen, &entry.destination, None))
}

pub async fn run(hub: HubSettings, flags: ClientFlags, config: &Config) -> Result<()> {
    let tunnels = tunnel_specs(&flags, config)?;

    let mut client_config = ClientConfig::new(hub.room.clone(), hub.password.clone());
    client_config.exit_on_disconnect = flags.exit_on_disconnect;

    info!(hub = %hub.url, room = %hub.room, tunnels = tunnels.len(), "starting client");
    let client = ClientRole::start(hub.client(), client_config, tunnels)
        .await
        .with_context(|| format!("failed to start client on {}", hub.url))?;
    for spec in client.tunnels() {
        println!("{} -> {}", spec.listen, spec.destination);
    }
    client.run().await.context("client stopped")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tunnel_flag_wins() {
        let flags = ClientFlags {
            tunnels: vec!["web:80".into()],
            rdp: Some("desk".into()),
            listen: Some("127.0.0.5:8080".parse().unwrap()),
            ..Default::default()
        };
        let specs = tunnel_specs(&flags, &Config::default()).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].destination, "web:80");
        assert_eq!(specs[0].listen.to_string(), "127.0.0.5:8080");
    }

    #[test]
    fn repeated_tunnel_flags() {
        let flags = ClientFlags {
            tunnels: vec!["127.0.0.3:2222=git:22".into(), "web:80".into()],
            ..Default::default()
        };
        let specs = tunnel_specs(&flags, &Config::default()).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].listen.to_string(), "127.0.0.3:2222");
        assert_eq!(specs[0].destination, "git:22");
        assert!(specs[1].listen.ip().is_loopback());

        let ambiguous = ClientFlags {
            listen: Some("127.0.0.1:1".parse().unwrap()),
            ..flags
        };
        assert!(tunnel_specs(&ambiguous, &Config::default()).is_err());
    }

    #[test]
    fn rdp_gets_default_port() {
        let flags = ClientFlags {
            rdp: Some("desk.lab".into()),
            ..Default::default()
        };
        let specs = tunnel_specs(&flags, &Config::default()).unwrap();
        assert_eq!(specs[0].destination, "desk.lab:3389");
        assert_eq!(specs[0].listen.port(), 3389);
    }

    #[test]
    fn tunnels_come_from_config() {
        let mut config = Config::default();
        config.tunnels = vec![
            TunnelEntry {
                listen: Some("127.0.0.2:3389".into()),
                destination: "a:3389".into(),
            },
            TunnelEntry {
                listen: None,
                destination: "b:443".into(),
            },
        ];
        let specs = tunnel_specs(&ClientFlags::default(), &config).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].listen.to_string(), "127.0.0.2:3389");
        assert_eq!(specs[1].destination, "b:443");
    }

    #[test]
    fn tunnels_file_overrides_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[[tunnels]]\nlisten = \"127.0.0.9:80\"\ndestination = \"from-file:80\""
        )
        .unwrap();
        let mut config = Config::default();
        config.tunnels = vec![TunnelEntry {
            listen: None,
            destination: "from-config:1".into(),
        }];
        let flags = ClientFlags {
            tunnels_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let specs = tunnel_specs(&flags, &config).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].destination, "from-file:80");
    }

    #[test]
    fn nothing_to_serve_is_an_error() {
        assert!(tunnel_specs(&ClientFlags::default(), &Config::default()).is_err());
    }

    #[test]
    fn bad_listen_address_is_an_error() {
        let mut config = Config::default();
        config.tunnels = vec![TunnelEntry {
            listen: Some("not-an-address".into()),
            destination: "a:1".into(),
        }];
        assert!(tunnel_specs(&ClientFlags::default(), &config).is_err());
    }
}
