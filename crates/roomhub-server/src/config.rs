//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

use roomhub_core::{HubError, HubResult, DEFAULT_HUB_PATH};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            token: None,
            cert: None,
            key: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_path() -> String {
    DEFAULT_HUB_PATH.to_string()
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub path: Option<String>,
    pub token: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub path: String,
    pub token: String,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl ServerConfig {
    /// Plain-WebSocket configuration for `listen` with the default path.
    pub fn new(listen: SocketAddr, token: impl Into<String>) -> Self {
        Self {
            listen,
            path: default_path(),
            token: token.into(),
            cert_path: None,
            key_path: None,
        }
    }

    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; a missing token is.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> HubResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| HubError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        let server = file_config.server;

        let listen_str = cli.listen.unwrap_or(server.listen);
        let listen = listen_str
            .parse::<SocketAddr>()
            .map_err(|e| HubError::Config(format!("invalid listen address {listen_str:?}: {e}")))?;

        let mut path = cli.path.unwrap_or(server.path);
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if path.len() > 1 {
            path = path.trim_end_matches('/').to_string();
        }

        let token = cli
            .token
            .or(server.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| HubError::Config("a token is required (--token or [server].token)".into()))?;

        let cert_path = cli.cert.or(server.cert).map(|s| expand_tilde_str(&s));
        let key_path = cli.key.or(server.key).map(|s| expand_tilde_str(&s));
        if cert_path.is_some() != key_path.is_some() {
            return Err(HubError::Config(
                "TLS needs both a certificate and a key".into(),
            ));
        }

        Ok(Self {
            listen,
            path,
            token,
            cert_path,
            key_path,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_with_cli_token() {
        let cfg = ServerConfig::load(
            None,
            CliOverrides {
                token: Some("secret".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.path, "/hub");
        assert_eq!(cfg.token, "secret");
        assert!(cfg.cert_path.is_none());
    }

    #[test]
    fn missing_token_is_an_error() {
        let err = ServerConfig::load(None, CliOverrides::default()).unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }

    #[test]
    fn file_values_are_used() {
        let file = write_config(
            r#"
[server]
listen = "127.0.0.1:9000"
path = "tunnels/"
token = "from-file"
"#,
        );
        let cfg = ServerConfig::load(Some(file.path()), CliOverrides::default()).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.path, "/tunnels");
        assert_eq!(cfg.token, "from-file");
    }

    #[test]
    fn cli_overrides_file() {
        let file = write_config("[server]\ntoken = \"from-file\"\nlisten = \"127.0.0.1:9000\"\n");
        let cfg = ServerConfig::load(
            Some(file.path()),
            CliOverrides {
                token: Some("from-cli".into()),
                listen: Some("127.0.0.1:9001".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.token, "from-cli");
        assert_eq!(cfg.listen.port(), 9001);
    }

    #[test]
    fn nonexistent_file_uses_defaults() {
        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/roomhub/server.toml")),
            CliOverrides {
                token: Some("t".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.path, "/hub");
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let err = ServerConfig::load(
            None,
            CliOverrides {
                token: Some("t".into()),
                cert: Some("/tmp/cert.pem".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let file = write_config("[server\nlisten = ");
        let err = ServerConfig::load(Some(file.path()), CliOverrides::default()).unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }
}
