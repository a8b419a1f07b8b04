//! roomhub: reach TCP services that sit behind a rendezvous hub.
//!
//! `roomhub agent` runs next to the services and serves tunnel requests;
//! `roomhub client` listens locally and forwards each connection through
//! the hub to the agent.

mod commands;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use roomhub_client::{ExitHook, ProcessExit};
use tracing::{error, info};

use commands::agent::AgentFlags;
use commands::client::ClientFlags;
use commands::{HubFlags, HubSettings};

/// roomhub — tunnels through a rendezvous hub
#[derive(Parser)]
#[command(name = "roomhub", version, about = "Tunnel TCP connections through a rendezvous hub")]
struct Cli {
    /// Hub URL, e.g. wss://hub.example.com/hub
    #[arg(long, global = true)]
    hub: Option<String>,

    /// Token shared by hub, agent and client
    #[arg(long, global = true, env = "ROOMHUB_TOKEN")]
    token: Option<String>,

    /// Control room shared by agent and client
    #[arg(long, global = true)]
    room: Option<String>,

    /// Control room password
    #[arg(long, global = true)]
    password: Option<String>,

    /// HTTP proxy for reaching the hub (default: HTTPS_PROXY / HTTP_PROXY)
    #[arg(long, global = true, conflicts_with = "bypass_proxy")]
    proxy: Option<String>,

    /// Connect to the hub directly, ignoring any proxy
    #[arg(long, global = true)]
    bypass_proxy: bool,

    /// Stop once a tunnel's TCP connection ends
    #[arg(long, global = true)]
    exit_on_disconnect: bool,

    /// Stop after the given duration (e.g. 90s, 1h30m)
    #[arg(long, global = true, value_parser = config::parse_duration)]
    exit_after: Option<Duration>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Exit status when `--exit-after` ends the process, distinct from a clean stop.
const EXIT_AFTER_CODE: i32 = 1;

#[derive(Subcommand)]
enum Command {
    /// Serve tunnel requests next to the destinations
    Agent {
        /// Allowed destination (`host` or `host:port`, `*` for any); repeatable
        #[arg(long = "allow")]
        allow: Vec<String>,

        /// Maximum concurrent tunnels
        #[arg(long)]
        max_tunnels: Option<usize>,
    },

    /// Listen locally and tunnel connections to a destination
    Client {
        /// Destination `host:port` reached through the agent, optionally
        /// prefixed with `ip:port=`; repeatable
        #[arg(long = "tunnel")]
        tunnels: Vec<String>,

        /// RDP host (port 3389 unless given)
        #[arg(long)]
        rdp: Option<String>,

        /// Local ip:port to listen on (random 127.x.y.z:3389 if omitted)
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// TOML file with [[tunnels]] entries
        #[arg(long = "tunnels")]
        tunnels_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    use tracing_subscriber::EnvFilter;
    let default_filter = if cli.verbose {
        "roomhub_cli=debug,roomhub_client=debug,roomhub_core=debug"
    } else {
        "roomhub_cli=info,roomhub_client=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cli.verbose)
        .init();

    // Load config file.
    let config_path = cli.config.clone().map(PathBuf::from).unwrap_or_else(|| {
        let home = dirs::home_dir().unwrap_or_default();
        home.join(".roomhub").join("config.toml")
    });
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("roomhub: {e:#}");
            std::process::exit(1);
        }
    };

    let flags = HubFlags {
        hub: cli.hub,
        token: cli.token,
        room: cli.room,
        password: cli.password,
        proxy: cli.proxy,
        bypass_proxy: cli.bypass_proxy,
    };
    let hub = match HubSettings::resolve(flags, &cfg) {
        Ok(hub) => hub,
        Err(e) => {
            eprintln!("roomhub: {e:#}");
            std::process::exit(1);
        }
    };

    if let Some(after) = cli.exit_after {
        spawn_exit_timer(after, Arc::new(ProcessExit));
    }

    let exit_on_disconnect = cli.exit_on_disconnect;
    let command = cli.command;
    let work = async move {
        match command {
            Command::Agent { allow, max_tunnels } => {
                let flags = AgentFlags {
                    allow,
                    max_tunnels,
                    exit_on_disconnect,
                };
                commands::agent::run(hub, flags, &cfg).await
            }
            Command::Client {
                tunnels,
                rdp,
                listen,
                tunnels_file,
            } => {
                let flags = ClientFlags {
                    tunnels,
                    rdp,
                    listen,
                    tunnels_file,
                    exit_on_disconnect,
                };
                commands::client::run(hub, flags, &cfg).await
            }
        }
    };

    let result = tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("roomhub: {e:#}");
        std::process::exit(1);
    }
}

/// End the process through `hook` once `after` has elapsed.
fn spawn_exit_timer(after: Duration, hook: Arc<dyn ExitHook>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        info!(after = ?after, "exit-after elapsed");
        hook.exit(EXIT_AFTER_CODE);
    })
}
