//! Tether CLI
//!
//! Runs a node that keeps authenticated connections to its configured peers
//! and relays connections between peers that cannot reach each other.

mod config;

use clap::{Parser, Subcommand};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tether_core::{Identifier, Listener, Message, Peering, Registry, Request, Response, Status};
use tracing_subscriber::EnvFilter;

use config::{Config, PeeringConfig};

/// Tether - authenticated peer connections with rendezvous relaying
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as background daemon
    Daemon {
        /// Bind address (overrides the configuration)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Print the ids a relationship registers under
    Peering {
        /// Shared secret
        #[arg(short, long)]
        secret: String,

        /// Local name
        #[arg(short, long)]
        local: String,

        /// Remote name
        #[arg(short, long)]
        remote: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Peering {
        secret,
        local,
        remote,
    } = &cli.command
    {
        let ids = Peering::derive(secret.as_bytes(), local, remote);
        println!("peering:        {}", ids.peering);
        println!("remote peering: {}", ids.remote_peering);
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    init_logging(cli.verbose, &config);
    config.validate()?;

    match cli.command {
        Commands::Daemon { bind } => run_daemon(bind, &config),
        Commands::Peering { .. } => Ok(()),
    }
}

/// `RUST_LOG` wins, then `--verbose`, then the configured level
fn init_logging(verbose: bool, config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            config.logging.level.as_str()
        };
        EnvFilter::new(level)
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Logs inbound traffic and answers `ping` requests
struct LoggingListener {
    name: String,
}

impl Listener for LoggingListener {
    fn on_request(&self, peer: &Identifier, request: &Request) -> Vec<Response> {
        tracing::info!(
            "[{}] request {} '{}' from {}",
            self.name,
            request.id(),
            request.target(),
            peer
        );
        match request.target() {
            "ping" => vec![Response::new(Status::Success).with_parameter("pong", &self.name)],
            _ => Vec::new(),
        }
    }

    fn on_message(&self, message: &Message) {
        tracing::info!(
            "[{}] message from {} ({} bytes)",
            self.name,
            message.receiver(),
            message.content().len()
        );
    }
}

/// Run the node until the process is killed
fn run_daemon(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let bind: SocketAddr = match bind {
        Some(bind) => bind.parse()?,
        None => config.parse_listen_addr()?,
    };

    let registry = Registry::new(config.engine_config())?;
    let local = registry.listen(bind)?;

    println!("Tether daemon running");
    println!("  Instance: {}", registry.instance_name());
    println!("  Listening on: {}", local);
    println!("  Rendezvous: {}", config.node.rendezvous);

    let peerings: Vec<(Peering, &PeeringConfig)> = config
        .peerings
        .iter()
        .map(|entry| {
            let ids = Peering::derive(entry.secret.as_bytes(), &entry.local, &entry.remote);
            registry.register_peering(
                ids.peering.clone(),
                ids.remote_peering.clone(),
                entry.secret.as_bytes(),
                Some(Arc::new(LoggingListener {
                    name: format!("{}/{}", entry.local, entry.remote),
                })),
            );
            println!("  Peering {}/{}: {}", entry.local, entry.remote, ids.peering);
            (ids, entry)
        })
        .collect();

    let interval = Duration::from_secs(config.timeouts.reconnect);
    let connect_timeout = Duration::from_secs(config.timeouts.connect);

    loop {
        for (ids, entry) in &peerings {
            if !registry.has_peer(&ids.peering) {
                connect(&registry, &ids.peering, entry, connect_timeout);
            }
        }
        thread::sleep(interval);
    }
}

/// Try each configured address of `entry` until one authenticates
fn connect(registry: &Registry, peering: &Identifier, entry: &PeeringConfig, timeout: Duration) {
    for address in &entry.addresses {
        let resolved = match address.to_socket_addrs() {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!("Cannot resolve {}: {}", address, e);
                continue;
            }
        };

        for addr in resolved {
            let stream = match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!("Connect to {} failed: {}", addr, e);
                    continue;
                }
            };
            match registry.establish(stream, peering) {
                Ok(id) => {
                    tracing::info!("Connected to {}/{} as {}", entry.local, entry.remote, id);
                    return;
                }
                Err(e) => tracing::warn!("Handshake with {} failed: {}", addr, e),
            }
        }
    }
}
