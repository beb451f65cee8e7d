//! Configuration system for the Tether CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tether configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Relationships this node maintains
    #[serde(default, rename = "peering", skip_serializing_if = "Vec::is_empty")]
    pub peerings: Vec<PeeringConfig>,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Instance name advertised to peers (defaults to the host name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Bytes sent per data chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Relay connections for peerings this node does not know
    #[serde(default = "default_true")]
    pub rendezvous: bool,
}

/// Timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Whole handshake
    #[serde(default = "default_handshake")]
    pub handshake: u64,
    /// Outbound TCP connect
    #[serde(default = "default_connect")]
    pub connect: u64,
    /// Looking for an existing meeting point
    #[serde(default = "default_meeting_wait")]
    pub meeting_wait: u64,
    /// Waiting for a discovery answer
    #[serde(default = "default_discovery")]
    pub discovery: u64,
    /// Waiting on a published meeting point
    #[serde(default = "default_rendezvous")]
    pub rendezvous: u64,
    /// Pause between reconnect rounds
    #[serde(default = "default_reconnect")]
    pub reconnect: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One `[[peering]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeeringConfig {
    /// Local name in the relationship
    pub local: String,
    /// Remote name in the relationship
    pub remote: String,
    /// Shared secret
    pub secret: String,
    /// Where the peer can be reached (`host:port`)
    #[serde(default)]
    pub addresses: Vec<String>,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:40400".to_string()
}

fn default_chunk_size() -> usize {
    tether_core::DEFAULT_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}

fn default_handshake() -> u64 {
    10
}

fn default_connect() -> u64 {
    5
}

fn default_meeting_wait() -> u64 {
    2
}

fn default_discovery() -> u64 {
    10
}

fn default_rendezvous() -> u64 {
    10
}

fn default_reconnect() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_name: None,
            listen_addr: default_listen_addr(),
            chunk_size: default_chunk_size(),
            rendezvous: true,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake: default_handshake(),
            connect: default_connect(),
            meeting_wait: default_meeting_wait(),
            discovery: default_discovery(),
            rendezvous: default_rendezvous(),
            reconnect: default_reconnect(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tether/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.node.listen_addr.parse()?)
    }

    /// Engine configuration derived from this file
    #[must_use]
    pub fn engine_config(&self) -> tether_core::Config {
        let mut engine = tether_core::Config::default();
        if let Some(name) = &self.node.instance_name {
            engine.instance_name.clone_from(name);
        }
        engine.chunk_size = self.node.chunk_size;
        engine.handshake_timeout = Duration::from_secs(self.timeouts.handshake);
        engine.connect_timeout = Duration::from_secs(self.timeouts.connect);
        engine.rendezvous.enabled = self.node.rendezvous;
        engine.rendezvous.meeting_wait = Duration::from_secs(self.timeouts.meeting_wait);
        engine.rendezvous.discovery_timeout = Duration::from_secs(self.timeouts.discovery);
        engine.rendezvous.rendezvous_timeout = Duration::from_secs(self.timeouts.rendezvous);
        engine
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.timeouts.reconnect == 0 {
            anyhow::bail!("Reconnect interval must be at least one second");
        }

        for (index, peering) in self.peerings.iter().enumerate() {
            if peering.local.is_empty() || peering.remote.is_empty() {
                anyhow::bail!("Peering #{} needs both a local and a remote name", index + 1);
            }
            if peering.local == peering.remote {
                anyhow::bail!("Peering #{} has identical local and remote names", index + 1);
            }
            if peering.secret.is_empty() {
                anyhow::bail!("Peering {}/{} has an empty secret", peering.local, peering.remote);
            }
            for addr in &peering.addresses {
                self.validate_host_port(addr, "Peer address")?;
            }
        }

        self.engine_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        Ok(())
    }

    /// Validate host:port format
    fn validate_host_port(&self, addr: &str, name: &str) -> anyhow::Result<()> {
        let Some((host, port_str)) = addr.rsplit_once(':') else {
            anyhow::bail!(
                "{} '{}' missing port (expected format: host:port)",
                name,
                addr
            );
        };

        let port: u16 = port_str
            .parse()
            .map_err(|_| anyhow::anyhow!("{} '{}' has invalid port: {}", name, addr, port_str))?;

        if port == 0 {
            anyhow::bail!("{} '{}' has invalid port: 0", name, addr);
        }

        if host.is_empty() {
            anyhow::bail!("{} '{}' has empty hostname", name, addr);
        }

        if host.contains("..") || host.contains('/') || host.contains('\\') {
            anyhow::bail!("{} '{}' contains invalid characters", name, addr);
        }

        Ok(())
    }
}
