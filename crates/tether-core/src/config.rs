//! Engine configuration

use crate::error::{Error, Result};
use std::time::Duration;

/// Connection engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance name advertised in hello frames
    pub instance_name: String,

    /// Application name advertised in hello frames
    pub application: String,

    /// Protocol version advertised in hello frames
    pub version: String,

    /// Deadline for the whole handshake, hello to authentication
    pub handshake_timeout: Duration,

    /// Bytes read from a content source per sender tick
    pub chunk_size: usize,

    /// Rendezvous configuration
    pub rendezvous: RendezvousConfig,

    /// Timeout for outbound TCP connects made by the engine itself
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            application: crate::APPLICATION.to_string(),
            version: crate::PROTOCOL_VERSION.to_string(),
            handshake_timeout: Duration::from_secs(10),
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            rendezvous: RendezvousConfig::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Check the configuration for values the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.instance_name.is_empty() || self.instance_name.contains(char::is_whitespace) {
            return Err(Error::InvalidConfig(
                "instance name must be non-empty and contain no whitespace".into(),
            ));
        }
        if self.instance_name.contains(':') {
            return Err(Error::InvalidConfig("instance name must not contain ':'".into()));
        }
        if self.chunk_size == 0 || self.chunk_size > crate::frame::MAX_PAYLOAD {
            return Err(Error::InvalidConfig(
                format!(
                    "chunk size must be between 1 and {} bytes",
                    crate::frame::MAX_PAYLOAD
                )
                .into(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::InvalidConfig("handshake timeout must be non-zero".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig("connect timeout must be non-zero".into()));
        }
        self.rendezvous.validate()
    }
}

/// Rendezvous relay timing
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    /// Enable relaying for peerings this node does not know
    pub enabled: bool,

    /// How long to look for an existing meeting point
    pub meeting_wait: Duration,

    /// How long to wait for a positive discovery response
    pub discovery_timeout: Duration,

    /// How long a published meeting point waits for its counterpart
    pub rendezvous_timeout: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            meeting_wait: Duration::from_secs(2),
            discovery_timeout: Duration::from_secs(10),
            rendezvous_timeout: Duration::from_secs(10),
        }
    }
}

impl RendezvousConfig {
    fn validate(&self) -> Result<()> {
        if self.discovery_timeout.is_zero() || self.rendezvous_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "rendezvous timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|name| name.replace(|c: char| c.is_whitespace() || c == ':', "-"))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "default".to_string())
}
