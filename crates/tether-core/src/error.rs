//! Error types for the Tether connection engine.
//!
//! Errors are categorized by what they do to the connection that raised them:
//!
//! - **Fatal**: the handler tears the connection down (protocol violations,
//!   authentication failures, network failures, handshake timeouts)
//! - **Channel-scoped**: only one streamed transfer is aborted and the
//!   connection stays up (content read failures, unknown channels)
//! - **Caller errors**: returned to the registry caller without touching any
//!   connection (not connected, unknown peering)
//!
//! Nothing fatal is retried inside the engine; reconnecting is the caller's
//! decision.

use crate::identifier::Identifier;
use std::borrow::Cow;
use thiserror::Error;

/// Errors raised by the connection engine
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame, unexpected command or unexpected field
    #[error("protocol error: {0}")]
    Protocol(Cow<'static, str>),

    /// Hash mismatch or unknown secret during the handshake
    #[error("authentication failed: {0}")]
    AuthenticationFailed(Cow<'static, str>),

    /// Socket closed, read or write failure
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// The handshake did not complete in time
    #[error("handshake timed out")]
    Timeout,

    /// Reading an outbound channel's content source failed
    #[error("content read failed on channel {channel}: {source}")]
    ContentRead {
        /// Channel whose source failed
        channel: u32,
        /// Underlying read error
        source: std::io::Error,
    },

    /// Data or stop frame for a channel that is not open
    #[error("unknown channel: {0}")]
    UnknownChannel(u32),

    /// A handler is already registered under this identifier
    #[error("peer already connected: {0}")]
    AlreadyConnected(Identifier),

    /// No handler is registered for this identifier
    #[error("peer not connected: {0}")]
    NotConnected(Identifier),

    /// No peering is registered under this identifier
    #[error("unknown peering: {0}")]
    UnknownPeering(Identifier),

    /// The connection was handed over to a relay splice or the relay failed
    #[error("rendezvous: {0}")]
    Rendezvous(Cow<'static, str>),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Cryptographic primitive failure
    #[error("crypto error: {0}")]
    Crypto(#[from] tether_crypto::CryptoError),
}

impl Error {
    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        Error::Protocol(Cow::Borrowed(context))
    }

    /// Create an authentication error with static context (zero allocation)
    #[must_use]
    pub const fn authentication(context: &'static str) -> Self {
        Error::AuthenticationFailed(Cow::Borrowed(context))
    }

    /// Create a rendezvous error with static context (zero allocation)
    #[must_use]
    pub const fn rendezvous(context: &'static str) -> Self {
        Error::Rendezvous(Cow::Borrowed(context))
    }

    /// Returns true if this error terminates the connection it occurred on
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::AuthenticationFailed(_)
                | Error::Network(_)
                | Error::Timeout
                | Error::Rendezvous(_)
                | Error::Crypto(_)
        )
    }

    /// Returns true if this error only affects a single channel
    #[must_use]
    pub fn is_channel_scoped(&self) -> bool {
        matches!(self, Error::ContentRead { .. } | Error::UnknownChannel(_))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::protocol("bad frame").is_fatal());
        assert!(Error::authentication("mismatch").is_fatal());
        assert!(Error::Timeout.is_fatal());
        assert!(!Error::UnknownChannel(3).is_fatal());
        assert!(Error::UnknownChannel(3).is_channel_scoped());
        assert!(
            Error::ContentRead {
                channel: 1,
                source: std::io::Error::other("disk"),
            }
            .is_channel_scoped()
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::protocol("unexpected command").to_string(),
            "protocol error: unexpected command"
        );
        assert_eq!(Error::UnknownChannel(7).to_string(), "unknown channel: 7");
    }
}
