//! # Tether Core
//!
//! Peer-connection engine for the Tether overlay.
//!
//! This crate provides:
//! - Line-based frame encoding and decoding
//! - Shared-secret handshake with per-direction session keys
//! - Request/response multiplexing with streamed payload channels
//! - A per-connection sender worker
//! - A rendezvous relay pairing peers that cannot reach each other
//! - The [`Registry`] tying peerings, connections and traffic together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Registry                                 │
//! │   (peerings, live handlers, meeting points, listener thread)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │              Handler (reader)  |  Sender (writer)                │
//! │   (one thread pair per authenticated connection)                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Frames                                   │
//! │   (H A I G R D E C M lines, under obfuscation or session key)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use tether_core::{Config, Peering, Registry};
//!
//! # fn main() -> tether_core::Result<()> {
//! let registry = Registry::new(Config::default())?;
//! let ids = Peering::derive(b"shared secret", "alice", "bob");
//! registry.register_peering(ids.peering, ids.remote_peering, "shared secret", None);
//! let addr = registry.listen("0.0.0.0:0")?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod content;
pub mod error;
pub mod frame;
mod handler;
pub mod handshake;
pub mod identifier;
pub mod listener;
pub mod message;
pub mod multiplexer;
pub mod registry;
mod relay;
pub mod request;
pub mod sender;
pub mod stream;

pub use config::{Config, RendezvousConfig};
pub use content::Content;
pub use error::{Error, Result};
pub use frame::{Command, Frame, FrameReader, FrameWriter, Parameters};
pub use handshake::{Credentials, Handshake, Hello, Session, SessionState};
pub use identifier::{Identifier, Peering};
pub use listener::{AddressProvider, Listener};
pub use message::Message;
pub use registry::Registry;
pub use request::{Request, Response, Status};
pub use sender::SenderQueue;
pub use stream::Transport;

/// Application name advertised in hello frames
pub const APPLICATION: &str = "tether";

/// Protocol version advertised in hello frames
pub const PROTOCOL_VERSION: &str = "1";

/// Default size of one `D` chunk in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
