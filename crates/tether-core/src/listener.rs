//! Application-facing callbacks.

use crate::identifier::Identifier;
use crate::message::Message;
use crate::request::{Request, Response};
use std::net::SocketAddr;

/// Receives inbound traffic for one peering
///
/// Both callbacks run on the connection's reader thread and must not block
/// for long: nothing else is read from that connection meanwhile.
pub trait Listener: Send + Sync {
    /// Serve an inbound request; an empty list is answered with `Failed`
    fn on_request(&self, peer: &Identifier, request: &Request) -> Vec<Response> {
        let _ = (peer, request);
        Vec::new()
    }

    /// Consume an inbound message
    fn on_message(&self, message: &Message) {
        let _ = message;
    }
}

/// Supplies this node's externally reachable addresses
pub trait AddressProvider: Send + Sync {
    /// Addresses at which other nodes can reach this one
    fn external_addresses(&self) -> Vec<SocketAddr>;
}
