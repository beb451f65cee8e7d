//! Two-node test fixture for integration testing
//!
//! Provides a reusable pair of nodes sharing one peering:
//! - Session establishment
//! - Messages and requests in both directions
//! - Teardown
//!
//! # Example
//!
//! ```no_run
//! use tether_integration_tests::fixtures::TwoNodeFixture;
//!
//! let fixture = TwoNodeFixture::new();
//! fixture.establish_session().unwrap();
//! assert!(fixture.initiator.registry.has_peer(&fixture.initiator_peer()));
//! ```

use super::node::{RecordingListener, TestNode, wait_for};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Identifier, Listener, Peering};

/// Secret shared by the two fixture nodes
pub const FIXTURE_SECRET: &str = "correct horse battery staple";

/// Two nodes, `alice` dialling `bob`
pub struct TwoNodeFixture {
    /// Dialling side
    pub initiator: TestNode,
    /// Listening side
    pub responder: TestNode,
    /// Ids as `alice` sees the relationship
    pub initiator_ids: Peering,
    /// Ids as `bob` sees the relationship
    pub responder_ids: Peering,
    /// Inbound traffic at `alice`
    pub initiator_listener: Arc<RecordingListener>,
    /// Inbound traffic at `bob`
    pub responder_listener: Arc<RecordingListener>,
}

impl TwoNodeFixture {
    /// Both nodes with echo-only listeners
    #[must_use]
    pub fn new() -> Self {
        Self::with_listeners(RecordingListener::new(), RecordingListener::new())
    }

    /// Both nodes with the given listeners
    #[must_use]
    pub fn with_listeners(
        initiator_listener: Arc<RecordingListener>,
        responder_listener: Arc<RecordingListener>,
    ) -> Self {
        let initiator = TestNode::start("alice-laptop");
        let responder = TestNode::start("bob-desktop");

        let initiator_ids = initiator.register(
            FIXTURE_SECRET,
            "alice",
            "bob",
            Some(Arc::clone(&initiator_listener) as Arc<dyn Listener>),
        );
        let responder_ids = responder.register(
            FIXTURE_SECRET,
            "bob",
            "alice",
            Some(Arc::clone(&responder_listener) as Arc<dyn Listener>),
        );

        Self {
            initiator,
            responder,
            initiator_ids,
            responder_ids,
            initiator_listener,
            responder_listener,
        }
    }

    /// Connect and wait until both sides registered the connection
    pub fn establish_session(&self) -> tether_core::Result<Identifier> {
        let id = self
            .initiator
            .connect(&self.responder, &self.initiator_ids.peering)?;
        let responder_side = self.responder_peer();
        assert!(
            wait_for(Duration::from_secs(5), || self
                .responder
                .registry
                .has_peer(&responder_side)),
            "responder never registered the session"
        );
        Ok(id)
    }

    /// Identifier `alice` registers the connection under
    #[must_use]
    pub fn initiator_peer(&self) -> Identifier {
        self.initiator_ids
            .peering
            .clone()
            .with_instance(self.responder.instance())
    }

    /// Identifier `bob` registers the connection under
    #[must_use]
    pub fn responder_peer(&self) -> Identifier {
        self.responder_ids
            .peering
            .clone()
            .with_instance(self.initiator.instance())
    }
}

impl Default for TwoNodeFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_ids_are_mirrored() {
        let fixture = TwoNodeFixture::new();
        assert_eq!(
            fixture.initiator_ids.peering,
            fixture.responder_ids.remote_peering
        );
        assert_eq!(
            fixture.initiator_ids.remote_peering,
            fixture.responder_ids.peering
        );
    }

    #[test]
    fn test_fixture_session() {
        let fixture = TwoNodeFixture::new();
        let id = fixture.establish_session().unwrap();
        assert_eq!(id, fixture.initiator_peer());
        assert_eq!(
            fixture.initiator.registry.connected_peers(),
            vec![fixture.initiator_peer()]
        );
    }
}
