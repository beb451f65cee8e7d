//! Loopback test fixtures

mod node;
mod two_node;

pub use node::{RecordingListener, TestNode, test_config, wait_for};
pub use two_node::{FIXTURE_SECRET, TwoNodeFixture};
