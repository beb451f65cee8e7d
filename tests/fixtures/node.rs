//! One engine instance listening on loopback

use parking_lot::Mutex;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tether_core::{
    Config, Identifier, Listener, Message, Peering, Registry, RendezvousConfig, Request, Response,
    Status,
};

type Responder = dyn Fn(&Identifier, &Request) -> Vec<Response> + Send + Sync;

/// Engine configuration with test-sized timeouts
#[must_use]
pub fn test_config(instance: &str) -> Config {
    Config {
        instance_name: instance.to_string(),
        handshake_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
        rendezvous: RendezvousConfig {
            enabled: true,
            meeting_wait: Duration::from_millis(300),
            discovery_timeout: Duration::from_secs(3),
            rendezvous_timeout: Duration::from_secs(3),
        },
        ..Config::default()
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Listener that records inbound traffic
///
/// Requests for `echo` are answered with their own parameters; anything
/// else goes to the installed responder, if any.
#[derive(Default)]
pub struct RecordingListener {
    messages: Mutex<Vec<Message>>,
    targets: Mutex<Vec<String>>,
    responder: Option<Box<Responder>>,
}

impl RecordingListener {
    /// Listener with only the built-in `echo` target
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Listener answering every non-echo request with `responder`
    pub fn with_responder(
        responder: impl Fn(&Identifier, &Request) -> Vec<Response> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Some(Box::new(responder)),
            ..Self::default()
        })
    }

    /// Messages received so far
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Targets of the requests received so far
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().clone()
    }
}

impl Listener for RecordingListener {
    fn on_request(&self, peer: &Identifier, request: &Request) -> Vec<Response> {
        self.targets.lock().push(request.target().to_string());
        if request.target() == "echo" {
            let response = request
                .parameters()
                .iter()
                .fold(Response::new(Status::Success), |response, (name, value)| {
                    response.with_parameter(name.as_str(), value.as_str())
                });
            return vec![response];
        }
        match &self.responder {
            Some(responder) => responder(peer, request),
            None => Vec::new(),
        }
    }

    fn on_message(&self, message: &Message) {
        self.messages.lock().push(message.clone());
    }
}

/// A registry listening on an ephemeral loopback port
pub struct TestNode {
    /// The engine
    pub registry: Registry,
    /// Where it listens
    pub addr: SocketAddr,
}

impl TestNode {
    /// Start a node with [`test_config`]
    #[must_use]
    pub fn start(instance: &str) -> Self {
        Self::start_with(test_config(instance))
    }

    /// Start a node with a custom configuration
    #[must_use]
    pub fn start_with(config: Config) -> Self {
        let registry = Registry::new(config).expect("valid test configuration");
        let addr = registry.listen("127.0.0.1:0").expect("bind loopback");
        Self { registry, addr }
    }

    /// Register `local -> remote` under `secret`; returns the ids
    pub fn register(
        &self,
        secret: &str,
        local: &str,
        remote: &str,
        listener: Option<Arc<dyn Listener>>,
    ) -> Peering {
        let ids = Peering::derive(secret.as_bytes(), local, remote);
        self.registry.register_peering(
            ids.peering.clone(),
            ids.remote_peering.clone(),
            secret.as_bytes(),
            listener,
        );
        ids
    }

    /// Dial `target` and authenticate for `peering`
    pub fn connect(&self, target: &TestNode, peering: &Identifier) -> tether_core::Result<Identifier> {
        let stream = TcpStream::connect(target.addr)?;
        self.registry.establish(stream, peering)
    }

    /// Instance name this node advertises
    #[must_use]
    pub fn instance(&self) -> &str {
        self.registry.instance_name()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.registry.shutdown();
    }
}
