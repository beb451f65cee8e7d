//! Rendezvous relay.
//!
//! When an inbound hello names a peering this node does not know, the node
//! can still bring the two ends of that peering together if both can reach
//! it:
//!
//! 1. look for a meeting point another connection published under the
//!    hello's peering and claim it
//! 2. otherwise ask every connected peer (`peer:<id>` discovery request)
//!    whether it knows the peering; a peer that does answers with its own
//!    remote peering and dials back to us
//! 3. publish a meeting point under that remote peering and wait for the
//!    dial-back to claim it
//! 4. splice the two sockets: each side first replays the raw hello bytes
//!    it received, so both peers see an ordinary handshake, then bytes are
//!    copied verbatim until either side closes

use crate::error::{Error, Result};
use crate::handshake::Hello;
use crate::identifier::Identifier;
use crate::multiplexer::{DISCOVERY_PREFIX, Discovery};
use crate::registry::Registry;
use crate::request::{Request, Response, Status};
use crate::stream::Transport;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

/// One side of a prospective splice
pub(crate) struct Endpoint {
    id: u64,
    socket: TcpStream,
}

impl Endpoint {
    fn new(socket: TcpStream) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed),
            socket,
        })
    }
}

/// Meeting-point table entry
pub(crate) struct MeetingPoint {
    origin: Arc<Endpoint>,
    resolution: Option<Arc<Endpoint>>,
}

/// Relay an inbound connection whose peering is unknown
///
/// Returns once the splice ended.
///
/// # Errors
///
/// Returns [`Error::Rendezvous`] if no counterpart turned up in time; the
/// connection is closed and any published meeting point removed.
pub(crate) fn rendezvous(registry: &Registry, transport: &mut Transport, hello: &Hello) -> Result<()> {
    let rendezvous = &registry.config().rendezvous;
    let key = hello.peering.peering();
    // The spliced socket must not inherit the handshake deadline
    transport.set_read_timeout(None)?;
    let own = Endpoint::new(transport.socket()?);
    let captured = transport.reader.get_mut().take_capture();

    debug!("Looking for a meeting point for {:?}", key);
    if let Some(counterpart) = claim(registry, &key, &own, Instant::now() + rendezvous.meeting_wait) {
        info!("Relaying {:?} through claimed meeting point", key);
        splice(&own, &captured, &counterpart);
        return Ok(());
    }

    let remote = match discover(registry, &key, Instant::now() + rendezvous.discovery_timeout) {
        Ok(Some(remote)) => remote,
        Ok(None) => {
            info!("No connected peer knows {:?}, closing", key);
            transport.shutdown();
            return Err(Error::rendezvous("peering unknown to every connected peer"));
        }
        Err(e) => {
            transport.shutdown();
            return Err(e);
        }
    };

    if !publish(registry, &remote, &own) {
        transport.shutdown();
        return Err(Error::rendezvous("meeting point already taken"));
    }
    debug!("Published meeting point for {:?}", remote);

    match await_resolution(registry, &remote, &own, Instant::now() + rendezvous.rendezvous_timeout) {
        Some(counterpart) => {
            info!("Relaying {:?} through published meeting point", key);
            splice(&own, &captured, &counterpart);
            Ok(())
        }
        None => {
            info!("Nobody claimed the meeting point for {:?}, closing", remote);
            transport.shutdown();
            Err(Error::rendezvous("meeting point expired"))
        }
    }
}

/// Wait for an unresolved meeting point under `key` and attach `own` to it
fn claim(
    registry: &Registry,
    key: &Identifier,
    own: &Arc<Endpoint>,
    deadline: Instant,
) -> Option<Arc<Endpoint>> {
    let mut state = registry.state().lock();
    loop {
        if let Some(point) = state.meeting_points.get_mut(key) {
            if point.resolution.is_none() && point.origin.id != own.id {
                point.resolution = Some(Arc::clone(own));
                let origin = Arc::clone(&point.origin);
                drop(state);
                registry.meeting_changed().notify_all();
                return Some(origin);
            }
        }
        if registry.is_shutdown()
            || registry
                .meeting_changed()
                .wait_until(&mut state, deadline)
                .timed_out()
        {
            return None;
        }
    }
}

/// Publish a placeholder under `key`; false if one is already there
fn publish(registry: &Registry, key: &Identifier, own: &Arc<Endpoint>) -> bool {
    let mut state = registry.state().lock();
    if state.meeting_points.contains_key(key) {
        return false;
    }
    state.meeting_points.insert(
        key.clone(),
        MeetingPoint {
            origin: Arc::clone(own),
            resolution: None,
        },
    );
    drop(state);
    registry.meeting_changed().notify_all();
    true
}

/// Wait for the placeholder `own` published under `key` to be claimed;
/// the entry is removed either way
fn await_resolution(
    registry: &Registry,
    key: &Identifier,
    own: &Arc<Endpoint>,
    deadline: Instant,
) -> Option<Arc<Endpoint>> {
    let mut state = registry.state().lock();
    loop {
        let point = state.meeting_points.get(key)?;
        if point.origin.id != own.id {
            return None;
        }
        if let Some(resolution) = &point.resolution {
            let resolution = Arc::clone(resolution);
            state.meeting_points.remove(key);
            return Some(resolution);
        }
        if registry.is_shutdown()
            || registry
                .meeting_changed()
                .wait_until(&mut state, deadline)
                .timed_out()
        {
            state.meeting_points.remove(key);
            return None;
        }
    }
}

/// Ask connected peers who knows `key`; returns their remote peering
fn discover(registry: &Registry, key: &Identifier, deadline: Instant) -> Result<Option<Identifier>> {
    let addresses = registry
        .advertised_addresses()
        .iter()
        .map(SocketAddr::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let request = Arc::new(
        Request::new(format!("{DISCOVERY_PREFIX}{}", key.to_hex()), false)
            .with_parameter("addresses", addresses),
    );
    let id = registry.submit_request(Arc::clone(&request))?;
    debug!("Discovery request {} for {:?}", id, key);

    let mut seen = 0;
    let found = loop {
        let responses = request.responses();
        let found = responses[seen..].iter().find_map(|response| {
            if response.status() != Status::Success {
                return None;
            }
            response.parameter("remote")?.parse::<Identifier>().ok()
        });
        if found.is_some() {
            break found;
        }
        seen = responses.len();

        if !request.is_pending() || Instant::now() >= deadline {
            break None;
        }
        request.wait_responses(seen, deadline);
    };

    registry.cancel_request(id);
    Ok(found.map(|remote| remote.peering()))
}

/// Replay `captured` into the counterpart, then copy `own` into it until
/// either side closes; both sockets are shut down afterwards
fn splice(own: &Endpoint, captured: &[u8], counterpart: &Endpoint) {
    let result = (|| -> io::Result<u64> {
        let mut reader = own.socket.try_clone()?;
        let mut writer = counterpart.socket.try_clone()?;
        writer.write_all(captured)?;
        io::copy(&mut reader, &mut writer)
    })();

    match result {
        Ok(bytes) => debug!("Splice half finished after {} bytes", bytes),
        Err(e) => debug!("Splice half ended: {}", e),
    }
    let _ = own.socket.shutdown(Shutdown::Both);
    let _ = counterpart.socket.shutdown(Shutdown::Both);
}

/// Answers `peer:<id>` discovery queries arriving on one connection
pub(crate) struct DiscoveryResponder {
    registry: Registry,
    fallback: SocketAddr,
}

impl DiscoveryResponder {
    pub(crate) fn new(registry: Registry, fallback: SocketAddr) -> Self {
        Self { registry, fallback }
    }
}

impl Discovery for DiscoveryResponder {
    fn answer(&self, via: &Identifier, request: &Request) -> Response {
        let Some(peering) = request
            .target()
            .strip_prefix(DISCOVERY_PREFIX)
            .and_then(|raw| raw.trim().parse::<Identifier>().ok())
        else {
            return Response::new(Status::Failed);
        };
        let Some((credentials, _)) = self.registry.credentials(&peering) else {
            return Response::new(Status::NotFound);
        };

        let mut addresses: Vec<SocketAddr> = request
            .parameter("addresses")
            .unwrap_or_default()
            .split(',')
            .filter_map(|a| a.trim().parse().ok())
            .collect();
        if !addresses.contains(&self.fallback) {
            addresses.push(self.fallback);
        }

        info!("{} is relaying for {:?}, dialling back", via, credentials.peering);
        let registry = self.registry.clone();
        let peering = credentials.peering.clone();
        let spawned = thread::Builder::new()
            .name("tether-relay-dial".to_string())
            .spawn(move || dial_back(&registry, &peering, &addresses));
        if let Err(e) = spawned {
            warn!("Failed to start dial-back thread: {}", e);
            return Response::new(Status::Failed);
        }

        Response::new(Status::Success).with_parameter("remote", credentials.remote_peering.to_hex())
    }
}

fn dial_back(registry: &Registry, peering: &Identifier, addresses: &[SocketAddr]) {
    let timeout = registry.config().connect_timeout;
    for address in addresses {
        match TcpStream::connect_timeout(address, timeout) {
            Ok(stream) => {
                match registry.establish(stream, peering) {
                    Ok(id) => info!("Relayed session with {} established via {}", id, address),
                    Err(e) => warn!("Relayed handshake via {} failed: {}", address, e),
                }
                return;
            }
            Err(e) => debug!("Dial-back to {} failed: {}", address, e),
        }
    }
    warn!("No relay address reachable for {:?}", peering);
}
