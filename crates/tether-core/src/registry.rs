//! Process-wide connection registry.
//!
//! The [`Registry`] owns everything connections share: registered peerings
//! and their secrets, the live handler of every authenticated peer, the
//! addresses peers observed us at, and the rendezvous meeting-point table.
//! All of it sits behind one lock; no critical section performs socket I/O
//! or waits on another object.
//!
//! A `Registry` is a cheap handle: clone it into every thread that needs it.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handler::{self, HandlerHandle, Role};
use crate::handshake::Credentials;
use crate::identifier::Identifier;
use crate::listener::{AddressProvider, Listener};
use crate::message::Message;
use crate::relay::MeetingPoint;
use crate::request::Request;
use crossbeam_channel::{RecvTimeoutError, bounded};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Slack granted on top of the handshake timeout when waiting for a
/// connection thread to report back
const ESTABLISH_GRACE: Duration = Duration::from_secs(1);

struct PeeringEntry {
    remote_peering: Identifier,
    secret: Zeroizing<Vec<u8>>,
    listener: Option<Arc<dyn Listener>>,
}

#[derive(Default)]
pub(crate) struct State {
    peerings: HashMap<Identifier, PeeringEntry>,
    handlers: HashMap<Identifier, Arc<HandlerHandle>>,
    known_addresses: HashMap<IpAddr, usize>,
    pub(crate) meeting_points: HashMap<Identifier, MeetingPoint>,
    address_provider: Option<Arc<dyn AddressProvider>>,
    local_addr: Option<SocketAddr>,
}

struct Inner {
    config: Config,
    state: Mutex<State>,
    meeting_changed: Condvar,
    next_request_id: AtomicU32,
    shutdown: AtomicBool,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

/// Handle on the connection engine
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Create a registry
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                meeting_changed: Condvar::new(),
                next_request_id: AtomicU32::new(1),
                shutdown: AtomicBool::new(false),
                acceptor: Mutex::new(None),
            }),
        })
    }

    /// Install the source of this node's external addresses
    #[must_use]
    pub fn with_address_provider(self, provider: Arc<dyn AddressProvider>) -> Self {
        self.inner.state.lock().address_provider = Some(provider);
        self
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Instance name advertised to peers
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.inner.config.instance_name
    }

    pub(crate) fn state(&self) -> &Mutex<State> {
        &self.inner.state
    }

    pub(crate) fn meeting_changed(&self) -> &Condvar {
        &self.inner.meeting_changed
    }

    // Peerings

    /// Register a relationship so connections for it can authenticate
    ///
    /// Replaces any earlier registration under the same id.
    pub fn register_peering(
        &self,
        peering: Identifier,
        remote_peering: Identifier,
        secret: impl Into<Vec<u8>>,
        listener: Option<Arc<dyn Listener>>,
    ) {
        debug!("Registering peering {:?}", peering);
        self.inner.state.lock().peerings.insert(
            peering.peering(),
            PeeringEntry {
                remote_peering: remote_peering.peering(),
                secret: Zeroizing::new(secret.into()),
                listener,
            },
        );
    }

    /// Forget a relationship; live connections for it stay up
    pub fn unregister_peering(&self, peering: &Identifier) -> bool {
        self.inner
            .state
            .lock()
            .peerings
            .remove(&peering.peering())
            .is_some()
    }

    /// True if `peering` is registered
    #[must_use]
    pub fn has_registered_peering(&self, peering: &Identifier) -> bool {
        self.inner
            .state
            .lock()
            .peerings
            .contains_key(&peering.peering())
    }

    pub(crate) fn credentials(
        &self,
        peering: &Identifier,
    ) -> Option<(Credentials, Option<Arc<dyn Listener>>)> {
        let key = peering.peering();
        let state = self.inner.state.lock();
        let entry = state.peerings.get(&key)?;
        Some((
            Credentials {
                peering: key,
                remote_peering: entry.remote_peering.clone(),
                secret: entry.secret.clone(),
            },
            entry.listener.clone(),
        ))
    }

    pub(crate) fn listener_for(&self, peering: &Identifier) -> Option<Arc<dyn Listener>> {
        self.inner
            .state
            .lock()
            .peerings
            .get(&peering.peering())
            .and_then(|entry| entry.listener.clone())
    }

    // Connections

    /// Authenticate an outbound connection for `peering`
    ///
    /// Blocks until the handshake finished. On success the connection keeps
    /// running on its own threads and the registered identifier is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPeering`] if `peering` is not registered, and
    /// otherwise the error that ended the handshake.
    pub fn establish(&self, stream: TcpStream, peering: &Identifier) -> Result<Identifier> {
        let (credentials, _) = self
            .credentials(peering)
            .ok_or_else(|| Error::UnknownPeering(peering.peering()))?;

        let (tx, rx) = bounded(1);
        handler::spawn(self.clone(), stream, Role::Initiator(credentials), Some(tx))?;

        match rx.recv_timeout(self.inner.config.handshake_timeout + ESTABLISH_GRACE) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::protocol("connection thread exited without a result"))
            }
        }
    }

    /// Like [`Registry::establish`], returning only whether it succeeded
    pub fn connect_peer(&self, stream: TcpStream, peering: &Identifier) -> bool {
        match self.establish(stream, peering) {
            Ok(_) => true,
            Err(e) => {
                warn!("Connection for {:?} failed: {}", peering, e);
                false
            }
        }
    }

    /// Serve an inbound connection on a new thread
    ///
    /// # Errors
    ///
    /// Returns a network error if the connection thread cannot start.
    pub fn accept(&self, stream: TcpStream) -> Result<()> {
        handler::spawn(self.clone(), stream, Role::Acceptor, None)
    }

    /// Accept connections on `addr` until [`Registry::shutdown`]
    ///
    /// # Errors
    ///
    /// Returns a network error if the address cannot be bound.
    pub fn listen(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        self.inner.state.lock().local_addr = Some(local_addr);
        info!("Listening on {}", local_addr);

        let registry = self.clone();
        let handle = thread::Builder::new()
            .name("tether-listener".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    if registry.inner.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            if let Err(e) = registry.accept(stream) {
                                warn!("Failed to serve inbound connection: {}", e);
                            }
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }
                debug!("Listener on {} stopped", local_addr);
            })?;

        *self.inner.acceptor.lock() = Some(handle);
        Ok(local_addr)
    }

    /// Port the registry listens on, if any
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        self.inner.state.lock().local_addr.map(|a| a.port())
    }

    pub(crate) fn register_handler(&self, handle: Arc<HandlerHandle>) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.handlers.entry(handle.identifier().clone()) {
            Entry::Occupied(entry) => Err(Error::AlreadyConnected(entry.key().clone())),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    pub(crate) fn unregister_handler(&self, handle: &Arc<HandlerHandle>) {
        let mut state = self.inner.state.lock();
        if let Entry::Occupied(entry) = state.handlers.entry(handle.identifier().clone()) {
            if Arc::ptr_eq(entry.get(), handle) {
                entry.remove();
            }
        }
    }

    fn matching_handlers(&self, peer: Option<&Identifier>) -> Vec<Arc<HandlerHandle>> {
        self.inner
            .state
            .lock()
            .handlers
            .iter()
            .filter(|(id, _)| peer.is_none_or(|peer| peer.matches(id)))
            .map(|(_, handle)| Arc::clone(handle))
            .collect()
    }

    /// True if an authenticated connection matches `peer`
    #[must_use]
    pub fn has_peer(&self, peer: &Identifier) -> bool {
        self.inner
            .state
            .lock()
            .handlers
            .keys()
            .any(|id| peer.matches(id))
    }

    /// Identifiers of every authenticated connection
    #[must_use]
    pub fn connected_peers(&self) -> Vec<Identifier> {
        let mut peers: Vec<_> = self.inner.state.lock().handlers.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Close every connection matching `peer`; returns whether any did
    pub fn disconnect(&self, peer: &Identifier) -> bool {
        let handlers = self.matching_handlers(Some(peer));
        for handle in &handlers {
            handle.close();
        }
        !handlers.is_empty()
    }

    // Traffic

    /// Queue `message` on every connection matching its receiver
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if no connection matches.
    pub fn send_message(&self, message: Message) -> Result<()> {
        let handlers = self.matching_handlers(Some(message.receiver()));
        let Some((last, rest)) = handlers.split_last() else {
            return Err(Error::NotConnected(message.receiver().clone()));
        };
        for handle in rest {
            handle.queue().push_message(message.clone());
        }
        last.queue().push_message(message);
        Ok(())
    }

    /// Assign `request` an id and queue it on its receiver's connections,
    /// or on every connection if it has no receiver
    ///
    /// A broadcast with no connection at all completes immediately with no
    /// responses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the request names a receiver and
    /// no connection matches it.
    pub fn submit_request(&self, request: Arc<Request>) -> Result<u32> {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        request.set_id(id);

        let handlers = self.matching_handlers(request.receiver());
        if handlers.is_empty() {
            if let Some(receiver) = request.receiver() {
                return Err(Error::NotConnected(receiver.clone()));
            }
        }

        for handle in handlers {
            if handle.add_request(&request) {
                handle.queue().push_request(Arc::clone(&request));
            }
        }
        debug!("Submitted request {} for {:?}", id, request.target());
        Ok(id)
    }

    /// Stop waiting for request `id`; returns whether any connection
    /// carried it
    pub fn cancel_request(&self, id: u32) -> bool {
        let mut found = false;
        for handle in self.matching_handlers(None) {
            if let Some(request) = handle.remove_request(id) {
                request.clear_pending(handle.identifier());
                request.cancel();
                found = true;
            }
        }
        found
    }

    // Addresses

    pub(crate) fn note_observed_address(&self, address: IpAddr) {
        if address.is_loopback() || address.is_unspecified() {
            return;
        }
        *self
            .inner
            .state
            .lock()
            .known_addresses
            .entry(address)
            .or_insert(0) += 1;
    }

    /// Addresses peers reported seeing us at, most reported first, paired
    /// with the listening port
    #[must_use]
    pub fn known_public_addresses(&self) -> Vec<SocketAddr> {
        let state = self.inner.state.lock();
        let Some(port) = state.local_addr.map(|a| a.port()) else {
            return Vec::new();
        };

        let mut counted: Vec<_> = state.known_addresses.iter().collect();
        counted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        counted
            .into_iter()
            .map(|(ip, _)| SocketAddr::new(*ip, port))
            .collect()
    }

    /// Everything advertised to relay responders: provider addresses first,
    /// then known public addresses, then the listening address itself
    pub(crate) fn advertised_addresses(&self) -> Vec<SocketAddr> {
        let (provider, local) = {
            let state = self.inner.state.lock();
            (state.address_provider.clone(), state.local_addr)
        };

        let mut addresses = provider
            .map(|p| p.external_addresses())
            .unwrap_or_default();
        addresses.extend(self.known_public_addresses());
        if let Some(local) = local.filter(|a| !a.ip().is_unspecified()) {
            addresses.push(local);
        }

        let mut seen = std::collections::HashSet::new();
        addresses.retain(|a| seen.insert(*a));
        addresses
    }

    // Lifecycle

    /// True once [`Registry::shutdown`] was called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop listening and close every connection
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down registry");

        let local_addr = self.inner.state.lock().local_addr;
        if let Some(handle) = self.inner.acceptor.lock().take() {
            // Wake the blocking accept so the listener sees the flag
            if let Some(addr) = local_addr {
                let wake = if addr.ip().is_unspecified() {
                    SocketAddr::new(IpAddr::from([127, 0, 0, 1]), addr.port())
                } else {
                    addr
                };
                let _ = TcpStream::connect_timeout(&wake, Duration::from_secs(1));
            }
            if handle.join().is_err() {
                warn!("Listener thread panicked");
            }
        }

        for handle in self.matching_handlers(None) {
            handle.close();
        }
        self.inner.state.lock().meeting_points.clear();
        self.inner.meeting_changed.notify_all();
    }
}
