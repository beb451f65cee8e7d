//! Connection handler.
//!
//! One thread per connection runs the handshake, then reads and dispatches
//! frames until the connection ends. Its companion sender thread owns the
//! write half. The registry only ever sees a [`HandlerHandle`]: the queue
//! into the sender, the connection's request table, and a socket clone to
//! close it with.

use crate::error::{Error, Result};
use crate::handshake::{Credentials, Handshake, Session};
use crate::identifier::Identifier;
use crate::multiplexer::{Dispatcher, RequestTable};
use crate::registry::Registry;
use crate::relay::{self, DiscoveryResponder};
use crate::request::Request;
use crate::sender::{Sender, SenderQueue};
use crate::stream::Transport;
use crossbeam_channel::Sender as Notify;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info, warn};

/// Which side of the handshake this connection plays
pub(crate) enum Role {
    /// Dialled out for a known peering
    Initiator(Credentials),
    /// Accepted; the hello decides the peering
    Acceptor,
}

/// The registry's view of a live, authenticated connection
pub(crate) struct HandlerHandle {
    identifier: Identifier,
    remote_addr: SocketAddr,
    requests: RequestTable,
    queue: Arc<SenderQueue>,
    socket: TcpStream,
    closed: AtomicBool,
}

impl HandlerHandle {
    pub(crate) fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub(crate) fn queue(&self) -> &Arc<SenderQueue> {
        &self.queue
    }

    /// Track `request` on this connection; false once the connection is
    /// tearing down
    pub(crate) fn add_request(&self, request: &Arc<Request>) -> bool {
        let mut table = self.requests.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        request.add_pending(&self.identifier);
        table.insert(request.id(), Arc::clone(request));
        true
    }

    pub(crate) fn remove_request(&self, id: u32) -> Option<Arc<Request>> {
        self.requests.lock().remove(&id)
    }

    fn mark_closed(&self) {
        let _table = self.requests.lock();
        self.closed.store(true, Ordering::Release);
    }

    /// Stop reading; the handler thread then tears the connection down
    pub(crate) fn close(&self) {
        debug!("Closing connection to {} ({})", self.identifier, self.remote_addr);
        let _ = self.socket.shutdown(Shutdown::Read);
    }
}

/// Start a connection thread
///
/// `notify`, if given, receives the handshake outcome.
pub(crate) fn spawn(
    registry: Registry,
    stream: TcpStream,
    role: Role,
    notify: Option<Notify<Result<Identifier>>>,
) -> Result<()> {
    thread::Builder::new()
        .name("tether-handler".to_string())
        .spawn(move || run(&registry, stream, role, notify))?;
    Ok(())
}

fn report(notify: &mut Option<Notify<Result<Identifier>>>, result: Result<Identifier>) {
    if let Some(notify) = notify.take() {
        let _ = notify.send(result);
    }
}

fn run(
    registry: &Registry,
    stream: TcpStream,
    role: Role,
    mut notify: Option<Notify<Result<Identifier>>>,
) {
    let mut transport = match Transport::new(stream) {
        Ok(transport) => transport,
        Err(e) => {
            warn!("Failed to set up connection: {}", e);
            report(&mut notify, Err(e));
            return;
        }
    };
    let remote_addr = transport.remote_addr();

    let session = match handshake(registry, &mut transport, role) {
        Ok(Some(session)) => session,
        Ok(None) => {
            debug!("Connection from {} ended as a relay", remote_addr);
            report(&mut notify, Err(Error::rendezvous("connection was relayed")));
            return;
        }
        Err(e) => {
            warn!("Handshake with {} failed: {}", remote_addr, e);
            transport.shutdown();
            report(&mut notify, Err(e));
            return;
        }
    };

    if let Some(address) = session.observed_address {
        registry.note_observed_address(address);
    }
    serve(registry, transport, session, notify);
}

/// Run the handshake; `Ok(None)` means the socket went to a relay splice
fn handshake(
    registry: &Registry,
    transport: &mut Transport,
    role: Role,
) -> Result<Option<Session>> {
    let config = registry.config();
    let mut handshake = Handshake::new(transport, config)?;

    match role {
        Role::Initiator(credentials) => handshake.initiate(credentials).map(Some),
        Role::Acceptor => {
            let hello = handshake.read_hello()?;
            match registry.credentials(&hello.peering) {
                Some((credentials, _)) => handshake.accept(credentials, hello).map(Some),
                None if config.rendezvous.enabled => {
                    drop(handshake);
                    relay::rendezvous(registry, transport, &hello)?;
                    Ok(None)
                }
                None => Err(Error::authentication("unknown peering")),
            }
        }
    }
}

fn serve(
    registry: &Registry,
    transport: Transport,
    mut session: Session,
    mut notify: Option<Notify<Result<Identifier>>>,
) {
    let identifier = session.identifier();
    let remote_addr = transport.remote_addr();
    let (mut reader, writer, socket) = transport.into_parts();

    let handle_socket = match socket.try_clone() {
        Ok(socket) => socket,
        Err(e) => {
            let _ = socket.shutdown(Shutdown::Both);
            session.close();
            report(&mut notify, Err(e.into()));
            return;
        }
    };
    let queue = SenderQueue::new();
    let requests = RequestTable::default();
    let handle = Arc::new(HandlerHandle {
        identifier: identifier.clone(),
        remote_addr,
        requests: Arc::clone(&requests),
        queue: Arc::clone(&queue),
        socket: handle_socket,
        closed: AtomicBool::new(false),
    });

    if let Err(e) = registry.register_handler(Arc::clone(&handle)) {
        warn!("Refusing second connection for {}: {}", identifier, e);
        let _ = socket.shutdown(Shutdown::Both);
        session.close();
        report(&mut notify, Err(e));
        return;
    }

    let sender = match Sender::spawn(
        writer,
        Arc::clone(&queue),
        registry.config().chunk_size,
        &identifier,
    ) {
        Ok(sender) => sender,
        Err(e) => {
            registry.unregister_handler(&handle);
            let _ = socket.shutdown(Shutdown::Both);
            session.close();
            report(&mut notify, Err(e));
            return;
        }
    };

    let listener = registry.listener_for(&session.credentials.peering);
    let mut dispatcher = Dispatcher::new(identifier.clone(), requests, listener, queue)
        .with_discovery(Box::new(DiscoveryResponder::new(registry.clone(), remote_addr)));

    info!("Session with {} established ({})", identifier, remote_addr);
    session.enter_main_loop();
    report(&mut notify, Ok(identifier.clone()));

    let outcome = loop {
        match reader.read_frame() {
            Ok(Some(frame)) => {
                if let Err(e) = dispatcher.dispatch(frame, &mut reader) {
                    break Err(e);
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    match outcome {
        Ok(()) => info!("Session with {} closed", identifier),
        Err(e) => warn!("Session with {} failed: {}", identifier, e),
    }

    handle.mark_closed();
    sender.shutdown();
    dispatcher.teardown();
    registry.unregister_handler(&handle);
    let _ = socket.shutdown(Shutdown::Both);
    session.close();
}
