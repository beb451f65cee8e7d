//! Session handshake.
//!
//! ```text
//! Initiator                                   Acceptor
//!     |  H <remote-peering> nonce=Na ...  ------>|  resolve peering
//!     |<------  H <peering> nonce=Nb address=..  |
//!     |  A <hash> salt=Sa  ---------------------->|
//!     |<---------------------  A <hash> salt=Sb  |
//!     |        verify, derive keys, swap ciphers |
//! ```
//!
//! Both sides send their `A` frame before reading the peer's, so neither
//! waits on the other. Each side proves knowledge of the shared secret with
//! `hash = D(secret ‖ salt ‖ peer-nonce ‖ local-peering, R)` and derives its
//! send key as `D(secret ‖ salt ‖ peer-nonce ‖ local ‖ remote ‖ local-nonce, R)`.
//! The receive key is the peer's send key, computed from the peer's side.
//!
//! The hello exchange runs under the obfuscation cipher with an unbuffered
//! reader; the whole handshake is bounded by the configured timeout.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::{Command, Frame};
use crate::identifier::Identifier;
use crate::stream::Transport;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::time::Instant;
use tether_crypto::constant_time::ct_eq;
use tether_crypto::random::random_16;
use tether_crypto::{CipherKey, DIGEST_ROUNDS, Digest, NONCE_SIZE, SALT_SIZE, Sha512};
use tracing::debug;
use zeroize::Zeroizing;

/// Authentication method advertised in `A` frames
pub const AUTH_METHOD: &str = "DIGEST";

/// Session cipher advertised in `A` frames
pub const AUTH_CIPHER: &str = "AES256";

/// Connection progress
///
/// [`Handshake`] walks `Init` to `Authenticated`; the [`Session`] it yields
/// carries the state on through `MainLoop`. Any error moves to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket connected, nothing installed
    Init,
    /// Obfuscation cipher installed
    ObfuscationReady,
    /// Both hello frames exchanged
    HelloExchanged,
    /// Both authentication frames exchanged
    AuthExchanged,
    /// Peer proved the secret, session keys installed
    Authenticated,
    /// Serving traffic
    MainLoop,
    /// Terminal state
    Closed,
}

/// What a node knows about one peering
#[derive(Clone)]
pub struct Credentials {
    /// Id the relationship is registered under locally
    pub peering: Identifier,
    /// Id the peer registers it under
    pub remote_peering: Identifier,
    /// Shared secret
    pub secret: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("peering", &self.peering)
            .field("remote_peering", &self.remote_peering)
            .finish_non_exhaustive()
    }
}

/// A decoded `H` frame
#[derive(Debug, Clone)]
pub struct Hello {
    /// Peering the sender asks for
    pub peering: Identifier,
    /// Sender's handshake nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Sender's instance name
    pub instance: Option<String>,
    /// Address at which the sender observed us, if reported
    pub address: Option<IpAddr>,
    /// Sender's application name
    pub application: String,
    /// Sender's protocol version
    pub version: String,
}

impl Hello {
    fn from_frame(frame: &Frame) -> Result<Self> {
        let peering: Identifier = frame.parse_arg(0)?;
        let nonce = decode_fixed::<NONCE_SIZE>(frame.require_header("nonce")?, "nonce")?;
        let address = match frame.header_value("address") {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| Error::protocol("hello carries an invalid address"))?,
            ),
            None => None,
        };

        Ok(Self {
            peering: peering.peering(),
            nonce,
            instance: frame
                .header_value("instance")
                .filter(|i| !i.is_empty())
                .map(str::to_owned),
            address,
            application: frame.require_header("application")?.to_owned(),
            version: frame.require_header("version")?.to_owned(),
        })
    }
}

/// Result of a completed handshake
#[derive(Debug)]
pub struct Session {
    /// Credentials the peer proved
    pub credentials: Credentials,
    /// Peer's instance name
    pub remote_instance: Option<String>,
    /// Address at which the peer observed us
    pub observed_address: Option<IpAddr>,
    state: SessionState,
}

impl Session {
    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The connection starts serving traffic
    pub fn enter_main_loop(&mut self) {
        self.transition(SessionState::MainLoop);
    }

    /// The connection is gone
    pub fn close(&mut self) {
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("Session {}: {:?} -> {:?}", self.identifier(), self.state, next);
            self.state = next;
        }
    }

    /// Identifier the connection registers under
    #[must_use]
    pub fn identifier(&self) -> Identifier {
        let peering = self.credentials.peering.peering();
        match &self.remote_instance {
            Some(instance) => peering.with_instance(instance.clone()),
            None => peering,
        }
    }
}

/// `D(secret ‖ salt ‖ peer-nonce ‖ local-peering, R)`
#[must_use]
pub fn auth_hash(
    secret: &[u8],
    salt: &[u8; SALT_SIZE],
    peer_nonce: &[u8; NONCE_SIZE],
    local_peering: &Identifier,
) -> Vec<u8> {
    let mut aggregate = Zeroizing::new(Vec::with_capacity(secret.len() + 96));
    aggregate.extend_from_slice(secret);
    aggregate.extend_from_slice(salt);
    aggregate.extend_from_slice(peer_nonce);
    aggregate.extend_from_slice(local_peering.digest());
    Sha512::digest_rounds(&aggregate, DIGEST_ROUNDS)
}

/// `D(secret ‖ salt ‖ peer-nonce ‖ local ‖ remote ‖ local-nonce, R)`, split
/// into key and IV
///
/// # Errors
///
/// Returns a crypto error if the digest is too short to hold key and IV.
pub fn session_key(
    secret: &[u8],
    salt: &[u8; SALT_SIZE],
    peer_nonce: &[u8; NONCE_SIZE],
    local: &Identifier,
    remote: &Identifier,
    local_nonce: &[u8; NONCE_SIZE],
) -> Result<CipherKey> {
    let mut aggregate = Zeroizing::new(Vec::with_capacity(secret.len() + 176));
    aggregate.extend_from_slice(secret);
    aggregate.extend_from_slice(salt);
    aggregate.extend_from_slice(peer_nonce);
    aggregate.extend_from_slice(local.digest());
    aggregate.extend_from_slice(remote.digest());
    aggregate.extend_from_slice(local_nonce);
    let material = Zeroizing::new(Sha512::digest_rounds(&aggregate, DIGEST_ROUNDS));
    Ok(CipherKey::from_digest(&material)?)
}

fn decode_fixed<const N: usize>(raw: &str, what: &'static str) -> Result<[u8; N]> {
    hex::decode(raw)
        .ok()
        .and_then(|bytes| <[u8; N]>::try_from(bytes.as_slice()).ok())
        .ok_or_else(|| Error::Protocol(format!("invalid {what}").into()))
}

/// One side of a handshake in progress
pub struct Handshake<'a> {
    transport: &'a mut Transport,
    config: &'a Config,
    deadline: Instant,
    nonce: [u8; NONCE_SIZE],
    state: SessionState,
}

impl<'a> Handshake<'a> {
    /// Start a handshake on a freshly wrapped transport
    ///
    /// # Errors
    ///
    /// Returns a crypto error if no nonce can be generated.
    pub fn new(transport: &'a mut Transport, config: &'a Config) -> Result<Self> {
        let mut handshake = Self {
            transport,
            config,
            deadline: Instant::now() + config.handshake_timeout,
            nonce: random_16()?,
            state: SessionState::Init,
        };
        handshake.transition(SessionState::ObfuscationReady);
        Ok(handshake)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            "Handshake with {}: {:?} -> {:?}",
            self.transport.remote_addr(),
            self.state,
            next
        );
        self.state = next;
    }

    fn close_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.transition(SessionState::Closed);
        }
        result
    }

    fn read_frame(&mut self, expected: Command) -> Result<Frame> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout);
        }
        self.transport.set_read_timeout(Some(remaining))?;

        match self.transport.reader.read_frame() {
            Ok(Some(frame)) if frame.command() == expected => Ok(frame),
            Ok(Some(frame)) => Err(Error::Protocol(
                format!("expected {expected} frame, got {}", frame.command()).into(),
            )),
            Ok(None) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            )
            .into()),
            Err(Error::Network(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                Err(Error::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    fn send_hello(&mut self, peering: &Identifier, observed: Option<IpAddr>) -> Result<()> {
        let mut frame = Frame::new(Command::Hello)
            .arg(peering.to_hex())
            .header("application", self.config.application.as_str())
            .header("version", self.config.version.as_str())
            .header("nonce", hex::encode(self.nonce))
            .header("instance", self.config.instance_name.as_str());
        if let Some(address) = observed {
            frame = frame.header("address", address.to_string());
        }
        self.transport.writer.write_frame(&frame)
    }

    /// Read the peer's hello (acceptor side)
    ///
    /// # Errors
    ///
    /// Returns a protocol error for a malformed hello or a foreign
    /// application, and a timeout or network error if none arrives.
    pub fn read_hello(&mut self) -> Result<Hello> {
        let result = self.receive_hello();
        self.close_on_error(result)
    }

    fn receive_hello(&mut self) -> Result<Hello> {
        let frame = self.read_frame(Command::Hello)?;
        let hello = Hello::from_frame(&frame)?;
        if hello.application != self.config.application {
            return Err(Error::Protocol(
                format!("foreign application {:?}", hello.application).into(),
            ));
        }
        debug!(
            "Hello for {:?} from {} (version {})",
            hello.peering,
            self.transport.remote_addr(),
            hello.version
        );
        Ok(hello)
    }

    /// Run the initiator side to completion
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationFailed`] if the peer answers for
    /// another peering or fails to prove the secret, and the errors of
    /// [`Handshake::read_hello`].
    pub fn initiate(&mut self, credentials: Credentials) -> Result<Session> {
        let result = self.run_initiator(credentials);
        self.close_on_error(result)
    }

    fn run_initiator(&mut self, credentials: Credentials) -> Result<Session> {
        self.send_hello(&credentials.remote_peering, None)?;
        let hello = self.receive_hello()?;
        if hello.peering.digest() != credentials.peering.digest() {
            return Err(Error::authentication("peer answered for another peering"));
        }
        self.transition(SessionState::HelloExchanged);
        self.authenticate(credentials, hello)
    }

    /// Answer a hello already read with [`Handshake::read_hello`] and
    /// complete the acceptor side
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationFailed`] if the peer fails to prove
    /// the secret.
    pub fn accept(&mut self, credentials: Credentials, hello: Hello) -> Result<Session> {
        let result = self.run_acceptor(credentials, hello);
        self.close_on_error(result)
    }

    fn run_acceptor(&mut self, credentials: Credentials, hello: Hello) -> Result<Session> {
        let observed = self.transport.remote_addr().ip();
        self.send_hello(&credentials.remote_peering, Some(observed))?;
        self.transition(SessionState::HelloExchanged);
        self.authenticate(credentials, hello)
    }

    fn authenticate(&mut self, credentials: Credentials, hello: Hello) -> Result<Session> {
        let secret = credentials.secret.as_slice();
        let salt = random_16()?;
        let hash = auth_hash(secret, &salt, &hello.nonce, &credentials.peering);

        self.transport.writer.write_frame(
            &Frame::new(Command::Auth)
                .arg(hex::encode(&hash))
                .header("method", AUTH_METHOD)
                .header("cipher", AUTH_CIPHER)
                .header("salt", hex::encode(salt)),
        )?;

        let frame = self.read_frame(Command::Auth)?;
        if frame.require_header("method")? != AUTH_METHOD {
            return Err(Error::protocol("unsupported authentication method"));
        }
        if frame.require_header("cipher")? != AUTH_CIPHER {
            return Err(Error::protocol("unsupported cipher"));
        }
        let peer_salt = decode_fixed::<SALT_SIZE>(frame.require_header("salt")?, "salt")?;
        let peer_hash = hex::decode(frame.arg_str(0)?)
            .map_err(|_| Error::protocol("authentication hash is not hex"))?;
        self.transition(SessionState::AuthExchanged);

        let expected = auth_hash(secret, &peer_salt, &self.nonce, &credentials.remote_peering);
        if !ct_eq(&expected, &peer_hash) {
            return Err(Error::authentication("hash mismatch"));
        }

        let send = session_key(
            secret,
            &salt,
            &hello.nonce,
            &credentials.peering,
            &credentials.remote_peering,
            &self.nonce,
        )?;
        let receive = session_key(
            secret,
            &peer_salt,
            &self.nonce,
            &credentials.remote_peering,
            &credentials.peering,
            &hello.nonce,
        )?;

        self.transport.set_read_timeout(None)?;
        self.transport.install_session(&send, &receive);
        self.transition(SessionState::Authenticated);

        Ok(Session {
            credentials,
            remote_instance: hello.instance,
            observed_address: hello.address,
            state: self.state,
        })
    }
}
