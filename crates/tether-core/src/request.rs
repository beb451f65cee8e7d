//! Requests, responses and status codes.
//!
//! A [`Request`] is created by the application, submitted through the
//! registry and may be carried by several connections at once (broadcast).
//! Each carrying connection adds one to the request's pending count for its
//! peer and removes it again when the peer's final response arrives or the
//! connection dies, so [`Request::wait`] always returns.

use crate::error::{Error, Result};
use crate::frame::Parameters;
use crate::identifier::Identifier;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Response status, carried on the wire as a signed integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The request was served
    Success,
    /// More responses for the same request follow
    Pending,
    /// Generic failure
    Failed,
    /// The target does not exist
    NotFound,
    /// The target exists but has nothing to return
    Empty,
    /// The transfer was cut short by a connection teardown
    Interrupted,
    /// The sending side failed to read the content source
    ReadFailed,
}

impl Status {
    /// Wire code
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Pending => 1,
            Status::Failed => -1,
            Status::NotFound => -2,
            Status::Empty => -3,
            Status::Interrupted => -4,
            Status::ReadFailed => -5,
        }
    }

    /// Decode a wire code
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Status::Success,
            1 => Status::Pending,
            -1 => Status::Failed,
            -2 => Status::NotFound,
            -3 => Status::Empty,
            -4 => Status::Interrupted,
            -5 => Status::ReadFailed,
            _ => return None,
        })
    }

    /// True for every status below zero
    #[must_use]
    pub fn is_error(self) -> bool {
        self.code() < 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<i32>()
            .ok()
            .and_then(Status::from_code)
            .ok_or_else(|| Error::Protocol(format!("unknown status code {s:?}").into()))
    }
}

/// One reply to a request
pub struct Response {
    status: Mutex<Status>,
    parameters: Parameters,
    peer: Option<Identifier>,
    content: Mutex<Option<Box<dyn Read + Send>>>,
}

impl Response {
    /// Create a response without parameters or content
    #[must_use]
    pub fn new(status: Status) -> Self {
        Self {
            status: Mutex::new(status),
            parameters: Parameters::new(),
            peer: None,
            content: Mutex::new(None),
        }
    }

    pub(crate) fn incoming(
        status: Status,
        parameters: Parameters,
        peer: Identifier,
        content: Option<Box<dyn Read + Send>>,
    ) -> Self {
        Self {
            status: Mutex::new(status),
            parameters,
            peer: Some(peer),
            content: Mutex::new(content),
        }
    }

    /// Add a parameter
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Attach a body, streamed to the requester over a channel
    #[must_use]
    pub fn with_content(self, content: impl Read + Send + 'static) -> Self {
        *self.content.lock() = Some(Box::new(content));
        self
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: Status) {
        *self.status.lock() = status;
    }

    /// Response parameters
    #[must_use]
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Look up one parameter
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Peer the response came from (inbound responses only)
    #[must_use]
    pub fn peer(&self) -> Option<&Identifier> {
        self.peer.as_ref()
    }

    /// True if a body is attached and not yet taken
    #[must_use]
    pub fn has_content(&self) -> bool {
        self.content.lock().is_some()
    }

    /// Take the body; later calls return `None`
    #[must_use]
    pub fn take_content(&self) -> Option<Box<dyn Read + Send>> {
        self.content.lock().take()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status())
            .field("parameters", &self.parameters)
            .field("peer", &self.peer)
            .field("has_content", &self.has_content())
            .finish()
    }
}

#[derive(Default)]
struct RequestState {
    responses: Vec<Arc<Response>>,
    pending: HashMap<Identifier, usize>,
    cancelled: bool,
}

/// One application operation addressed to a peer, or to every peer
pub struct Request {
    id: AtomicU32,
    target: String,
    is_data: bool,
    parameters: Parameters,
    receiver: Option<Identifier>,
    state: Mutex<RequestState>,
    cond: Condvar,
}

impl Request {
    /// Create a request for `target`; `is_data` selects `G` over `I`
    #[must_use]
    pub fn new(target: impl Into<String>, is_data: bool) -> Self {
        Self {
            id: AtomicU32::new(0),
            target: target.into(),
            is_data,
            parameters: Parameters::new(),
            receiver: None,
            state: Mutex::new(RequestState::default()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn incoming(id: u32, target: String, is_data: bool, parameters: Parameters) -> Self {
        let request = Self {
            parameters,
            ..Self::new(target, is_data)
        };
        request.set_id(id);
        request
    }

    /// Add a parameter
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Address the request to one peer instead of broadcasting it
    #[must_use]
    pub fn with_receiver(mut self, receiver: Identifier) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Id assigned on submission (0 before)
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Release);
    }

    /// Target string
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// True for data requests (`G`)
    #[must_use]
    pub fn is_data(&self) -> bool {
        self.is_data
    }

    /// Request parameters
    #[must_use]
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Look up one parameter
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Intended receiver, `None` for a broadcast
    #[must_use]
    pub fn receiver(&self) -> Option<&Identifier> {
        self.receiver.as_ref()
    }

    /// Responses received so far, in arrival order
    #[must_use]
    pub fn responses(&self) -> Vec<Arc<Response>> {
        self.state.lock().responses.clone()
    }

    /// True while some connection still owes a final response
    #[must_use]
    pub fn is_pending(&self) -> bool {
        let state = self.state.lock();
        !state.cancelled && !state.pending.is_empty()
    }

    /// True once cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Block until nothing is pending or the request is cancelled
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while !state.cancelled && !state.pending.is_empty() {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return state.cancelled || state.pending.is_empty();
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        true
    }

    /// Block until more than `seen` responses arrived, nothing is pending,
    /// or `deadline` passes; returns the number of responses
    pub fn wait_responses(&self, seen: usize, deadline: Instant) -> usize {
        let mut state = self.state.lock();
        while state.responses.len() <= seen && !state.cancelled && !state.pending.is_empty() {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.responses.len()
    }

    pub(crate) fn add_pending(&self, peer: &Identifier) {
        *self.state.lock().pending.entry(peer.clone()).or_insert(0) += 1;
    }

    pub(crate) fn remove_pending(&self, peer: &Identifier) {
        let mut state = self.state.lock();
        if let Some(count) = state.pending.get_mut(peer) {
            *count -= 1;
            if *count == 0 {
                state.pending.remove(peer);
            }
        }
        drop(state);
        self.cond.notify_all();
    }

    pub(crate) fn clear_pending(&self, peer: &Identifier) {
        self.state.lock().pending.remove(peer);
        self.cond.notify_all();
    }

    pub(crate) fn add_response(&self, response: Arc<Response>) {
        self.state.lock().responses.push(response);
        self.cond.notify_all();
    }

    pub(crate) fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.cond.notify_all();
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id())
            .field("target", &self.target)
            .field("is_data", &self.is_data)
            .field("receiver", &self.receiver)
            .finish_non_exhaustive()
    }
}
