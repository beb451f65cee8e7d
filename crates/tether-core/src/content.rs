//! Inbound response bodies.
//!
//! A streamed response body arrives as a sequence of `D` frames on one
//! channel. The connection's reader thread pushes each chunk into a
//! [`ContentSink`]; the application reads the matching [`Content`] as an
//! ordinary [`Read`] source from any thread.

use crate::request::Status;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

enum Chunk {
    Data(Vec<u8>),
    End,
    Failed(Status),
}

/// Create a connected sink/reader pair
#[must_use]
pub fn content_channel() -> (ContentSink, Content) {
    let (tx, rx) = unbounded();
    let dropped = Arc::new(AtomicBool::new(false));
    (
        ContentSink {
            tx,
            dropped: Arc::clone(&dropped),
        },
        Content {
            rx,
            current: Vec::new(),
            pos: 0,
            outcome: None,
            dropped,
        },
    )
}

/// Writing end, owned by the connection handler
pub struct ContentSink {
    tx: Sender<Chunk>,
    dropped: Arc<AtomicBool>,
}

impl ContentSink {
    /// Deliver one chunk; returns false once the reader has been dropped
    pub fn push(&self, data: Vec<u8>) -> bool {
        if self.is_abandoned() {
            return false;
        }
        data.is_empty() || self.tx.send(Chunk::Data(data)).is_ok()
    }

    /// End the body cleanly
    pub fn finish(self) {
        let _ = self.tx.send(Chunk::End);
    }

    /// End the body with an error status
    pub fn fail(self, status: Status) {
        let _ = self.tx.send(Chunk::Failed(status));
    }

    /// True if nobody is reading any more
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

/// Reading end of a streamed response body
pub struct Content {
    rx: Receiver<Chunk>,
    current: Vec<u8>,
    pos: usize,
    outcome: Option<Result<(), Status>>,
    dropped: Arc<AtomicBool>,
}

impl Drop for Content {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::Release);
    }
}

impl Content {
    fn failure(status: Status) -> io::Error {
        // Not ErrorKind::Interrupted: std read loops retry on that kind
        let kind = match status {
            Status::Interrupted => io::ErrorKind::ConnectionAborted,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, format!("transfer ended with status {status}"))
    }
}

impl Read for Content {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.current.len() {
                let n = (self.current.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }

            match self.outcome {
                Some(Ok(())) => return Ok(0),
                Some(Err(status)) => return Err(Self::failure(status)),
                None => {}
            }

            match self.rx.recv() {
                Ok(Chunk::Data(data)) => {
                    self.current = data;
                    self.pos = 0;
                }
                Ok(Chunk::End) => self.outcome = Some(Ok(())),
                Ok(Chunk::Failed(status)) => self.outcome = Some(Err(status)),
                // The connection went away without closing the channel
                Err(_) => self.outcome = Some(Err(Status::Interrupted)),
            }
        }
    }
}
