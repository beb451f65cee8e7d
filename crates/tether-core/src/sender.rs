//! Outbound multiplexer.
//!
//! Each connection owns one sender thread. Everything the connection emits
//! after authentication (messages, requests, response headers, channel data,
//! stop frames) goes through this worker, so the write half of the socket
//! has a single owner and frames never interleave.
//!
//! A tick performs, in order:
//!
//! 1. stop requests: apply peer cancellations, emit queued `C` frames
//! 2. response headers: open a channel for every response with content
//! 3. at most one message
//! 4. at most one request
//! 5. one chunk per open channel
//!
//! A channel's bookkeeping is dropped on the tick its transfer ends.

use crate::error::Result;
use crate::frame::{Command, Frame, FrameWriter};
use crate::identifier::Identifier;
use crate::message::Message;
use crate::request::{Request, Response, Status};
use crate::stream::WireWriter;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Default)]
struct Queue {
    messages: VecDeque<Message>,
    requests: VecDeque<Arc<Request>>,
    responses: VecDeque<(u32, Vec<Arc<Response>>)>,
    stops: Vec<u32>,
    cancelled: Vec<u32>,
    shutdown: bool,
}

impl Queue {
    fn has_work(&self) -> bool {
        !self.messages.is_empty()
            || !self.requests.is_empty()
            || !self.responses.is_empty()
            || !self.stops.is_empty()
            || !self.cancelled.is_empty()
    }
}

/// Work taken out of the queue for one tick
#[derive(Default)]
struct Work {
    responses: Vec<(u32, Vec<Arc<Response>>)>,
    message: Option<Message>,
    request: Option<Arc<Request>>,
    stops: Vec<u32>,
    cancelled: Vec<u32>,
}

/// Queue shared between a connection's producers and its sender thread
#[derive(Default)]
pub struct SenderQueue {
    queue: Mutex<Queue>,
    cond: Condvar,
}

impl SenderQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, f: impl FnOnce(&mut Queue)) {
        f(&mut *self.queue.lock());
        self.cond.notify_one();
    }

    /// Queue a message
    pub fn push_message(&self, message: Message) {
        self.push(|q| q.messages.push_back(message));
    }

    /// Queue a request header
    pub fn push_request(&self, request: Arc<Request>) {
        self.push(|q| q.requests.push_back(request));
    }

    /// Queue the responses to one inbound request
    pub fn push_responses(&self, request_id: u32, responses: Vec<Arc<Response>>) {
        self.push(|q| q.responses.push_back((request_id, responses)));
    }

    /// Queue a `C` frame asking the peer to stop an inbound channel
    pub fn push_stop(&self, channel: u32) {
        self.push(|q| q.stops.push(channel));
    }

    /// Stop an outbound channel at the peer's request
    pub fn cancel_transfer(&self, channel: u32) {
        self.push(|q| q.cancelled.push(channel));
    }

    /// Ask the sender thread to exit
    pub fn shutdown(&self) {
        self.queue.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// True once shutdown was requested
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.queue.lock().shutdown
    }

    fn take(queue: &mut Queue) -> Work {
        Work {
            responses: queue.responses.drain(..).collect(),
            message: queue.messages.pop_front(),
            request: queue.requests.pop_front(),
            stops: std::mem::take(&mut queue.stops),
            cancelled: std::mem::take(&mut queue.cancelled),
        }
    }

    /// Block until there is work, or return `None` on shutdown
    fn wait_for_work(&self, idle: bool) -> Option<Work> {
        let mut queue = self.queue.lock();
        while idle && !queue.has_work() && !queue.shutdown {
            self.cond.wait(&mut queue);
        }
        if queue.shutdown {
            return None;
        }
        Some(Self::take(&mut queue))
    }
}

struct Transfer {
    response: Arc<Response>,
    source: Box<dyn Read + Send>,
}

/// State owned by the sender thread
pub(crate) struct SenderWorker<W> {
    queue: Arc<SenderQueue>,
    writer: FrameWriter<W>,
    transfers: BTreeMap<u32, Transfer>,
    last_channel: u32,
    buffer: Vec<u8>,
}

impl<W: Write> SenderWorker<W> {
    pub(crate) fn new(queue: Arc<SenderQueue>, writer: FrameWriter<W>, chunk_size: usize) -> Self {
        Self {
            queue,
            writer,
            transfers: BTreeMap::new(),
            last_channel: 0,
            buffer: vec![0u8; chunk_size],
        }
    }

    /// Run until shutdown or a write failure
    ///
    /// Either way, every channel still open on exit is marked interrupted.
    pub(crate) fn run(&mut self) -> Result<()> {
        let result = self.pump();
        self.interrupt_transfers();
        result
    }

    fn pump(&mut self) -> Result<()> {
        loop {
            let idle = self.transfers.is_empty();
            let Some(work) = self.queue.wait_for_work(idle) else {
                return Ok(());
            };
            self.tick(work)?;
        }
    }

    #[cfg(test)]
    pub(crate) fn step(&mut self) -> Result<()> {
        let work = SenderQueue::take(&mut *self.queue.queue.lock());
        self.tick(work)
    }

    fn tick(&mut self, work: Work) -> Result<()> {
        for channel in work.cancelled {
            if let Some(transfer) = self.transfers.remove(&channel) {
                debug!("Channel {} stopped by peer", channel);
                transfer.response.set_status(Status::Interrupted);
            }
        }
        for channel in work.stops {
            self.writer
                .write_frame(&Frame::new(Command::Cancel).arg(channel))?;
        }

        for (request_id, responses) in work.responses {
            self.start_responses(request_id, responses)?;
        }

        if let Some(message) = work.message {
            let frame = Frame::new(Command::Message)
                .arg(message.content().len())
                .headers_from(message.parameters());
            self.writer
                .write_frame_with_payload(&frame, message.content())?;
        }

        if let Some(request) = work.request {
            let command = if request.is_data() {
                Command::Get
            } else {
                Command::Invoke
            };
            let frame = Frame::new(command)
                .arg(request.id())
                .arg(request.target())
                .headers_from(request.parameters());
            self.writer.write_frame(&frame)?;
        }

        self.send_chunks()
    }

    fn start_responses(&mut self, request_id: u32, responses: Vec<Arc<Response>>) -> Result<()> {
        let last = responses.len().saturating_sub(1);

        for (index, response) in responses.iter().enumerate() {
            let channel = match response.take_content() {
                Some(source) => {
                    self.last_channel += 1;
                    self.transfers.insert(
                        self.last_channel,
                        Transfer {
                            response: Arc::clone(response),
                            source,
                        },
                    );
                    self.last_channel
                }
                None => 0,
            };

            // The last response always completes the request
            let status = match response.status() {
                _ if index < last => Status::Pending,
                Status::Pending => Status::Success,
                status => status,
            };
            let frame = Frame::new(Command::Response)
                .arg(request_id)
                .arg(status)
                .arg(channel)
                .headers_from(response.parameters());
            self.writer.write_frame(&frame)?;
        }
        Ok(())
    }

    fn send_chunks(&mut self) -> Result<()> {
        let mut finished = Vec::new();

        for (&channel, transfer) in &mut self.transfers {
            match read_chunk(&mut transfer.source, &mut self.buffer) {
                Ok(0) => {
                    self.writer
                        .write_frame(&Frame::new(Command::Data).arg(channel).arg(0))?;
                    finished.push(channel);
                }
                Ok(n) => {
                    let frame = Frame::new(Command::Data).arg(channel).arg(n);
                    self.writer
                        .write_frame_with_payload(&frame, &self.buffer[..n])?;
                }
                Err(e) => {
                    warn!("Content read failed on channel {}: {}", channel, e);
                    transfer.response.set_status(Status::ReadFailed);
                    self.writer.write_frame(
                        &Frame::new(Command::Error)
                            .arg(channel)
                            .arg(Status::ReadFailed),
                    )?;
                    finished.push(channel);
                }
            }
        }

        for channel in finished {
            self.transfers.remove(&channel);
        }
        Ok(())
    }

    fn interrupt_transfers(&mut self) {
        for (channel, transfer) in std::mem::take(&mut self.transfers) {
            transfer.response.set_status(Status::Interrupted);
            let frame = Frame::new(Command::Error)
                .arg(channel)
                .arg(Status::Interrupted);
            // Keep marking the rest even once the writer is gone
            let _ = self.writer.write_frame(&frame);
        }
    }

    pub(crate) fn writer_mut(&mut self) -> &mut FrameWriter<W> {
        &mut self.writer
    }
}

fn read_chunk(source: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Handle on a running sender thread
pub(crate) struct Sender {
    queue: Arc<SenderQueue>,
    handle: Option<JoinHandle<()>>,
}

impl Sender {
    /// Start the sender thread for an authenticated connection
    pub(crate) fn spawn(
        writer: WireWriter,
        queue: Arc<SenderQueue>,
        chunk_size: usize,
        peer: &Identifier,
    ) -> Result<Self> {
        let mut worker = SenderWorker::new(Arc::clone(&queue), writer, chunk_size);
        let peer = peer.clone();

        let handle = thread::Builder::new()
            .name("tether-sender".to_string())
            .spawn(move || {
                debug!("Sender for {} starting", peer);
                if let Err(e) = worker.run() {
                    warn!("Sender for {} failed: {}", peer, e);
                    // Unblock the reader so the connection tears down
                    let _ = worker
                        .writer_mut()
                        .get_mut()
                        .get_ref()
                        .shutdown(Shutdown::Both);
                }
                info!("Sender for {} stopped", peer);
            })?;

        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    /// Signal the thread, let it interrupt open channels, and join it
    pub(crate) fn shutdown(mut self) {
        self.queue.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Sender thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameReader;
    use std::io::Cursor;

    fn worker(chunk_size: usize) -> (Arc<SenderQueue>, SenderWorker<Vec<u8>>) {
        let queue = SenderQueue::new();
        let worker = SenderWorker::new(Arc::clone(&queue), FrameWriter::new(Vec::new()), chunk_size);
        (queue, worker)
    }

    /// Decode everything written so far as (frame, payload) pairs
    fn drain(worker: &mut SenderWorker<Vec<u8>>) -> Vec<(Frame, Vec<u8>)> {
        let bytes = std::mem::take(worker.writer_mut().get_mut());
        let mut reader = FrameReader::new(Cursor::new(bytes), true);
        let mut out = Vec::new();
        while let Some(frame) = reader.read_frame().unwrap() {
            let payload = match frame.command() {
                Command::Data => reader.read_payload(frame.parse_arg(1).unwrap()).unwrap(),
                Command::Message => reader.read_payload(frame.parse_arg(0).unwrap()).unwrap(),
                _ => Vec::new(),
            };
            out.push((frame, payload));
        }
        out
    }

    struct FailingSource;

    impl Read for FailingSource {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("disk gone"))
        }
    }

    /// Accepts `budget` bytes, then behaves like a vanished peer
    struct ClosingWriter {
        budget: usize,
    }

    impl Write for ClosingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_response_streams_in_chunks() {
        let (queue, mut worker) = worker(4);
        let response = Arc::new(
            Response::new(Status::Success).with_content(Cursor::new(b"0123456789".to_vec())),
        );
        queue.push_responses(7, vec![response]);

        let mut frames = Vec::new();
        for _ in 0..4 {
            worker.step().unwrap();
            frames.extend(drain(&mut worker));
        }

        let (header, _) = &frames[0];
        assert_eq!(header.command(), Command::Response);
        assert_eq!(header.args().to_vec(), vec!["7", "0", "1"]);

        let data: Vec<_> = frames[1..].iter().map(|(f, p)| (f.arg_str(1).unwrap().to_string(), p.clone())).collect();
        assert_eq!(
            data,
            vec![
                ("4".to_string(), b"0123".to_vec()),
                ("4".to_string(), b"4567".to_vec()),
                ("2".to_string(), b"89".to_vec()),
                ("0".to_string(), Vec::new()),
            ]
        );
        assert!(worker.transfers.is_empty());
    }

    #[test]
    fn test_earlier_responses_demoted_to_pending() {
        let (queue, mut worker) = worker(16);
        queue.push_responses(
            3,
            vec![
                Arc::new(Response::new(Status::Success)),
                Arc::new(Response::new(Status::Success)),
                Arc::new(Response::new(Status::NotFound)),
            ],
        );
        worker.step().unwrap();

        let statuses: Vec<_> = drain(&mut worker)
            .into_iter()
            .map(|(f, _)| f.parse_arg::<Status>(1).unwrap())
            .collect();
        assert_eq!(statuses, [Status::Pending, Status::Pending, Status::NotFound]);
    }

    #[test]
    fn test_channel_ids_increase() {
        let (queue, mut worker) = worker(16);
        for id in 1..=3 {
            let response =
                Arc::new(Response::new(Status::Success).with_content(Cursor::new(vec![1u8; 4])));
            queue.push_responses(id, vec![response]);
        }
        worker.step().unwrap();

        let channels: Vec<u32> = drain(&mut worker)
            .into_iter()
            .filter(|(f, _)| f.command() == Command::Response)
            .map(|(f, _)| f.parse_arg(2).unwrap())
            .collect();
        assert_eq!(channels, [1, 2, 3]);
    }

    #[test]
    fn test_cancel_stops_data_on_next_tick() {
        let (queue, mut worker) = worker(4);
        let response = Arc::new(
            Response::new(Status::Success).with_content(Cursor::new(vec![0u8; 64])),
        );
        queue.push_responses(1, vec![Arc::clone(&response)]);
        worker.step().unwrap();
        drain(&mut worker);

        queue.cancel_transfer(1);
        worker.step().unwrap();
        assert!(drain(&mut worker).is_empty());
        assert_eq!(response.status(), Status::Interrupted);
    }

    #[test]
    fn test_read_failure_sends_error_frame() {
        let (queue, mut worker) = worker(4);
        let response = Arc::new(Response::new(Status::Success).with_content(FailingSource));
        queue.push_responses(2, vec![Arc::clone(&response)]);
        worker.step().unwrap();

        let frames = drain(&mut worker);
        let (error, _) = frames.last().unwrap();
        assert_eq!(error.command(), Command::Error);
        assert_eq!(error.parse_arg::<Status>(1).unwrap(), Status::ReadFailed);
        assert_eq!(response.status(), Status::ReadFailed);
        assert!(worker.transfers.is_empty());
    }

    #[test]
    fn test_one_message_and_one_request_per_tick() {
        let (queue, mut worker) = worker(16);
        let peer = Identifier::new([5; 64]);
        queue.push_message(Message::new(peer.clone(), b"first".to_vec()));
        queue.push_message(Message::new(peer, b"second".to_vec()));
        let request = Arc::new(Request::new("/a b", true));
        request.set_id(9);
        queue.push_request(request);

        worker.step().unwrap();
        let frames = drain(&mut worker);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0.command(), Command::Message);
        assert_eq!(frames[0].1, b"first");
        assert_eq!(frames[1].0.command(), Command::Get);
        assert_eq!(frames[1].0.rest_from(1), "/a b");

        worker.step().unwrap();
        let frames = drain(&mut worker);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, b"second");
    }

    #[test]
    fn test_shutdown_interrupts_open_channels() {
        let (queue, mut worker) = worker(4);
        let response = Arc::new(
            Response::new(Status::Success).with_content(Cursor::new(vec![0u8; 64])),
        );
        queue.push_responses(1, vec![Arc::clone(&response)]);
        worker.step().unwrap();
        drain(&mut worker);

        queue.shutdown();
        worker.run().unwrap();

        let frames = drain(&mut worker);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.command(), Command::Error);
        assert_eq!(frames[0].0.parse_arg::<Status>(1).unwrap(), Status::Interrupted);
        assert_eq!(response.status(), Status::Interrupted);
    }

    #[test]
    fn test_stop_frames_emitted() {
        let (queue, mut worker) = worker(4);
        queue.push_stop(12);
        worker.step().unwrap();
        let frames = drain(&mut worker);
        assert_eq!(frames[0].0.command(), Command::Cancel);
        assert_eq!(frames[0].0.parse_arg::<u32>(0).unwrap(), 12);
    }

    #[test]
    fn test_write_failure_interrupts_open_channels() {
        let queue = SenderQueue::new();
        let mut worker = SenderWorker::new(
            Arc::clone(&queue),
            FrameWriter::new(ClosingWriter { budget: 200 }),
            4096,
        );
        let streaming = Arc::new(
            Response::new(Status::Success).with_content(Cursor::new(vec![7u8; 100_000])),
        );
        queue.push_responses(1, vec![Arc::clone(&streaming)]);

        assert!(worker.run().is_err());
        assert_eq!(streaming.status(), Status::Interrupted);
        assert!(worker.transfers.is_empty());
    }

    #[test]
    fn test_final_response_never_pending() {
        let (queue, mut worker) = worker(16);
        queue.push_responses(4, vec![Arc::new(Response::new(Status::Pending))]);
        queue.push_responses(
            5,
            vec![
                Arc::new(Response::new(Status::Pending)),
                Arc::new(Response::new(Status::Pending)),
            ],
        );
        worker.step().unwrap();

        let statuses: Vec<_> = drain(&mut worker)
            .into_iter()
            .map(|(f, _)| f.parse_arg::<Status>(1).unwrap())
            .collect();
        assert_eq!(statuses, [Status::Success, Status::Pending, Status::Success]);
    }
}
