//! Inbound frame dispatch for authenticated connections.
//!
//! The connection's reader thread decodes one frame at a time and hands it
//! to the [`Dispatcher`], which matches responses to outstanding requests,
//! feeds channel data into response bodies, and passes inbound requests and
//! messages to the application [`Listener`].

use crate::content::{ContentSink, content_channel};
use crate::error::{Error, Result};
use crate::frame::{Command, Frame, FrameReader};
use crate::identifier::Identifier;
use crate::listener::Listener;
use crate::message::Message;
use crate::request::{Request, Response, Status};
use crate::sender::SenderQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, warn};

/// Requests a connection carries, by id
pub type RequestTable = Arc<Mutex<HashMap<u32, Arc<Request>>>>;

/// Target prefix of rendezvous discovery queries
pub const DISCOVERY_PREFIX: &str = "peer:";

/// Answers discovery queries (`peer:<id>` targets) on behalf of the engine
pub(crate) trait Discovery: Send {
    fn answer(&self, via: &Identifier, request: &Request) -> Response;
}

struct InboundChannel {
    sink: ContentSink,
    response: Arc<Response>,
}

/// Per-connection frame dispatcher
pub(crate) struct Dispatcher {
    peer: Identifier,
    requests: RequestTable,
    channels: HashMap<u32, InboundChannel>,
    listener: Option<Arc<dyn Listener>>,
    discovery: Option<Box<dyn Discovery>>,
    queue: Arc<SenderQueue>,
}

impl Dispatcher {
    pub(crate) fn new(
        peer: Identifier,
        requests: RequestTable,
        listener: Option<Arc<dyn Listener>>,
        queue: Arc<SenderQueue>,
    ) -> Self {
        Self {
            peer,
            requests,
            channels: HashMap::new(),
            listener,
            discovery: None,
            queue,
        }
    }

    pub(crate) fn with_discovery(mut self, discovery: Box<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Handle one frame; `reader` supplies any raw payload that follows it
    pub(crate) fn dispatch<R: Read>(
        &mut self,
        frame: Frame,
        reader: &mut FrameReader<R>,
    ) -> Result<()> {
        match frame.command() {
            Command::Invoke | Command::Get => self.on_invoke(frame),
            Command::Response => self.on_response(frame),
            Command::Data => self.on_data(&frame, reader),
            Command::Error => self.on_error(&frame),
            Command::Cancel => {
                let channel: u32 = frame.parse_arg(0)?;
                self.queue.cancel_transfer(channel);
                Ok(())
            }
            Command::Message => self.on_message(frame, reader),
            Command::Hello | Command::Auth => Err(Error::Protocol(
                format!("unexpected {} frame after authentication", frame.command()).into(),
            )),
        }
    }

    fn on_invoke(&mut self, frame: Frame) -> Result<()> {
        let id: u32 = frame.parse_arg(0)?;
        let target = frame.rest_from(1);
        if target.is_empty() {
            return Err(Error::protocol("request without target"));
        }
        let is_data = frame.command() == Command::Get;
        let request = Request::incoming(id, target, is_data, frame.into_headers());
        debug!("Request {} for {:?} from {}", id, request.target(), self.peer);

        let mut responses = if request.target().starts_with(DISCOVERY_PREFIX) {
            self.discovery
                .as_ref()
                .map(|d| vec![d.answer(&self.peer, &request)])
                .unwrap_or_default()
        } else {
            self.listener
                .as_ref()
                .map(|l| l.on_request(&self.peer, &request))
                .unwrap_or_default()
        };
        if responses.is_empty() {
            responses.push(Response::new(Status::Failed));
        }

        self.queue
            .push_responses(id, responses.into_iter().map(Arc::new).collect());
        Ok(())
    }

    fn on_response(&mut self, frame: Frame) -> Result<()> {
        let id: u32 = frame.parse_arg(0)?;
        let status: Status = frame.parse_arg(1)?;
        let channel: u32 = frame.parse_arg(2)?;

        let Some(request) = self.requests.lock().get(&id).cloned() else {
            debug!("Response for unknown request {} from {}", id, self.peer);
            if channel != 0 {
                self.queue.push_stop(channel);
            }
            return Ok(());
        };

        let response = if channel == 0 {
            Arc::new(Response::incoming(
                status,
                frame.into_headers(),
                self.peer.clone(),
                None,
            ))
        } else {
            let Entry::Vacant(slot) = self.channels.entry(channel) else {
                return Err(Error::Protocol(
                    format!("channel {channel} opened twice").into(),
                ));
            };
            let (sink, content) = content_channel();
            let response = Arc::new(Response::incoming(
                status,
                frame.into_headers(),
                self.peer.clone(),
                Some(Box::new(content)),
            ));
            slot.insert(InboundChannel {
                sink,
                response: Arc::clone(&response),
            });
            response
        };

        request.add_response(response);
        if status != Status::Pending {
            self.requests.lock().remove(&id);
            request.remove_pending(&self.peer);
        }
        Ok(())
    }

    fn on_data<R: Read>(&mut self, frame: &Frame, reader: &mut FrameReader<R>) -> Result<()> {
        let channel: u32 = frame.parse_arg(0)?;
        let size: usize = frame.parse_arg(1)?;

        let Some(inbound) = self.channels.get(&channel) else {
            reader.discard(size)?;
            debug!("Data for unknown channel {} from {}", channel, self.peer);
            self.queue.push_stop(channel);
            return Ok(());
        };

        if size == 0 {
            if let Some(inbound) = self.channels.remove(&channel) {
                inbound.sink.finish();
            }
            return Ok(());
        }

        let payload = reader.read_payload(size)?;
        if !inbound.sink.push(payload) {
            debug!("Channel {} abandoned by reader, stopping it", channel);
            self.channels.remove(&channel);
            self.queue.push_stop(channel);
        }
        Ok(())
    }

    fn on_error(&mut self, frame: &Frame) -> Result<()> {
        let channel: u32 = frame.parse_arg(0)?;
        let status: Status = frame.parse_arg(1)?;

        match self.channels.remove(&channel) {
            Some(inbound) => {
                debug!("Channel {} failed with status {}", channel, status);
                inbound.response.set_status(status);
                inbound.sink.fail(status);
            }
            None => debug!("Error for unknown channel {}", channel),
        }
        Ok(())
    }

    fn on_message<R: Read>(&mut self, frame: Frame, reader: &mut FrameReader<R>) -> Result<()> {
        let size: usize = frame.parse_arg(0)?;
        let content = reader.read_payload(size)?;
        let message = Message::incoming(self.peer.clone(), frame.into_headers(), content);

        match &self.listener {
            Some(listener) => listener.on_message(&message),
            None => warn!("Dropping message from {}: no listener", self.peer),
        }
        Ok(())
    }

    /// Interrupt every inbound channel and release every waiting request
    pub(crate) fn teardown(&mut self) {
        for (_, inbound) in self.channels.drain() {
            inbound.response.set_status(Status::Interrupted);
            inbound.sink.fail(Status::Interrupted);
        }

        let requests: Vec<_> = self.requests.lock().drain().map(|(_, r)| r).collect();
        for request in requests {
            request.clear_pending(&self.peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameWriter;
    use std::io::Cursor;

    fn peer() -> Identifier {
        Identifier::new([3; 64]).with_instance("laptop")
    }

    fn bare(frame: Frame) -> (Frame, Vec<u8>) {
        (frame, Vec::new())
    }

    fn with(frame: Frame, payload: &[u8]) -> (Frame, Vec<u8>) {
        (frame, payload.to_vec())
    }

    fn encode(frames: Vec<(Frame, Vec<u8>)>) -> FrameReader<Cursor<Vec<u8>>> {
        let mut writer = FrameWriter::new(Vec::new());
        for (frame, payload) in &frames {
            writer.write_frame_with_payload(frame, payload).unwrap();
        }
        FrameReader::new(Cursor::new(writer.into_inner()), true)
    }

    fn run(dispatcher: &mut Dispatcher, frames: Vec<(Frame, Vec<u8>)>) -> Result<()> {
        let mut reader = encode(frames);
        while let Some(frame) = reader.read_frame()? {
            dispatcher.dispatch(frame, &mut reader)?;
        }
        Ok(())
    }

    fn outstanding(table: &RequestTable, id: u32) -> Arc<Request> {
        let request = Arc::new(Request::new(format!("/item/{id}"), false));
        request.set_id(id);
        request.add_pending(&peer());
        table.lock().insert(id, Arc::clone(&request));
        request
    }

    fn dispatcher(listener: Option<Arc<dyn Listener>>) -> (Dispatcher, RequestTable) {
        let table = RequestTable::default();
        let dispatcher = Dispatcher::new(peer(), Arc::clone(&table), listener, SenderQueue::new());
        (dispatcher, table)
    }

    fn response(id: u32, status: Status, channel: u32) -> Frame {
        Frame::new(Command::Response)
            .arg(id)
            .arg(status)
            .arg(channel)
            .header("for", id.to_string())
    }

    #[test]
    fn test_out_of_order_responses_match_their_requests() {
        let (mut dispatcher, table) = dispatcher(None);
        let requests: Vec<_> = (1..=4).map(|id| outstanding(&table, id)).collect();

        let frames = [3, 1, 4, 2]
            .into_iter()
            .map(|id| bare(response(id, Status::Success, 0)))
            .collect();
        run(&mut dispatcher, frames).unwrap();

        for request in &requests {
            let responses = request.responses();
            assert_eq!(responses.len(), 1);
            assert_eq!(
                responses[0].parameter("for"),
                Some(request.id().to_string().as_str())
            );
            assert_eq!(responses[0].peer(), Some(&peer()));
            assert!(!request.is_pending());
        }
        assert!(table.lock().is_empty());
    }

    #[test]
    fn test_pending_response_keeps_request_open() {
        let (mut dispatcher, table) = dispatcher(None);
        let request = outstanding(&table, 5);

        run(&mut dispatcher, vec![bare(response(5, Status::Pending, 0))]).unwrap();
        assert!(request.is_pending());
        assert!(table.lock().contains_key(&5));

        run(&mut dispatcher, vec![bare(response(5, Status::Success, 0))]).unwrap();
        assert!(!request.is_pending());
        assert_eq!(request.responses().len(), 2);
    }

    #[test]
    fn test_channel_data_reaches_content() {
        let (mut dispatcher, table) = dispatcher(None);
        let request = outstanding(&table, 1);

        run(
            &mut dispatcher,
            vec![
                bare(response(1, Status::Success, 9)),
                with(Frame::new(Command::Data).arg(9).arg(5), b"hello"),
                with(Frame::new(Command::Data).arg(9).arg(6), b" world"),
                bare(Frame::new(Command::Data).arg(9).arg(0)),
            ],
        )
        .unwrap();

        let mut content = request.responses()[0].take_content().unwrap();
        let mut body = String::new();
        content.read_to_string(&mut body).unwrap();
        assert_eq!(body, "hello world");
        assert!(dispatcher.channels.is_empty());
    }

    #[test]
    fn test_error_frame_fails_content() {
        let (mut dispatcher, table) = dispatcher(None);
        let request = outstanding(&table, 1);

        run(
            &mut dispatcher,
            vec![
                bare(response(1, Status::Success, 2)),
                bare(Frame::new(Command::Error).arg(2).arg(Status::ReadFailed)),
            ],
        )
        .unwrap();

        let response = &request.responses()[0];
        assert_eq!(response.status(), Status::ReadFailed);
        let mut content = response.take_content().unwrap();
        assert!(content.read(&mut [0u8; 4]).is_err());
    }

    #[test]
    fn test_unknown_channel_is_drained() {
        let (mut dispatcher, _table) = dispatcher(None);
        run(
            &mut dispatcher,
            vec![
                with(Frame::new(Command::Data).arg(42).arg(3), b"abc"),
                bare(Frame::new(Command::Cancel).arg(1)),
            ],
        )
        .unwrap();
        assert!(dispatcher.channels.is_empty());
    }

    #[test]
    fn test_handshake_frame_is_fatal() {
        let (mut dispatcher, _table) = dispatcher(None);
        let result = run(&mut dispatcher, vec![bare(Frame::new(Command::Hello).arg("00"))]);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_bad_status_code_is_fatal() {
        let (mut dispatcher, table) = dispatcher(None);
        outstanding(&table, 1);
        let frame = Frame::new(Command::Response).arg(1).arg("OK").arg(0);
        assert!(run(&mut dispatcher, vec![bare(frame)]).is_err());
    }

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Message>>,
    }

    impl Listener for Recorder {
        fn on_request(&self, _peer: &Identifier, request: &Request) -> Vec<Response> {
            if request.target() == "/echo" {
                vec![Response::new(Status::Success)]
            } else {
                Vec::new()
            }
        }

        fn on_message(&self, message: &Message) {
            self.messages.lock().push(message.clone());
        }
    }

    #[test]
    fn test_message_delivered_with_sender_identity() {
        let recorder = Arc::new(Recorder::default());
        let (mut dispatcher, _table) = dispatcher(Some(recorder.clone()));
        run(
            &mut dispatcher,
            vec![with(
                Frame::new(Command::Message).arg(4).header("type", "note"),
                b"ping",
            )],
        )
        .unwrap();

        let messages = recorder.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content(), b"ping");
        assert_eq!(messages[0].receiver(), &peer());
        assert_eq!(messages[0].parameter("type"), Some("note"));
    }

    #[test]
    fn test_unserved_request_answered_with_failure() {
        let recorder = Arc::new(Recorder::default());
        let (mut dispatcher, _table) = dispatcher(Some(recorder));
        let queue = Arc::clone(&dispatcher.queue);
        run(
            &mut dispatcher,
            vec![bare(Frame::new(Command::Invoke).arg(8).arg("/missing"))],
        )
        .unwrap();

        let mut worker = crate::sender::SenderWorker::new(queue, FrameWriter::new(Vec::new()), 16);
        worker.step().unwrap();
        let bytes = std::mem::take(worker.writer_mut().get_mut());
        let frame = FrameReader::new(Cursor::new(bytes), true)
            .read_frame()
            .unwrap()
            .unwrap();
        assert_eq!(frame.command(), Command::Response);
        assert_eq!(frame.parse_arg::<u32>(0).unwrap(), 8);
        assert_eq!(frame.parse_arg::<Status>(1).unwrap(), Status::Failed);
    }

    #[test]
    fn test_teardown_interrupts_and_releases() {
        let (mut dispatcher, table) = dispatcher(None);
        let streaming = outstanding(&table, 1);
        let waiting = outstanding(&table, 2);
        run(&mut dispatcher, vec![bare(response(1, Status::Success, 4))]).unwrap();

        dispatcher.teardown();

        assert!(!waiting.is_pending());
        assert!(waiting.wait(Some(std::time::Duration::from_millis(10))));
        let response = &streaming.responses()[0];
        assert_eq!(response.status(), Status::Interrupted);
        let mut content = response.take_content().unwrap();
        assert!(content.read(&mut [0u8; 4]).is_err());
        assert!(table.lock().is_empty());
    }
}
