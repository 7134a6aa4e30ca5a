//! Per-connection session loop.
//!
//! A session owns everything one client talks to: the chunk reader and
//! writer around the socket, the decoder and encoder registries for the
//! negotiated version, the state machine, the response collector, and
//! the connection's statement processor. The loop reads one message,
//! runs it through the machine, and writes exactly one terminal response
//! (plus any streamed records) before reading the next.
//!
//! Setup comes first: the opening message must be `Hello`, answered with
//! the server agent and connection id. After that the machine takes over
//! until the client disconnects, a fatal failure ends the session, or
//! the server stops the connection.
//!
//! Sessions end in two ways that are not errors: the client hanging up,
//! logged at debug, and the server killing the connection. Only genuine
//! failures surface as `Err` so the transport can count them.

use std::io::{self, Read, Write};

use quiver_bolt::registry::encode_fallback;
use quiver_bolt::{
    ChunkReader, ChunkWriter, DecoderRegistry, EncoderRegistry, RequestMessage, ResponseMessage,
    Value, ValueMap,
};

use crate::error::Error;
use crate::handler::{RecordSink, ResponseCollector};
use crate::interrupt::InterruptSignal;
use crate::machine::{MachineContext, State, StateMachine};
use crate::processor::{ProcessorFactory, StatementProcessor};
use crate::status::{codes, Failure};

/// One client connection after a successful handshake.
pub struct Session<R, W> {
    reader: ChunkReader<R>,
    sink: WireSink<W>,
    decoder: DecoderRegistry,
    machine: StateMachine,
    collector: ResponseCollector,
    processor: Box<dyn StatementProcessor>,
    interrupt: InterruptSignal,
    connection_id: u64,
}

impl<R: Read, W: Write> Session<R, W> {
    /// Assemble a session for a negotiated protocol version.
    pub fn new(
        reader: R,
        writer: W,
        version: u32,
        connection_id: u64,
        interrupt: InterruptSignal,
        factory: &dyn ProcessorFactory,
        max_message_size: usize,
    ) -> Self {
        Self {
            reader: ChunkReader::with_max_message_size(reader, max_message_size),
            sink: WireSink {
                writer: ChunkWriter::with_max_message_size(writer, max_message_size),
                encoder: EncoderRegistry::for_version(version),
            },
            decoder: DecoderRegistry::for_version(version),
            machine: StateMachine::new(version),
            collector: ResponseCollector::new(),
            processor: factory.create(connection_id, interrupt.clone()),
            interrupt,
            connection_id,
        }
    }

    /// Drive the setup phase.
    ///
    /// The first real message must be `Hello`; it is answered with the
    /// server agent string and the connection id. Returns `Ok(true)` when
    /// the session is ready for [`Session::run`], `Ok(false)` when the
    /// client went away before identifying itself.
    pub fn initialize(&mut self, server_agent: &str) -> Result<bool, Error> {
        let payload = loop {
            if self.interrupt.is_stopped() {
                self.report_stopped();
                return Ok(false);
            }
            match self.reader.next_message() {
                Ok(Some(payload)) if payload.is_empty() => continue,
                Ok(Some(payload)) => break payload,
                Ok(None) => {
                    tracing::debug!(
                        connection_id = self.connection_id,
                        "client disconnected before setup"
                    );
                    return Ok(false);
                }
                Err(e) => return self.handle_read_error(e).map(|_| false),
            }
        };

        let message = match self.decoder.decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                // Nothing to recover into before setup completes.
                let Failure { code, message, .. } = Failure::from(e);
                let failure = Failure::fatal(code, message);
                self.sink.flush_fatal(&failure);
                return Err(Error::Fatal(failure));
            }
        };

        match message {
            RequestMessage::Hello { metadata } => {
                tracing::debug!(
                    connection_id = self.connection_id,
                    user_agent = metadata
                        .get("user_agent")
                        .and_then(quiver_bolt::Value::as_str)
                        .unwrap_or("unknown"),
                    "session established"
                );
                let mut meta = ValueMap::with_capacity(2);
                meta.insert("server", server_agent);
                meta.insert("connection_id", format!("quiver-{}", self.connection_id));
                if let Err(failure) = self.sink.send(&ResponseMessage::success(meta)) {
                    return self.fail_session(failure).map(|_| false);
                }
                Ok(true)
            }
            other => {
                let failure = Failure::fatal(
                    codes::REQUEST_INVALID,
                    format!("expected HELLO to open the session, got {}", other.name()),
                );
                self.sink.flush_fatal(&failure);
                Err(Error::Fatal(failure))
            }
        }
    }

    /// Drive the main loop until the session ends.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            if self.interrupt.is_stopped() {
                self.report_stopped();
                return Ok(());
            }

            let payload = match self.reader.next_message() {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    if self.interrupt.is_stopped() {
                        self.report_stopped();
                    } else {
                        self.log_disconnect();
                    }
                    return Ok(());
                }
                Err(e) => return self.handle_read_error(e),
            };

            if payload.is_empty() {
                tracing::trace!(connection_id = self.connection_id, "keep-alive");
                continue;
            }

            let message = match self.decoder.decode(&payload) {
                Ok(message) => message,
                Err(e) => {
                    // Undecodable bytes answer FAILURE and leave the
                    // machine state alone.
                    tracing::debug!(
                        connection_id = self.connection_id,
                        error = %e,
                        "undecodable message"
                    );
                    if let Err(failure) = self.sink.send(&Failure::from(e).into_response()) {
                        return self.fail_session(failure);
                    }
                    continue;
                }
            };

            // A wire reset settles the interrupt it raises itself, so
            // every reset consumes exactly one raise. Cross-thread raises
            // are extra increments and keep later resets answering
            // ignored until they, too, are matched.
            if matches!(message, RequestMessage::Reset) {
                self.interrupt.raise();
                if let Err(failure) = self.feed(RequestMessage::Interrupt) {
                    return self.fail_session(failure);
                }
            }

            if let Err(failure) = self.feed(message) {
                return self.fail_session(failure);
            }
            let response = self.collector.finish();
            if let Err(failure) = self.sink.send(&response) {
                return self.fail_session(failure);
            }
        }
    }

    fn feed(&mut self, message: RequestMessage) -> Result<(), Failure> {
        let mut ctx = MachineContext {
            processor: self.processor.as_mut(),
            collector: &mut self.collector,
            records: &mut self.sink,
            interrupt: &self.interrupt,
        };
        self.machine.process(message, &mut ctx)
    }

    // Fatal failures end the session. Disconnect-classified ones are the
    // client's doing; the rest are flushed to the client and reported to
    // the caller.
    fn fail_session(&mut self, failure: Failure) -> Result<(), Error> {
        if failure.code == codes::TRANSACTION_TERMINATED {
            tracing::debug!(
                connection_id = self.connection_id,
                message = %failure.message,
                "client disconnected mid-operation"
            );
            return Ok(());
        }
        tracing::error!(
            connection_id = self.connection_id,
            code = %failure.code,
            message = %failure.message,
            "fatal session failure"
        );
        self.sink.flush_fatal(&failure);
        Err(Error::Fatal(failure))
    }

    fn handle_read_error(&mut self, e: io::Error) -> Result<(), Error> {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => {
                tracing::debug!(
                    connection_id = self.connection_id,
                    error = %e,
                    "client disconnected mid-message"
                );
                Ok(())
            }
            io::ErrorKind::InvalidData => {
                // The inbound size cap tripped; tell the client why
                // before closing.
                let failure = Failure::fatal(codes::REQUEST_INVALID_FORMAT, e.to_string());
                tracing::warn!(
                    connection_id = self.connection_id,
                    message = %failure.message,
                    "rejecting inbound message"
                );
                self.sink.flush_fatal(&failure);
                Err(Error::Fatal(failure))
            }
            _ => {
                tracing::error!(connection_id = self.connection_id, error = %e, "read failed");
                Err(Error::Io(e))
            }
        }
    }

    fn report_stopped(&mut self) {
        tracing::debug!(connection_id = self.connection_id, "session stopped by server");
        let failure = Failure::fatal(
            codes::GENERAL_UNAVAILABLE,
            "connection terminated by server",
        );
        self.sink.flush_fatal(&failure);
    }

    fn log_disconnect(&self) {
        let state = self.machine.state();
        if state == State::Ready {
            tracing::debug!(connection_id = self.connection_id, "client disconnected");
        } else {
            tracing::debug!(
                connection_id = self.connection_id,
                state = %state,
                code = codes::TRANSACTION_TERMINATED,
                "client disconnected mid-operation"
            );
        }
    }
}

// Owns the write half: encodes responses and chunks them out. Doubles as
// the machine's record sink while a result is streaming.
struct WireSink<W> {
    writer: ChunkWriter<W>,
    encoder: EncoderRegistry,
}

impl<W: Write> WireSink<W> {
    fn send(&mut self, response: &ResponseMessage) -> Result<(), Failure> {
        let bytes = self.encoder.encode(response).map_err(|e| {
            Failure::fatal(
                codes::GENERAL_UNKNOWN,
                format!("cannot encode {}: {}", response.name(), e),
            )
        })?;
        self.write_payload(&bytes)
    }

    fn write_payload(&mut self, payload: &[u8]) -> Result<(), Failure> {
        self.writer.begin_message();
        let result = self
            .writer
            .write(payload)
            .and_then(|()| self.writer.end_message());
        result.map_err(|e| {
            self.writer.abort_message();
            classify_write_error(e)
        })
    }

    // Best-effort flush of a closing failure. The normal encoder runs
    // first; if it cannot, a minimal prebuilt FAILURE goes out instead.
    // Write errors are swallowed because the peer may already be gone.
    fn flush_fatal(&mut self, failure: &Failure) {
        let response = failure.clone().into_response();
        match self.encoder.encode(&response) {
            Ok(bytes) => {
                let _ = self.write_payload(&bytes);
            }
            Err(_) => {
                let _ = self.write_payload(&encode_fallback(&failure.code, &failure.message));
            }
        }
    }
}

impl<W: Write> RecordSink for WireSink<W> {
    fn emit(&mut self, fields: Vec<Value>) -> Result<(), Failure> {
        self.send(&ResponseMessage::record(fields))
    }
}

// Write failures split into the client going away, which is routine, and
// everything else.
fn classify_write_error(e: io::Error) -> Failure {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => Failure::fatal(
            codes::TRANSACTION_TERMINATED,
            format!("connection lost: {e}"),
        ),
        _ => Failure::fatal(codes::GENERAL_UNKNOWN, format!("write failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::EchoFactory;
    use quiver_bolt::{signature, Packer, Unpacker, DEFAULT_MAX_MESSAGE_SIZE};
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl SharedBuf {
        fn take(&self) -> Vec<u8> {
            std::mem::take(&mut self.0.borrow_mut())
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame(payloads: &[Vec<u8>]) -> Vec<u8> {
        let mut writer = ChunkWriter::new(Vec::new());
        for payload in payloads {
            writer.begin_message();
            writer.write(payload).unwrap();
            writer.end_message().unwrap();
        }
        writer.into_inner()
    }

    fn hello_payload() -> Vec<u8> {
        let mut packer = Packer::new();
        packer.pack_struct_header(signature::HELLO, 1).unwrap();
        let mut meta = ValueMap::new();
        meta.insert("user_agent", "test/0.0");
        packer.pack(&Value::Map(meta)).unwrap();
        packer.into_bytes().to_vec()
    }

    fn run_payload(statement: &str) -> Vec<u8> {
        let mut packer = Packer::new();
        packer.pack_struct_header(signature::RUN, 3).unwrap();
        packer.pack_string(statement).unwrap();
        packer.pack_map_header(0).unwrap();
        packer.pack_map_header(0).unwrap();
        packer.into_bytes().to_vec()
    }

    fn empty_payload(sig: u8) -> Vec<u8> {
        let mut packer = Packer::new();
        packer.pack_struct_header(sig, 0).unwrap();
        packer.into_bytes().to_vec()
    }

    fn session(input: Vec<u8>) -> (Session<Cursor<Vec<u8>>, SharedBuf>, SharedBuf) {
        let out = SharedBuf::default();
        let session = Session::new(
            Cursor::new(input),
            out.clone(),
            3,
            1,
            InterruptSignal::new(),
            &EchoFactory,
            DEFAULT_MAX_MESSAGE_SIZE,
        );
        (session, out)
    }

    fn read_responses(bytes: Vec<u8>) -> Vec<Vec<u8>> {
        let mut reader = ChunkReader::new(Cursor::new(bytes));
        let mut payloads = Vec::new();
        while let Some(payload) = reader.next_message().unwrap() {
            payloads.push(payload.to_vec());
        }
        payloads
    }

    fn decode_success(payload: &[u8]) -> ValueMap {
        let mut unpacker = Unpacker::new(payload);
        let (sig, fields) = unpacker.read_struct_header().unwrap();
        assert_eq!(sig, signature::SUCCESS);
        assert_eq!(fields, 1);
        match unpacker.unpack().unwrap() {
            Value::Map(map) => map,
            other => panic!("expected metadata map, got {other:?}"),
        }
    }

    fn response_signature(payload: &[u8]) -> u8 {
        let mut unpacker = Unpacker::new(payload);
        unpacker.read_struct_header().unwrap().0
    }

    #[test]
    fn test_setup_answers_hello_with_server_metadata() {
        let (mut s, out) = session(frame(&[hello_payload()]));
        assert!(s.initialize("quiver/0.0-test").unwrap());

        let responses = read_responses(out.take());
        assert_eq!(responses.len(), 1);
        let metadata = decode_success(&responses[0]);
        assert_eq!(
            metadata.get("server"),
            Some(&Value::String("quiver/0.0-test".into()))
        );
        assert_eq!(
            metadata.get("connection_id"),
            Some(&Value::String("quiver-1".into()))
        );
    }

    #[test]
    fn test_setup_rejects_non_hello_first_message() {
        let (mut s, out) = session(frame(&[run_payload("RETURN 1")]));
        match s.initialize("quiver/test").unwrap_err() {
            Error::Fatal(failure) => assert_eq!(failure.code, codes::REQUEST_INVALID),
            other => panic!("expected fatal error, got {other:?}"),
        }

        let responses = read_responses(out.take());
        assert_eq!(responses.len(), 1);
        assert_eq!(response_signature(&responses[0]), signature::FAILURE);
    }

    #[test]
    fn test_setup_tolerates_disconnect() {
        let (mut s, out) = session(Vec::new());
        assert!(!s.initialize("quiver/test").unwrap());
        assert!(out.take().is_empty());
    }

    #[test]
    fn test_full_autocommit_exchange() {
        let input = frame(&[
            hello_payload(),
            run_payload("RETURN 1"),
            empty_payload(signature::PULL_ALL),
        ]);
        let (mut s, out) = session(input);
        assert!(s.initialize("quiver/test").unwrap());
        s.run().unwrap();

        let responses = read_responses(out.take());
        // HELLO success, RUN success, one record, PULL_ALL success.
        assert_eq!(responses.len(), 4);
        assert_eq!(response_signature(&responses[0]), signature::SUCCESS);
        assert_eq!(response_signature(&responses[1]), signature::SUCCESS);
        assert_eq!(response_signature(&responses[2]), signature::RECORD);
        let metadata = decode_success(&responses[3]);
        assert_eq!(
            metadata.get("bookmark"),
            Some(&Value::String("quiver:bookmark:1".into()))
        );
    }

    #[test]
    fn test_decode_error_answers_failure_and_continues() {
        // 0x66 is no message signature in any version; the session must
        // stay usable for the RUN that follows.
        let bad = vec![0xB0, 0x66];
        let input = frame(&[hello_payload(), bad, run_payload("RETURN 1")]);
        let (mut s, out) = session(input);
        assert!(s.initialize("quiver/test").unwrap());
        s.run().unwrap();

        let responses = read_responses(out.take());
        assert_eq!(responses.len(), 3);
        assert_eq!(response_signature(&responses[1]), signature::FAILURE);
        assert_eq!(response_signature(&responses[2]), signature::SUCCESS);
    }

    #[test]
    fn test_wire_reset_settles_its_own_interrupt() {
        let input = frame(&[hello_payload(), empty_payload(signature::RESET)]);
        let (mut s, out) = session(input);
        assert!(s.initialize("quiver/test").unwrap());
        s.run().unwrap();

        let responses = read_responses(out.take());
        assert_eq!(responses.len(), 2);
        // The reset must answer SUCCESS, not IGNORED: its own raise is
        // consumed by itself.
        assert_eq!(response_signature(&responses[1]), signature::SUCCESS);
    }

    #[test]
    fn test_external_raise_keeps_resets_ignored() {
        // A raise without a wire reset behind it comes from the kill
        // path, which also stops the session; until then every client
        // reset is net zero on the counter and answers IGNORED.
        let input = frame(&[
            hello_payload(),
            empty_payload(signature::RESET),
            empty_payload(signature::RESET),
        ]);
        let out = SharedBuf::default();
        let interrupt = InterruptSignal::new();
        let mut s = Session::new(
            Cursor::new(input),
            out.clone(),
            3,
            1,
            interrupt.clone(),
            &EchoFactory,
            DEFAULT_MAX_MESSAGE_SIZE,
        );
        assert!(s.initialize("quiver/test").unwrap());

        interrupt.raise();
        s.run().unwrap();

        let responses = read_responses(out.take());
        assert_eq!(responses.len(), 3);
        assert_eq!(response_signature(&responses[1]), signature::IGNORED);
        assert_eq!(response_signature(&responses[2]), signature::IGNORED);
        assert_eq!(interrupt.pending(), 1);
    }

    #[test]
    fn test_stopped_session_reports_unavailable() {
        let input = frame(&[hello_payload(), run_payload("RETURN 1")]);
        let out = SharedBuf::default();
        let interrupt = InterruptSignal::new();
        let mut s = Session::new(
            Cursor::new(input),
            out.clone(),
            3,
            1,
            interrupt.clone(),
            &EchoFactory,
            DEFAULT_MAX_MESSAGE_SIZE,
        );
        assert!(s.initialize("quiver/test").unwrap());

        interrupt.stop();
        s.run().unwrap();

        let responses = read_responses(out.take());
        assert_eq!(responses.len(), 2);
        let mut unpacker = Unpacker::new(&responses[1]);
        let (sig, _) = unpacker.read_struct_header().unwrap();
        assert_eq!(sig, signature::FAILURE);
        match unpacker.unpack().unwrap() {
            Value::Map(map) => {
                assert_eq!(
                    map.get("code"),
                    Some(&Value::String(codes::GENERAL_UNAVAILABLE.into()))
                );
            }
            other => panic!("expected failure map, got {other:?}"),
        }
    }

    #[test]
    fn test_oversize_message_is_fatal() {
        let big = vec![0u8; 200];
        let input = frame(&[hello_payload(), big]);
        let out = SharedBuf::default();
        let mut s = Session::new(
            Cursor::new(input),
            out.clone(),
            3,
            1,
            InterruptSignal::new(),
            &EchoFactory,
            128,
        );
        assert!(s.initialize("quiver/test").unwrap());

        match s.run().unwrap_err() {
            Error::Fatal(failure) => {
                assert_eq!(failure.code, codes::REQUEST_INVALID_FORMAT);
                assert!(failure.is_fatal());
            }
            other => panic!("expected fatal error, got {other:?}"),
        }
        let responses = read_responses(out.take());
        assert_eq!(response_signature(&responses[1]), signature::FAILURE);
    }

    #[test]
    fn test_write_error_classification() {
        let failure = classify_write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(failure.code, codes::TRANSACTION_TERMINATED);
        assert!(failure.is_fatal());

        let failure = classify_write_error(io::Error::other("disk on fire"));
        assert_eq!(failure.code, codes::GENERAL_UNKNOWN);
    }

    #[test]
    fn test_keep_alive_chunks_are_skipped() {
        let mut input = frame(&[hello_payload()]);
        // Two bare NOOPs between messages.
        input.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        input.extend_from_slice(&frame(&[run_payload("RETURN 1")]));
        let (mut s, out) = session(input);
        assert!(s.initialize("quiver/test").unwrap());
        s.run().unwrap();

        let responses = read_responses(out.take());
        assert_eq!(responses.len(), 2);
        assert_eq!(response_signature(&responses[1]), signature::SUCCESS);
    }
}
