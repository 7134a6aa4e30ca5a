//! Protocol state machine.
//!
//! One machine instance tracks a session from setup to teardown. Every
//! decoded request goes through [`StateMachine::process`], which checks
//! the request against the current state, drives the statement processor,
//! and records the outcome in the response collector. Exactly one summary
//! response is owed per request, except for the out-of-band interrupt,
//! which answers nothing.
//!
//! Failures come in two strengths. A recoverable failure moves the
//! session to the failed state, where stream requests are answered with
//! ignored until the client acknowledges or resets. A fatal failure
//! closes the machine and surfaces as the error of `process`; the session
//! reports it and tears the connection down.

use std::fmt;
use std::time::Instant;

use quiver_bolt::{RequestMessage, Value, ValueMap};

use crate::handler::{RecordSink, ResponseCollector};
use crate::interrupt::InterruptSignal;
use crate::processor::{ProcessorError, RecordConsumer, StatementProcessor};
use crate::status::{codes, Failure};

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Between requests; no pending result, no open transaction.
    Ready,
    /// An autocommit result awaits transfer.
    Streaming,
    /// Inside an explicit transaction; no pending result.
    TxReady,
    /// Inside an explicit transaction with a result awaiting transfer.
    TxStreaming,
    /// A recoverable failure awaits acknowledgement.
    Failed,
    /// A reset is in flight; requests are ignored until it lands.
    Interrupted,
    /// The session is over.
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Ready => "READY",
            State::Streaming => "STREAMING",
            State::TxReady => "TX_READY",
            State::TxStreaming => "TX_STREAMING",
            State::Failed => "FAILED",
            State::Interrupted => "INTERRUPTED",
            State::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Everything a request needs while it is processed.
pub struct MachineContext<'a> {
    /// The connection's statement processor.
    pub processor: &'a mut dyn StatementProcessor,
    /// Where the summary response accumulates.
    pub collector: &'a mut ResponseCollector,
    /// Where records stream while a result transfers.
    pub records: &'a mut dyn RecordSink,
    /// The connection's interrupt signal.
    pub interrupt: &'a InterruptSignal,
}

/// The per-session protocol state machine.
pub struct StateMachine {
    state: State,
    version: u32,
}

impl StateMachine {
    /// Create a machine in the ready state for a negotiated version.
    pub fn new(version: u32) -> Self {
        Self {
            state: State::Ready,
            version,
        }
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Process one request.
    ///
    /// On `Ok` the outcome sits in the collector, except after an
    /// interrupt, which leaves no outcome at all. `Err` means the failure
    /// is fatal: the machine is closed, nothing was collected, and the
    /// caller reports the failure and ends the session.
    pub fn process(
        &mut self,
        message: RequestMessage,
        ctx: &mut MachineContext<'_>,
    ) -> Result<(), Failure> {
        if self.state == State::Closed {
            return Err(Failure::fatal(codes::REQUEST_INVALID, "session is closed"));
        }

        let name = message.name();
        if matches!(message, RequestMessage::Interrupt) {
            tracing::trace!(from = %self.state, "interrupt");
            self.state = State::Interrupted;
            return Ok(());
        }

        match self.dispatch(message, ctx) {
            Ok(next) => {
                if next != self.state {
                    tracing::trace!(from = %self.state, to = %next, message = name, "transition");
                }
                self.state = next;
                Ok(())
            }
            Err(ProcessorError::Interrupted) => {
                ctx.collector.on_ignored();
                self.state = State::Interrupted;
                Ok(())
            }
            Err(ProcessorError::Failure(failure)) if failure.is_fatal() => {
                self.state = State::Closed;
                Err(failure)
            }
            Err(ProcessorError::Failure(failure)) => {
                tracing::trace!(from = %self.state, message = name, code = %failure.code, "failure");
                ctx.collector.on_failure(failure);
                self.state = State::Failed;
                Ok(())
            }
        }
    }

    fn dispatch(
        &mut self,
        message: RequestMessage,
        ctx: &mut MachineContext<'_>,
    ) -> Result<State, ProcessorError> {
        use RequestMessage::*;

        match (self.state, message) {
            // A pending reset wins over everything on the wire behind it.
            (State::Interrupted, Reset) => self.settle_reset(ctx),
            (State::Interrupted, _) => {
                ctx.collector.on_ignored();
                Ok(State::Interrupted)
            }

            // Reset is legal in every state.
            (_, Reset) => self.settle_reset(ctx),

            (State::Ready, Run { statement, parameters, .. }) => {
                self.run_statement(ctx, &statement, &parameters, State::Streaming)
            }
            (State::TxReady, Run { statement, parameters, .. }) => {
                self.run_statement(ctx, &statement, &parameters, State::TxStreaming)
            }

            (State::Streaming, PullAll) => self.stream(ctx, false, State::Ready),
            (State::Streaming, DiscardAll) => self.stream(ctx, true, State::Ready),
            (State::TxStreaming, PullAll) => self.stream(ctx, false, State::TxReady),
            (State::TxStreaming, DiscardAll) => self.stream(ctx, true, State::TxReady),

            (State::Ready, Begin { extra }) => {
                ctx.processor.begin_transaction(&extra)?;
                Ok(State::TxReady)
            }
            (State::TxReady, Commit) => {
                if let Some(bookmark) = ctx.processor.commit_transaction()? {
                    ctx.collector.set_bookmark(bookmark);
                }
                Ok(State::Ready)
            }
            (State::TxReady, Rollback) => {
                ctx.processor.rollback_transaction()?;
                Ok(State::Ready)
            }

            (State::Failed, AckFailure) => Ok(State::Ready),
            (
                State::Failed,
                Hello { .. } | Run { .. } | PullAll | DiscardAll | Begin { .. } | Commit | Rollback,
            ) => {
                ctx.collector.on_ignored();
                Ok(State::Failed)
            }

            (state, message) => Err(ProcessorError::Failure(Failure::new(
                codes::REQUEST_INVALID,
                format!("cannot process {} in the {} state", message.name(), state),
            ))),
        }
    }

    fn run_statement(
        &self,
        ctx: &mut MachineContext<'_>,
        statement: &str,
        parameters: &ValueMap,
        next: State,
    ) -> Result<State, ProcessorError> {
        let started = Instant::now();
        let metadata = ctx.processor.run(statement, parameters)?;
        let fields: Vec<Value> = metadata
            .fields
            .into_iter()
            .map(Value::String)
            .collect();
        ctx.collector.put_metadata("fields", Value::List(fields));
        ctx.collector.put_metadata(
            "first_record_available_ms",
            started.elapsed().as_millis() as i64,
        );
        Ok(next)
    }

    fn stream(
        &self,
        ctx: &mut MachineContext<'_>,
        discard: bool,
        next: State,
    ) -> Result<State, ProcessorError> {
        let started = Instant::now();
        let mut consumer = StreamConsumer {
            sink: &mut *ctx.records,
            interrupt: ctx.interrupt,
            discard,
        };
        let bookmark = ctx.processor.stream_result(&mut consumer)?;
        if let Some(bookmark) = bookmark {
            ctx.collector.set_bookmark(bookmark);
        }
        if self.version >= 3 {
            ctx.collector.put_metadata(
                "last_record_consumed_ms",
                started.elapsed().as_millis() as i64,
            );
        }
        Ok(next)
    }

    // One reset settles one interrupt. With more raises still pending the
    // reset answers ignored and the session stays interrupted; the reset
    // that drains the counter performs the actual cleanup.
    fn settle_reset(&self, ctx: &mut MachineContext<'_>) -> Result<State, ProcessorError> {
        if ctx.interrupt.consume() > 0 {
            ctx.collector.on_ignored();
            return Ok(State::Interrupted);
        }
        ctx.collector.reset();
        ctx.processor.reset();
        Ok(State::Ready)
    }
}

// Bridges the processor's record callback onto the sink, checking for
// interrupts between records so a runaway stream can be abandoned.
struct StreamConsumer<'a> {
    sink: &'a mut dyn RecordSink,
    interrupt: &'a InterruptSignal,
    discard: bool,
}

impl RecordConsumer for StreamConsumer<'_> {
    fn consume(&mut self, record: Vec<Value>) -> Result<(), ProcessorError> {
        if self.interrupt.is_raised() {
            return Err(ProcessorError::Interrupted);
        }
        if self.discard {
            return Ok(());
        }
        self.sink.emit(record).map_err(ProcessorError::Failure)
    }
}
