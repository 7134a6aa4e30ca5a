//! Statement execution interface.
//!
//! The session layer never talks to the query engine directly; it drives
//! a [`StatementProcessor`] owned by the connection. The engine side
//! implements the trait, the session side calls it in the order the
//! protocol state machine allows: a statement is submitted with
//! [`StatementProcessor::run`], then its records are transferred or
//! discarded with exactly one [`StatementProcessor::stream_result`] call.

use quiver_bolt::{Value, ValueMap};

use crate::interrupt::InterruptSignal;
use crate::status::Failure;

/// Metadata announced when a statement is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementMetadata {
    /// Names of the fields each record will carry, in record order.
    pub fields: Vec<String>,
}

/// An opaque marker identifying a committed unit of work.
///
/// Clients chain bookmarks across sessions to read their own writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bookmark(String);

impl Bookmark {
    /// Create a bookmark from its wire representation.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The wire representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Why a processor call stopped.
#[derive(Debug, PartialEq)]
pub enum ProcessorError {
    /// The operation failed; the failure is reported to the client.
    Failure(Failure),
    /// An interrupt was observed; the session is resetting and no
    /// failure is reported.
    Interrupted,
}

impl From<Failure> for ProcessorError {
    fn from(failure: Failure) -> Self {
        ProcessorError::Failure(failure)
    }
}

/// Receives the records of one result stream.
pub trait RecordConsumer {
    /// Accept one record.
    fn consume(&mut self, record: Vec<Value>) -> Result<(), ProcessorError>;
}

/// Executes statements on behalf of one session.
///
/// A processor is single-threaded from the session's point of view, but
/// it moves to the session thread, hence `Send`. Long-running work must
/// poll the connection's [`InterruptSignal`] and bail out with
/// [`ProcessorError::Interrupted`] when it is raised.
pub trait StatementProcessor: Send {
    /// Submit a statement. On success the result stream is pending and
    /// must be transferred or discarded before the next statement.
    fn run(
        &mut self,
        statement: &str,
        parameters: &ValueMap,
    ) -> Result<StatementMetadata, ProcessorError>;

    /// Feed every record of the pending result to `consumer`.
    ///
    /// Returns the bookmark of the work completed, if this stream ended
    /// an autocommit statement. Inside an explicit transaction nothing is
    /// durable yet and the result is `None`.
    fn stream_result(
        &mut self,
        consumer: &mut dyn RecordConsumer,
    ) -> Result<Option<Bookmark>, ProcessorError>;

    /// Open an explicit transaction.
    fn begin_transaction(&mut self, extra: &ValueMap) -> Result<(), ProcessorError>;

    /// Commit the open transaction and return its bookmark.
    fn commit_transaction(&mut self) -> Result<Option<Bookmark>, ProcessorError>;

    /// Roll back the open transaction.
    fn rollback_transaction(&mut self) -> Result<(), ProcessorError>;

    /// Discard all session state: pending results, open transactions.
    ///
    /// Called when the session resets; must not fail.
    fn reset(&mut self) {}
}

/// Creates a processor for each accepted connection.
pub trait ProcessorFactory: Send + Sync {
    /// Build the processor backing one connection.
    fn create(&self, connection_id: u64, interrupt: InterruptSignal) -> Box<dyn StatementProcessor>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::codes;

    #[test]
    fn test_bookmark_representation() {
        let bookmark = Bookmark::new("quiver:bookmark:17");
        assert_eq!(bookmark.as_str(), "quiver:bookmark:17");
    }

    #[test]
    fn test_failure_converts_to_processor_error() {
        let err: ProcessorError = Failure::new(codes::REQUEST_INVALID, "bad").into();
        match err {
            ProcessorError::Failure(f) => assert_eq!(f.code, codes::REQUEST_INVALID),
            other => panic!("expected Failure, got {other:?}"),
        }
    }
}
