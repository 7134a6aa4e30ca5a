//! Request and response message types.
//!
//! On the wire every message is a PackStream struct whose signature byte
//! identifies the message and whose fields carry its arguments. The enums
//! here are the decoded, version-independent form the session layer works
//! with; [`crate::registry`] maps between them and the bytes.

use crate::value::{Value, ValueMap};

/// Message signature bytes.
pub mod signature {
    /// Session setup; called INIT before protocol version 3.
    pub const HELLO: u8 = 0x01;
    /// Clear a failure and resume (versions 1 and 2 only).
    pub const ACK_FAILURE: u8 = 0x0E;
    /// Interrupt whatever is in flight and return to a clean session.
    pub const RESET: u8 = 0x0F;
    /// Submit a statement for execution.
    pub const RUN: u8 = 0x10;
    /// Open an explicit transaction (version 3 and later).
    pub const BEGIN: u8 = 0x11;
    /// Commit the open transaction (version 3 and later).
    pub const COMMIT: u8 = 0x12;
    /// Roll back the open transaction (version 3 and later).
    pub const ROLLBACK: u8 = 0x13;
    /// Drop the pending result stream without transferring it.
    pub const DISCARD_ALL: u8 = 0x2F;
    /// Transfer the pending result stream.
    pub const PULL_ALL: u8 = 0x3F;

    /// Request completed; carries result metadata.
    pub const SUCCESS: u8 = 0x70;
    /// One row of a result stream.
    pub const RECORD: u8 = 0x71;
    /// Request was skipped because the session is failed or interrupted.
    pub const IGNORED: u8 = 0x7E;
    /// Request failed; carries a status code and message.
    pub const FAILURE: u8 = 0x7F;
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestMessage {
    /// Session setup with connection metadata (user agent, credentials).
    Hello {
        /// Connection metadata; always carries a `user_agent` entry.
        metadata: ValueMap,
    },
    /// Execute a statement.
    Run {
        /// The statement text.
        statement: String,
        /// Statement parameters.
        parameters: ValueMap,
        /// Request options (version 3 and later; empty before).
        extra: ValueMap,
    },
    /// Transfer all records of the pending result.
    PullAll,
    /// Discard all records of the pending result.
    DiscardAll,
    /// Open an explicit transaction.
    Begin {
        /// Transaction options.
        extra: ValueMap,
    },
    /// Commit the open transaction.
    Commit,
    /// Roll back the open transaction.
    Rollback,
    /// Acknowledge a failure and leave the failed state.
    AckFailure,
    /// Return the session to a clean state.
    Reset,
    /// Out-of-band interrupt raised when a reset arrives.
    ///
    /// This never decodes from the wire; the session injects it ahead of
    /// the [`RequestMessage::Reset`] that caused it.
    Interrupt,
}

impl RequestMessage {
    /// Protocol name of the message, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            RequestMessage::Hello { .. } => "HELLO",
            RequestMessage::Run { .. } => "RUN",
            RequestMessage::PullAll => "PULL_ALL",
            RequestMessage::DiscardAll => "DISCARD_ALL",
            RequestMessage::Begin { .. } => "BEGIN",
            RequestMessage::Commit => "COMMIT",
            RequestMessage::Rollback => "ROLLBACK",
            RequestMessage::AckFailure => "ACK_FAILURE",
            RequestMessage::Reset => "RESET",
            RequestMessage::Interrupt => "INTERRUPT",
        }
    }
}

/// A server response ready for encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMessage {
    /// The request completed.
    Success {
        /// Result metadata.
        metadata: ValueMap,
    },
    /// One row of a result stream.
    Record {
        /// Field values, ordered as announced by the preceding success.
        fields: Vec<Value>,
    },
    /// The request was skipped.
    Ignored,
    /// The request failed but the session can recover.
    Failure {
        /// Status code, such as `Request.Invalid`.
        code: String,
        /// Human-readable description.
        message: String,
    },
    /// The session is beyond recovery and will be closed.
    ///
    /// Encodes identically to [`ResponseMessage::Failure`]; the distinction
    /// only drives connection teardown.
    FatalFailure {
        /// Status code.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

impl ResponseMessage {
    /// Create a success response.
    pub fn success(metadata: ValueMap) -> Self {
        ResponseMessage::Success { metadata }
    }

    /// Create a record response.
    pub fn record(fields: Vec<Value>) -> Self {
        ResponseMessage::Record { fields }
    }

    /// Create an ignored response.
    pub fn ignored() -> Self {
        ResponseMessage::Ignored
    }

    /// Create a recoverable failure response.
    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        ResponseMessage::Failure {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a fatal failure response.
    pub fn fatal_failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        ResponseMessage::FatalFailure {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The wire encoding this response uses.
    pub fn kind(&self) -> ResponseKind {
        match self {
            ResponseMessage::Success { .. } => ResponseKind::Success,
            ResponseMessage::Record { .. } => ResponseKind::Record,
            ResponseMessage::Ignored => ResponseKind::Ignored,
            ResponseMessage::Failure { .. } | ResponseMessage::FatalFailure { .. } => {
                ResponseKind::Failure
            }
        }
    }

    /// Protocol name of the message, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self.kind() {
            ResponseKind::Success => "SUCCESS",
            ResponseKind::Record => "RECORD",
            ResponseKind::Ignored => "IGNORED",
            ResponseKind::Failure => "FAILURE",
        }
    }
}

/// The four wire shapes a response can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    Success,
    Record,
    Ignored,
    Failure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_names() {
        assert_eq!(RequestMessage::Reset.name(), "RESET");
        assert_eq!(
            RequestMessage::Run {
                statement: "RETURN 1".into(),
                parameters: ValueMap::new(),
                extra: ValueMap::new(),
            }
            .name(),
            "RUN"
        );
    }

    #[test]
    fn test_fatal_failure_shares_failure_kind() {
        let fatal = ResponseMessage::fatal_failure("General.UnknownError", "boom");
        assert_eq!(fatal.kind(), ResponseKind::Failure);
        assert_eq!(fatal.name(), "FAILURE");
    }

    #[test]
    fn test_response_constructors() {
        let success = ResponseMessage::success(ValueMap::new());
        assert_eq!(success.kind(), ResponseKind::Success);

        let record = ResponseMessage::record(vec![Value::Int(1)]);
        assert_eq!(record.kind(), ResponseKind::Record);

        assert_eq!(ResponseMessage::ignored().kind(), ResponseKind::Ignored);
    }
}
