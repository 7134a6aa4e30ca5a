//! Failure reporting and status codes.
//!
//! Every failure sent to a client carries a status code string and a
//! human-readable message. The code's first segment classifies the
//! failure; drivers branch on it to decide whether to retry.

use std::fmt;

use quiver_bolt::{DecodeError, ResponseMessage};

/// Status codes reported in failure responses.
pub mod codes {
    /// A message that cannot be processed in the current session state.
    pub const REQUEST_INVALID: &str = "Request.Invalid";
    /// A message whose bytes do not decode.
    pub const REQUEST_INVALID_FORMAT: &str = "Request.InvalidFormat";
    /// Work cut short because the connection went away mid-operation.
    pub const TRANSACTION_TERMINATED: &str = "Transaction.Terminated";
    /// An internal error with no more precise classification.
    pub const GENERAL_UNKNOWN: &str = "General.UnknownError";
    /// The server is shutting down or terminated the connection.
    pub const GENERAL_UNAVAILABLE: &str = "General.Unavailable";
}

/// Whether a failure ends the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatality {
    /// The session continues once the failure is acknowledged or reset.
    Recoverable,
    /// The connection is torn down after the failure is reported.
    Fatal,
}

/// A failure on its way to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    /// Status code, such as `Request.Invalid`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Whether the session survives this failure.
    pub fatality: Fatality,
}

impl Failure {
    /// Create a recoverable failure.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            fatality: Fatality::Recoverable,
        }
    }

    /// Create a fatal failure.
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            fatality: Fatality::Fatal,
        }
    }

    /// Whether the session must be torn down after reporting.
    pub fn is_fatal(&self) -> bool {
        self.fatality == Fatality::Fatal
    }

    /// Convert into the wire response carrying this failure.
    pub fn into_response(self) -> ResponseMessage {
        match self.fatality {
            Fatality::Recoverable => ResponseMessage::failure(self.code, self.message),
            Fatality::Fatal => ResponseMessage::fatal_failure(self.code, self.message),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<DecodeError> for Failure {
    /// Classify a decode failure.
    ///
    /// A structurally sound message that this protocol version does not
    /// know is an invalid request; anything else is malformed bytes. Both
    /// are recoverable.
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownMessage(_) => Failure::new(codes::REQUEST_INVALID, err.to_string()),
            _ => Failure::new(codes::REQUEST_INVALID_FORMAT, err.to_string()),
        }
    }
}
