//! Protocol error types.

use thiserror::Error;

use crate::message::ResponseKind;

/// Errors raised while decoding PackStream bytes or message structs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended before the value was complete.
    #[error("unexpected end of input")]
    UnexpectedEndOfInput,

    /// A marker byte that does not start any known value.
    #[error("unknown marker byte 0x{0:02X}")]
    UnknownMarker(u8),

    /// A nested structure whose signature is not in this version's catalog.
    #[error("unsupported struct signature 0x{0:02X}")]
    UnsupportedStruct(u8),

    /// A known structure carried the wrong number of fields.
    #[error("struct 0x{signature:02X} expects {expected} fields, got {actual}")]
    InvalidStructArity {
        signature: u8,
        expected: usize,
        actual: usize,
    },

    /// A message payload did not start with a struct marker.
    #[error("expected a message struct, found marker 0x{0:02X}")]
    ExpectedStruct(u8),

    /// A map key decoded to something other than a string.
    #[error("map key must be a string")]
    InvalidMapKey,

    /// A string value was not valid UTF-8.
    #[error("invalid utf-8 in string value")]
    InvalidUtf8,

    /// Value nesting deeper than the decoder allows.
    #[error("value nesting exceeds maximum depth")]
    NestingTooDeep,

    /// A message signature with no decoder in the active protocol version.
    #[error("message signature 0x{0:02X} not supported in this protocol version")]
    UnknownMessage(u8),

    /// A message field held a value of the wrong type.
    #[error("{message} field '{field}' must be a {expected}")]
    InvalidMessageField {
        message: &'static str,
        field: &'static str,
        expected: &'static str,
    },

    /// Bytes left over after the message struct was fully decoded.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Errors raised while encoding values or responses.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// Structures carry at most 15 fields on the wire.
    #[error("struct cannot carry {0} fields (limit is 15)")]
    StructTooLarge(usize),

    /// A string, list, or map too large for a 32-bit length header.
    #[error("value with {0} elements exceeds the 32-bit length limit")]
    ValueTooLarge(usize),

    /// No encoder registered for a response kind. This is a server bug,
    /// never a client-triggerable condition.
    #[error("no encoder registered for {0:?} responses")]
    MissingEncoder(ResponseKind),
}

/// Errors raised during the version negotiation handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The connection failed while exchanging handshake bytes.
    #[error("handshake io error: {0}")]
    Io(#[from] std::io::Error),

    /// The client did not open with the Bolt magic preamble.
    #[error("invalid handshake preamble {0:02X?}")]
    InvalidMagic([u8; 4]),

    /// None of the client's proposed versions is supported.
    #[error("no common protocol version in proposals {proposals:?}")]
    NoCommonVersion {
        /// The four versions the client offered, in preference order.
        proposals: [u32; 4],
    },
}
