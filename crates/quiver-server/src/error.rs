//! Server error types.

use thiserror::Error;

use crate::status::Failure;

/// Server errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A session failure that ended the connection.
    #[error("fatal session failure: {0}")]
    Fatal(Failure),

    /// Version negotiation failed.
    #[error("handshake error: {0}")]
    Handshake(#[from] quiver_bolt::HandshakeError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
