//! Bolt wire protocol for Quiver.
//!
//! This crate implements the connection-facing half of the Bolt protocol:
//! the PackStream value codec, chunked message framing, the version
//! handshake, and per-version message codec registries. It is transport
//! agnostic; everything works against `std::io` readers and writers, and
//! the session layer in `quiver-server` drives it over TCP.
//!
//! # Modules
//!
//! - [`value`] - Runtime values exchanged with clients
//! - [`packstream`] - The PackStream binary codec
//! - [`chunk`] - Chunked message framing over byte streams
//! - [`handshake`] - Protocol version negotiation
//! - [`message`] - Typed request and response messages
//! - [`registry`] - Per-version decoder and encoder tables
//! - [`structs`] - Graph, temporal, and spatial structures
//! - [`error`] - Codec and handshake error types
//!
//! # Encoding
//!
//! ```
//! use quiver_bolt::{packstream, Value};
//!
//! let bytes = packstream::pack(&Value::Int(42)).unwrap();
//! assert_eq!(packstream::unpack(&bytes).unwrap(), Value::Int(42));
//! ```

pub mod chunk;
pub mod error;
pub mod handshake;
pub mod message;
pub mod packstream;
pub mod registry;
pub mod structs;
pub mod value;

pub use error::{DecodeError, EncodeError, HandshakeError};

// Re-export commonly used types at crate root
pub use chunk::{ChunkReader, ChunkWriter, DEFAULT_MAX_MESSAGE_SIZE};
pub use handshake::{Handshake, BOLT_MAGIC, SUPPORTED_VERSIONS};
pub use message::{signature, RequestMessage, ResponseKind, ResponseMessage};
pub use packstream::{Packer, Unpacker};
pub use registry::{DecoderRegistry, EncoderRegistry};
pub use structs::StructCatalog;
pub use value::{Struct, Value, ValueMap};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_response_travels_through_framing() {
        let encoder = EncoderRegistry::for_version(3);
        let mut metadata = ValueMap::new();
        metadata.insert("fields", Value::List(vec![Value::String("n".into())]));
        let payload = encoder.encode(&ResponseMessage::success(metadata)).unwrap();

        let mut writer = ChunkWriter::new(Vec::new());
        writer.begin_message();
        writer.write(&payload).unwrap();
        writer.end_message().unwrap();

        let wire = writer.into_inner();
        let mut reader = ChunkReader::new(Cursor::new(wire));
        let message = reader.next_message().unwrap().unwrap();
        assert_eq!(&message[..], &payload[..]);
    }

    #[test]
    fn test_request_travels_through_framing() {
        let mut packer = Packer::new();
        packer.pack_struct_header(signature::RESET, 0).unwrap();
        let payload = packer.into_bytes();

        let mut writer = ChunkWriter::new(Vec::new());
        writer.begin_message();
        writer.write(&payload).unwrap();
        writer.end_message().unwrap();

        let mut reader = ChunkReader::new(Cursor::new(writer.into_inner()));
        let message = reader.next_message().unwrap().unwrap();

        let registry = DecoderRegistry::for_version(3);
        assert_eq!(registry.decode(&message).unwrap(), RequestMessage::Reset);
    }
}
