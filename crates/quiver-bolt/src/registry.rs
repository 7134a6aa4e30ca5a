//! Per-version message codec registries.
//!
//! Each negotiated protocol version gets a decode table mapping signature
//! bytes to field decoders and an encode table mapping response kinds to
//! encoders. Version differences live entirely in the tables: version 3
//! replaces the setup and run entries, drops ACK_FAILURE, and adds the
//! explicit transaction messages, all without touching the decode loop.

use bytes::Bytes;

use crate::error::{DecodeError, EncodeError};
use crate::message::{signature, RequestMessage, ResponseKind, ResponseMessage};
use crate::packstream::{Packer, Unpacker};
use crate::structs::StructCatalog;
use crate::value::{Value, ValueMap};

/// Decodes the fields of one message, positioned after the struct header.
pub type DecodeFn = fn(&mut Unpacker<'_>) -> Result<RequestMessage, DecodeError>;

/// Encodes one response into PackStream bytes.
pub type EncodeFn = fn(&ResponseMessage) -> Result<Bytes, EncodeError>;

/// One decodable message in a version's vocabulary.
#[derive(Clone, Copy)]
pub struct DecoderEntry {
    /// Signature byte the entry responds to.
    pub signature: u8,
    /// Protocol name under this version, for diagnostics.
    pub name: &'static str,
    /// Exact field count the message must carry.
    pub arity: usize,
    /// Field decoder.
    pub decode: DecodeFn,
}

/// The request vocabulary of one protocol version.
pub struct DecoderRegistry {
    version: u32,
    entries: Vec<DecoderEntry>,
    catalog: StructCatalog,
}

// Versions 1 and 2 share a vocabulary; INIT carries the user agent as a
// separate field and failures are cleared with ACK_FAILURE.
const BASE_DECODERS: &[DecoderEntry] = &[
    DecoderEntry {
        signature: signature::HELLO,
        name: "INIT",
        arity: 2,
        decode: decode_init,
    },
    DecoderEntry {
        signature: signature::RUN,
        name: "RUN",
        arity: 2,
        decode: decode_run_v1,
    },
    DecoderEntry {
        signature: signature::PULL_ALL,
        name: "PULL_ALL",
        arity: 0,
        decode: |_| Ok(RequestMessage::PullAll),
    },
    DecoderEntry {
        signature: signature::DISCARD_ALL,
        name: "DISCARD_ALL",
        arity: 0,
        decode: |_| Ok(RequestMessage::DiscardAll),
    },
    DecoderEntry {
        signature: signature::ACK_FAILURE,
        name: "ACK_FAILURE",
        arity: 0,
        decode: |_| Ok(RequestMessage::AckFailure),
    },
    DecoderEntry {
        signature: signature::RESET,
        name: "RESET",
        arity: 0,
        decode: |_| Ok(RequestMessage::Reset),
    },
];

impl DecoderRegistry {
    /// Build the decode table for a negotiated version.
    pub fn for_version(version: u32) -> Self {
        let mut entries = BASE_DECODERS.to_vec();
        if version >= 3 {
            replace_entry(
                &mut entries,
                DecoderEntry {
                    signature: signature::HELLO,
                    name: "HELLO",
                    arity: 1,
                    decode: decode_hello,
                },
            );
            replace_entry(
                &mut entries,
                DecoderEntry {
                    signature: signature::RUN,
                    name: "RUN",
                    arity: 3,
                    decode: decode_run_v3,
                },
            );
            entries.retain(|entry| entry.signature != signature::ACK_FAILURE);
            entries.push(DecoderEntry {
                signature: signature::BEGIN,
                name: "BEGIN",
                arity: 1,
                decode: decode_begin,
            });
            entries.push(DecoderEntry {
                signature: signature::COMMIT,
                name: "COMMIT",
                arity: 0,
                decode: |_| Ok(RequestMessage::Commit),
            });
            entries.push(DecoderEntry {
                signature: signature::ROLLBACK,
                name: "ROLLBACK",
                arity: 0,
                decode: |_| Ok(RequestMessage::Rollback),
            });
        }
        Self {
            version,
            entries,
            catalog: StructCatalog::for_version(version),
        }
    }

    /// The version the table was built for.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Look up the entry for a signature byte.
    pub fn lookup(&self, signature: u8) -> Option<&DecoderEntry> {
        self.entries.iter().find(|entry| entry.signature == signature)
    }

    /// Decode one complete message payload.
    ///
    /// The payload must hold exactly one message struct; unknown
    /// signatures, wrong field counts, and trailing bytes are all errors.
    pub fn decode(&self, payload: &[u8]) -> Result<RequestMessage, DecodeError> {
        let mut unpacker = Unpacker::with_catalog(payload, &self.catalog);
        let (sig, fields) = unpacker.read_struct_header()?;
        let entry = self
            .lookup(sig)
            .ok_or(DecodeError::UnknownMessage(sig))?;
        if fields != entry.arity {
            return Err(DecodeError::InvalidStructArity {
                signature: sig,
                expected: entry.arity,
                actual: fields,
            });
        }
        let message = (entry.decode)(&mut unpacker)?;
        if !unpacker.is_done() {
            return Err(DecodeError::TrailingBytes(unpacker.remaining()));
        }
        Ok(message)
    }
}

fn replace_entry(entries: &mut Vec<DecoderEntry>, updated: DecoderEntry) {
    match entries.iter_mut().find(|e| e.signature == updated.signature) {
        Some(slot) => *slot = updated,
        None => entries.push(updated),
    }
}

fn decode_init(unpacker: &mut Unpacker<'_>) -> Result<RequestMessage, DecodeError> {
    let user_agent = expect_string(unpacker, "INIT", "user_agent")?;
    let mut metadata = expect_map(unpacker, "INIT", "auth_token")?;
    metadata.insert("user_agent", user_agent);
    Ok(RequestMessage::Hello { metadata })
}

fn decode_hello(unpacker: &mut Unpacker<'_>) -> Result<RequestMessage, DecodeError> {
    let metadata = expect_map(unpacker, "HELLO", "extra")?;
    Ok(RequestMessage::Hello { metadata })
}

fn decode_run_v1(unpacker: &mut Unpacker<'_>) -> Result<RequestMessage, DecodeError> {
    let statement = expect_string(unpacker, "RUN", "statement")?;
    let parameters = expect_map(unpacker, "RUN", "parameters")?;
    Ok(RequestMessage::Run {
        statement,
        parameters,
        extra: ValueMap::new(),
    })
}

fn decode_run_v3(unpacker: &mut Unpacker<'_>) -> Result<RequestMessage, DecodeError> {
    let statement = expect_string(unpacker, "RUN", "statement")?;
    let parameters = expect_map(unpacker, "RUN", "parameters")?;
    let extra = expect_map(unpacker, "RUN", "extra")?;
    Ok(RequestMessage::Run {
        statement,
        parameters,
        extra,
    })
}

fn decode_begin(unpacker: &mut Unpacker<'_>) -> Result<RequestMessage, DecodeError> {
    let extra = expect_map(unpacker, "BEGIN", "extra")?;
    Ok(RequestMessage::Begin { extra })
}

fn expect_string(
    unpacker: &mut Unpacker<'_>,
    message: &'static str,
    field: &'static str,
) -> Result<String, DecodeError> {
    match unpacker.unpack()? {
        Value::String(s) => Ok(s),
        _ => Err(DecodeError::InvalidMessageField {
            message,
            field,
            expected: "String",
        }),
    }
}

fn expect_map(
    unpacker: &mut Unpacker<'_>,
    message: &'static str,
    field: &'static str,
) -> Result<ValueMap, DecodeError> {
    match unpacker.unpack()? {
        Value::Map(map) => Ok(map),
        _ => Err(DecodeError::InvalidMessageField {
            message,
            field,
            expected: "Map",
        }),
    }
}

/// The response encoders of one protocol version.
///
/// The table is identical across versions 1 through 3 today; it is still
/// built per version so a future vocabulary can diverge the same way the
/// decoders do.
pub struct EncoderRegistry {
    version: u32,
    entries: Vec<(ResponseKind, EncodeFn)>,
}

impl EncoderRegistry {
    /// Build the encode table for a negotiated version.
    pub fn for_version(version: u32) -> Self {
        let entries: Vec<(ResponseKind, EncodeFn)> = vec![
            (ResponseKind::Success, encode_success),
            (ResponseKind::Record, encode_record),
            (ResponseKind::Ignored, encode_ignored),
            (ResponseKind::Failure, encode_failure),
        ];
        Self { version, entries }
    }

    /// The version the table was built for.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Encode a response into message payload bytes.
    pub fn encode(&self, response: &ResponseMessage) -> Result<Bytes, EncodeError> {
        let kind = response.kind();
        let encode = self
            .entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, encode)| *encode)
            .ok_or(EncodeError::MissingEncoder(kind))?;
        encode(response)
    }
}

fn encode_success(response: &ResponseMessage) -> Result<Bytes, EncodeError> {
    match response {
        ResponseMessage::Success { metadata } => {
            let mut packer = Packer::new();
            packer.pack_struct_header(signature::SUCCESS, 1)?;
            pack_map(&mut packer, metadata)?;
            Ok(packer.into_bytes())
        }
        other => Err(EncodeError::MissingEncoder(other.kind())),
    }
}

fn encode_record(response: &ResponseMessage) -> Result<Bytes, EncodeError> {
    match response {
        ResponseMessage::Record { fields } => {
            let mut packer = Packer::new();
            packer.pack_struct_header(signature::RECORD, 1)?;
            packer.pack_list_header(fields.len())?;
            for field in fields {
                packer.pack(field)?;
            }
            Ok(packer.into_bytes())
        }
        other => Err(EncodeError::MissingEncoder(other.kind())),
    }
}

fn encode_ignored(response: &ResponseMessage) -> Result<Bytes, EncodeError> {
    match response {
        ResponseMessage::Ignored => {
            let mut packer = Packer::new();
            packer.pack_struct_header(signature::IGNORED, 0)?;
            Ok(packer.into_bytes())
        }
        other => Err(EncodeError::MissingEncoder(other.kind())),
    }
}

fn encode_failure(response: &ResponseMessage) -> Result<Bytes, EncodeError> {
    match response {
        ResponseMessage::Failure { code, message }
        | ResponseMessage::FatalFailure { code, message } => {
            encode_failure_fields(code, message)
        }
        other => Err(EncodeError::MissingEncoder(other.kind())),
    }
}

fn encode_failure_fields(code: &str, message: &str) -> Result<Bytes, EncodeError> {
    let mut packer = Packer::new();
    packer.pack_struct_header(signature::FAILURE, 1)?;
    packer.pack_map_header(2)?;
    packer.pack_string("code")?;
    packer.pack_string(code)?;
    packer.pack_string("message")?;
    packer.pack_string(message)?;
    Ok(packer.into_bytes())
}

fn pack_map(packer: &mut Packer, map: &ValueMap) -> Result<(), EncodeError> {
    packer.pack_map_header(map.len())?;
    for (key, value) in map.iter() {
        packer.pack_string(key)?;
        packer.pack(value)?;
    }
    Ok(())
}

/// Encode a failure without going through a registry.
///
/// Used as the last resort when normal encoding has itself failed, so it
/// cannot fail: if the status strings somehow exceed the format's limits
/// the result degrades to a failure with no detail map entries.
pub fn encode_fallback(code: &str, message: &str) -> Vec<u8> {
    match encode_failure_fields(code, message) {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => vec![0xB1, signature::FAILURE, 0xA0],
    }
}
