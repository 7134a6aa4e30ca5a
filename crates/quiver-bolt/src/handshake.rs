//! Protocol version negotiation.
//!
//! A connection opens with a fixed 4-byte preamble followed by four 32-bit
//! big-endian version proposals in the client's preference order. The
//! server answers with the first proposal it supports, or zero when none
//! match, and closes the connection in the zero case. Only after a version
//! is agreed does chunked message traffic start.

use std::io::{self, Read, Write};

use crate::error::HandshakeError;

/// The preamble every connection must open with.
pub const BOLT_MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// Protocol version 1: the original vocabulary.
pub const BOLT_V1: u32 = 1;
/// Protocol version 2: adds the temporal and spatial structures.
pub const BOLT_V2: u32 = 2;
/// Protocol version 3: explicit transactions, HELLO replaces INIT.
pub const BOLT_V3: u32 = 3;

/// Versions this implementation can speak.
pub const SUPPORTED_VERSIONS: [u32; 3] = [BOLT_V3, BOLT_V2, BOLT_V1];

/// The response that tells the client no proposal was acceptable.
pub const NO_VERSION: u32 = 0;

/// A client's parsed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Proposed versions in the client's preference order. Unused slots
    /// are zero.
    pub proposals: [u32; 4],
}

impl Handshake {
    /// Read and validate the 20 handshake bytes from a stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, HandshakeError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != BOLT_MAGIC {
            return Err(HandshakeError::InvalidMagic(magic));
        }

        let mut raw = [0u8; 16];
        reader.read_exact(&mut raw)?;
        let mut proposals = [0u32; 4];
        for (i, chunk) in raw.chunks_exact(4).enumerate() {
            proposals[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Self { proposals })
    }

    /// Pick the first proposal this implementation supports.
    ///
    /// The client's preference order decides; zero slots never match.
    pub fn negotiate(&self) -> Option<u32> {
        self.proposals
            .iter()
            .copied()
            .find(|proposal| SUPPORTED_VERSIONS.contains(proposal))
    }
}

/// Write the server's 4-byte version response.
pub fn write_version<W: Write>(writer: &mut W, version: u32) -> io::Result<()> {
    writer.write_all(&version.to_be_bytes())?;
    writer.flush()
}

/// Run the server side of the handshake on a fresh connection.
///
/// Returns the agreed version. A bad preamble gets no response at all; a
/// proposal set with no supported version is answered with zero before the
/// error is returned, and the caller closes the connection either way.
pub fn perform<S: Read + Write>(stream: &mut S) -> Result<u32, HandshakeError> {
    let handshake = Handshake::read_from(stream)?;
    match handshake.negotiate() {
        Some(version) => {
            write_version(stream, version)?;
            Ok(version)
        }
        None => {
            write_version(stream, NO_VERSION)?;
            Err(HandshakeError::NoCommonVersion {
                proposals: handshake.proposals,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct TestStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl TestStream {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for TestStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for TestStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn handshake_bytes(proposals: [u32; 4]) -> Vec<u8> {
        let mut bytes = BOLT_MAGIC.to_vec();
        for proposal in proposals {
            bytes.extend_from_slice(&proposal.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn test_read_parses_proposals() {
        let mut stream = Cursor::new(handshake_bytes([3, 2, 1, 0]));
        let handshake = Handshake::read_from(&mut stream).unwrap();
        assert_eq!(handshake.proposals, [3, 2, 1, 0]);
    }

    #[test]
    fn test_read_rejects_bad_magic() {
        let mut bytes = handshake_bytes([1, 0, 0, 0]);
        bytes[0] = 0x47;
        let mut stream = Cursor::new(bytes);
        match Handshake::read_from(&mut stream).unwrap_err() {
            HandshakeError::InvalidMagic(magic) => {
                assert_eq!(magic, [0x47, 0x60, 0xB0, 0x17]);
            }
            other => panic!("expected InvalidMagic, got {other:?}"),
        }
    }

    #[test]
    fn test_read_truncated_handshake() {
        let mut stream = Cursor::new(BOLT_MAGIC.to_vec());
        match Handshake::read_from(&mut stream).unwrap_err() {
            HandshakeError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn test_negotiate_prefers_client_order() {
        // The client's order wins, not the server's highest version.
        let handshake = Handshake {
            proposals: [1, 2, 3, 0],
        };
        assert_eq!(handshake.negotiate(), Some(1));

        let handshake = Handshake {
            proposals: [3, 2, 1, 0],
        };
        assert_eq!(handshake.negotiate(), Some(3));
    }

    #[test]
    fn test_negotiate_skips_unsupported() {
        let handshake = Handshake {
            proposals: [4, 3, 0, 0],
        };
        assert_eq!(handshake.negotiate(), Some(3));

        let handshake = Handshake {
            proposals: [4, 5, 6, 7],
        };
        assert_eq!(handshake.negotiate(), None);

        let handshake = Handshake {
            proposals: [0, 0, 0, 0],
        };
        assert_eq!(handshake.negotiate(), None);
    }

    #[test]
    fn test_perform_agrees_on_version() {
        let mut stream = TestStream::new(handshake_bytes([3, 2, 1, 0]));
        let version = perform(&mut stream).unwrap();
        assert_eq!(version, 3);
        assert_eq!(stream.output, vec![0x00, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn test_perform_rejects_with_zero() {
        let mut stream = TestStream::new(handshake_bytes([9, 8, 7, 6]));
        match perform(&mut stream).unwrap_err() {
            HandshakeError::NoCommonVersion { proposals } => {
                assert_eq!(proposals, [9, 8, 7, 6]);
            }
            other => panic!("expected NoCommonVersion, got {other:?}"),
        }
        assert_eq!(stream.output, vec![0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_perform_bad_magic_sends_nothing() {
        let mut stream = TestStream::new(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(matches!(
            perform(&mut stream).unwrap_err(),
            HandshakeError::InvalidMagic(_)
        ));
        assert!(stream.output.is_empty());
    }
}
