//! Chunked message framing.
//!
//! Messages travel as a sequence of chunks, each a 2-byte big-endian size
//! header followed by that many payload bytes, with a zero-size header
//! marking the end of the message. A lone zero header between messages is
//! a no-op chunk that keeps idle connections alive.

use std::io::{self, Read, Write};

use bytes::BytesMut;

/// Default cap on a reassembled message (4 MB). Chunk headers are attacker
/// controlled, so the cap is enforced before each chunk body is read.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Largest payload a single chunk can carry.
pub const MAX_CHUNK_PAYLOAD: usize = 0xFFFF;

/// Reassembles chunked messages from a byte stream.
pub struct ChunkReader<R> {
    reader: R,
    max_message_size: usize,
}

impl<R: Read> ChunkReader<R> {
    /// Create a reader with the default message size cap.
    pub fn new(reader: R) -> Self {
        Self::with_max_message_size(reader, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a reader with an explicit message size cap.
    pub fn with_max_message_size(reader: R, max_message_size: usize) -> Self {
        Self {
            reader,
            max_message_size,
        }
    }

    /// Read the next complete message.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly at a message
    /// boundary and an empty buffer for a no-op chunk. A stream that ends
    /// inside a message is an `UnexpectedEof` error; a message larger than
    /// the cap is `InvalidData`.
    pub fn next_message(&mut self) -> io::Result<Option<BytesMut>> {
        let header = match self.read_first_header()? {
            Some(header) => header,
            None => return Ok(None),
        };
        if header == 0 {
            return Ok(Some(BytesMut::new()));
        }

        let mut message = BytesMut::new();
        let mut chunk_size = header as usize;
        loop {
            if message.len() + chunk_size > self.max_message_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "message size {} exceeds maximum {}",
                        message.len() + chunk_size,
                        self.max_message_size
                    ),
                ));
            }
            let start = message.len();
            message.resize(start + chunk_size, 0);
            self.reader.read_exact(&mut message[start..])?;

            chunk_size = self.read_header()? as usize;
            if chunk_size == 0 {
                return Ok(Some(message));
            }
        }
    }

    // The first header of a message is where a peer may legitimately hang
    // up, so it is read byte by byte to tell a clean close (nothing read)
    // from a connection dropped mid-header.
    fn read_first_header(&mut self) -> io::Result<Option<u16>> {
        let mut header = [0u8; 2];
        let mut filled = 0;
        while filled < header.len() {
            match self.reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside a chunk header",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Some(u16::from_be_bytes(header)))
    }

    fn read_header(&mut self) -> io::Result<u16> {
        let mut header = [0u8; 2];
        self.reader.read_exact(&mut header)?;
        Ok(u16::from_be_bytes(header))
    }
}

/// Chunks outgoing messages onto a byte stream.
///
/// A message is assembled in memory between [`ChunkWriter::begin_message`]
/// and [`ChunkWriter::end_message`], then split into maximal chunks and
/// flushed as one unit.
pub struct ChunkWriter<W> {
    writer: W,
    buf: BytesMut,
    max_message_size: usize,
}

impl<W: Write> ChunkWriter<W> {
    /// Create a writer with the default message size cap.
    pub fn new(writer: W) -> Self {
        Self::with_max_message_size(writer, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a writer with an explicit message size cap.
    pub fn with_max_message_size(writer: W, max_message_size: usize) -> Self {
        Self {
            writer,
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Start assembling a new message, discarding any unfinished one.
    pub fn begin_message(&mut self) {
        self.buf.clear();
    }

    /// Append encoded bytes to the message under assembly.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.buf.len() + data.len() > self.max_message_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "message size {} exceeds maximum {}",
                    self.buf.len() + data.len(),
                    self.max_message_size
                ),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Chunk the assembled message onto the stream and flush it.
    pub fn end_message(&mut self) -> io::Result<()> {
        for chunk in self.buf.chunks(MAX_CHUNK_PAYLOAD) {
            self.writer.write_all(&(chunk.len() as u16).to_be_bytes())?;
            self.writer.write_all(chunk)?;
        }
        self.writer.write_all(&[0, 0])?;
        self.buf.clear();
        self.writer.flush()
    }

    /// Drop the message under assembly without sending anything.
    pub fn abort_message(&mut self) {
        self.buf.clear();
    }

    /// Bytes queued for the message under assembly.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Consume the writer and return the underlying stream.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
