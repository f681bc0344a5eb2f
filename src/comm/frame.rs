//! Decode the data stream as frames, where each frame has an envelope
//! containing only the size of the payload.

use std::io::{Error, ErrorKind};

use super::rwutil;

const HEADER_LEN: usize = rwutil::U32_SIZE;

/// Maximum payload size the header can describe.
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// Practical cap for capability connection messages.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

const FRAME_BUFFER_SIZE: usize = 8 * 1024;

/// Reads frames from a byte stream.
///
/// While the size has a theoretical maximum of 2^32 octets (4 GB),
/// the reader enforces a practical cap.
pub struct FrameReader {
    max_payload_size: usize,
}

impl FrameReader {
    pub fn new(max_payload_size: usize) -> Self {
        if max_payload_size > MAX_PAYLOAD_SIZE {
            // The cap is part of the protocol definition, so exceeding it is a bug.
            panic!("max_payload_size beyond maximum capability of frame");
        }
        FrameReader { max_payload_size }
    }

    /// Read the next frame's payload.
    ///
    /// Returns `None` when the stream ends cleanly on a frame boundary.  An
    /// end of stream inside a frame is an error.
    pub fn read<R: std::io::Read>(&self, source: &mut R) -> Result<Option<Vec<u8>>, Error> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            match source.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        "stream ended inside frame header",
                    ));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        let size = rwutil::get_be_u32(&header) as usize;
        if size > self.max_payload_size {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "payload size exceeded frame maximum",
            ));
        }
        let mut buff = [0u8; FRAME_BUFFER_SIZE];
        rwutil::read_chunked_bytes(source, size, &mut buff).map(Some)
    }
}

/// Writes frames to a byte stream.
pub struct FrameWriter {}

impl FrameWriter {
    pub fn new() -> Self {
        FrameWriter {}
    }

    /// Write one frame, then flush.
    ///
    /// The header and payload go out in a single buffer so concurrent writers
    /// holding the same lock never interleave partial frames.
    pub fn write<W: std::io::Write>(&self, out: &mut W, payload: &[u8]) -> Result<(), Error> {
        let size = u32::try_from(payload.len())
            .map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(payload);
        out.write_all(&buf)?;
        out.flush()
    }
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}
