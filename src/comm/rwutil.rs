//! Read & Write utility functions.

use std::io::{Error, ErrorKind};

/// Number of octets (bytes) in a u32.
pub const U32_SIZE: usize = size_of::<u32>();

/// Convert the slice of U32_SIZE u8 into a u32, using big endian encoding.
#[inline]
pub fn get_be_u32(buff: &[u8; U32_SIZE]) -> u32 {
    u32::from_be_bytes(*buff)
}

/// Read the `count` number of bytes from the reader in chunks.
///
/// Reading in chunks keeps a hostile length prefix from allocating the whole
/// claimed size up front.
pub fn read_chunked_bytes<R: std::io::Read, const COUNT: usize>(
    source: &mut R,
    count: usize,
    buff: &mut [u8; COUNT],
) -> Result<Vec<u8>, Error> {
    let mut payload = Vec::with_capacity(std::cmp::min(COUNT, count));
    let mut count = count;
    while count > 0 {
        let read_count = std::cmp::min(COUNT, count);
        source.read_exact(&mut buff[0..read_count])?;
        payload.extend_from_slice(&buff[0..read_count]);
        count -= read_count;
    }
    Ok(payload)
}

/// Appends big-endian fields to a message body.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Length-prefixed byte string.
    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_bytes(v.as_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads big-endian fields back out of a message body.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "message truncated"))?;
        let ret = &self.buf[self.pos..end];
        self.pos = end;
        Ok(ret)
    }

    pub fn get_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, Error> {
        let b = self.take(U32_SIZE)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_string(&mut self) -> Result<String, Error> {
        String::from_utf8(self.get_bytes()?).map_err(|e| Error::new(ErrorKind::InvalidData, e))
    }

    /// Fails if any bytes remain unread.
    pub fn finish(self) -> Result<(), Error> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::InvalidData, "trailing bytes after message"))
        }
    }
}
