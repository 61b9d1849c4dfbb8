//! Variable-length binary encoding
//!
//! lib0-compatible primitives: unsigned integers as little-endian 7-bit
//! groups with a continuation bit, byte strings and UTF-8 strings as a
//! length prefix followed by the raw bytes.

use thiserror::Error;

/// Errors raised while decoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Unexpected end of message")]
    UnexpectedEof,
    #[error("Variable-length integer overflows 64 bits")]
    VarintOverflow,
    #[error("Invalid UTF-8 string")]
    InvalidUtf8,
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Append-only message writer
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_var_uint(&mut self, mut value: u64) {
        while value > 0x7f {
            self.buf.push(0x80 | (value & 0x7f) as u8);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    /// Length-prefixed byte string
    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_var_uint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_var_string(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    /// Bytes without a length prefix
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received message
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Whether unread bytes remain
    pub fn has_content(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Unread bytes, without consuming them
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        let byte = *self.buf.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_var_uint(&mut self) -> CodecResult<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7f);
            if shift >= 64 || (shift == 63 && bits > 1) {
                return Err(CodecError::VarintOverflow);
            }
            value |= bits << shift;
            if byte < 0x80 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_var_bytes(&mut self) -> CodecResult<&'a [u8]> {
        let len = usize::try_from(self.read_var_uint()?).map_err(|_| CodecError::UnexpectedEof)?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(CodecError::UnexpectedEof)?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_var_string(&mut self) -> CodecResult<&'a str> {
        std::str::from_utf8(self.read_var_bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }
}
