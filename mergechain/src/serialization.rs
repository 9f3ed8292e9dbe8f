// Copyright (c) 2024 Mergechain Foundation

//! Binary wire and storage format.
//!
//! Every consensus structure is encoded with the same schema on the wire and
//! on disk:
//! - fixed-width integers are little-endian
//! - variable-length data is prefixed with a Bitcoin-style VarUint count
//!   (`< 0xfd` one byte, `0xfd` + u16, `0xfe` + u32, `0xff` + u64)
//! - strings are UTF-8 var-bytes
//!
//! Encoding goes through [`Encode`] into any [`BufMut`], decoding through
//! [`Decode`] from any [`Buf`]. Decoders never trust a length prefix further
//! than the bytes actually remaining in the buffer.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::hash::Hash256;

/// Upper bound for a single var-bytes field.
pub const MAX_VAR_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("length prefix {0} exceeds limit")]
    TooLong(u64),

    #[error("non-canonical VarUint encoding")]
    NonCanonical,

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("{0} trailing bytes after decode")]
    TrailingBytes(usize),
}

/// Types with a canonical binary encoding.
pub trait Encode {
    fn encode<B: BufMut>(&self, buf: &mut B);

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// Types that can be decoded from their canonical binary encoding.
pub trait Decode: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError>;

    /// Decode a value that must occupy the whole slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut buf = bytes;
        let value = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }
        Ok(value)
    }
}

fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::UnexpectedEof {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn read_u8<B: Buf>(buf: &mut B) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_u16<B: Buf>(buf: &mut B) -> Result<u16, CodecError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub fn read_u32<B: Buf>(buf: &mut B) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn read_i32<B: Buf>(buf: &mut B) -> Result<i32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub fn read_u64<B: Buf>(buf: &mut B) -> Result<u64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn read_i64<B: Buf>(buf: &mut B) -> Result<i64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64_le())
}

pub fn read_array<B: Buf, const N: usize>(buf: &mut B) -> Result<[u8; N], CodecError> {
    ensure(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn write_var_uint<B: BufMut>(buf: &mut B, value: u64) {
    if value < 0xfd {
        buf.put_u8(value as u8);
    } else if value <= 0xffff {
        buf.put_u8(0xfd);
        buf.put_u16_le(value as u16);
    } else if value <= 0xffff_ffff {
        buf.put_u8(0xfe);
        buf.put_u32_le(value as u32);
    } else {
        buf.put_u8(0xff);
        buf.put_u64_le(value);
    }
}

/// Read a VarUint, rejecting encodings that use more bytes than needed.
pub fn read_var_uint<B: Buf>(buf: &mut B) -> Result<u64, CodecError> {
    let (value, min) = match read_u8(buf)? {
        0xfd => (read_u16(buf)? as u64, 0xfd),
        0xfe => (read_u32(buf)? as u64, 0x1_0000),
        0xff => (read_u64(buf)?, 0x1_0000_0000),
        small => return Ok(small as u64),
    };
    if value < min {
        return Err(CodecError::NonCanonical);
    }
    Ok(value)
}

/// Read an element count. Every element takes at least one byte, so a count
/// larger than the remaining input is rejected before anything is allocated.
pub fn read_count<B: Buf>(buf: &mut B) -> Result<usize, CodecError> {
    let count = read_var_uint(buf)?;
    if count > buf.remaining() as u64 {
        return Err(CodecError::TooLong(count));
    }
    Ok(count as usize)
}

pub fn write_var_bytes<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    write_var_uint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn read_var_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>, CodecError> {
    let len = read_var_uint(buf)?;
    if len > MAX_VAR_BYTES {
        return Err(CodecError::TooLong(len));
    }
    let len = len as usize;
    ensure(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn write_var_string<B: BufMut>(buf: &mut B, value: &str) {
    write_var_bytes(buf, value.as_bytes());
}

pub fn read_var_string<B: Buf>(buf: &mut B) -> Result<String, CodecError> {
    let bytes = read_var_bytes(buf)?;
    String::from_utf8(bytes).map_err(|e| CodecError::InvalidValue(e.to_string()))
}

pub fn write_list<B: BufMut, T: Encode>(buf: &mut B, items: &[T]) {
    write_var_uint(buf, items.len() as u64);
    for item in items {
        item.encode(buf);
    }
}

pub fn read_list<B: Buf, T: Decode>(buf: &mut B) -> Result<Vec<T>, CodecError> {
    let count = read_count(buf)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(T::decode(buf)?);
    }
    Ok(items)
}

impl Encode for Hash256 {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self);
    }
}

impl Decode for Hash256 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        read_array(buf)
    }
}
