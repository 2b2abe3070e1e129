//! Wire codec primitives
//!
//! Fixed-width little-endian integers, CompactSize counts (P2P payloads and
//! transactions), the 7-bit continuation VarInt (storage records), and
//! 32-byte hashes written verbatim in stream order.

use crate::constants::MAX_COMPACT_SIZE;
use crate::types::HashId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("{0} trailing bytes after decode")]
    TrailingBytes(usize),

    #[error("non-canonical compact size encoding")]
    NonCanonicalCompactSize,

    #[error("declared length {0} exceeds limit")]
    OversizedLength(u64),

    #[error("varint overflows 64 bits")]
    VarIntOverflow,

    #[error("bad magic: expected {expected:02x?}, got {actual:02x?}")]
    BadMagic { expected: [u8; 4], actual: [u8; 4] },

    #[error("checksum mismatch for '{command}'")]
    ChecksumMismatch { command: String },

    #[error("payload of {0} bytes exceeds limit")]
    PayloadTooLarge(usize),

    #[error("malformed command field")]
    InvalidCommand,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("superfluous witness record")]
    SuperfluousWitness,

    #[error("unknown optional transaction data flag {0:#04x}")]
    UnknownTxFlag(u8),

    #[error("string is not valid utf-8")]
    InvalidString,

    #[error("{0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Types with a canonical byte encoding
pub trait Encodable {
    fn encode(&self, w: &mut Writer);
}

/// Types that can be rebuilt from their canonical byte encoding
pub trait Decodable: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError>;
}

/// Encode a value into a fresh buffer
pub fn serialize<T: Encodable + ?Sized>(value: &T) -> Vec<u8> {
    let mut w = Writer::new();
    value.encode(&mut w);
    w.into_inner()
}

/// Decode a value that must span the whole input
pub fn deserialize<T: Decodable>(data: &[u8]) -> Result<T, CodecError> {
    let mut r = Reader::new(data);
    let value = T::decode(&mut r)?;
    r.finish()?;
    Ok(value)
}

/// Decode a value from the front of the input, returning the bytes consumed
pub fn deserialize_partial<T: Decodable>(data: &[u8]) -> Result<(T, usize), CodecError> {
    let mut r = Reader::new(data);
    let value = T::decode(&mut r)?;
    Ok((value, r.position()))
}

/// Number of bytes `write_compact_size(n)` emits
pub fn compact_size_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Cursor over a borrowed byte slice
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fail unless every byte was consumed
    pub fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof { needed: n, remaining: self.remaining() });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Big-endian u16, used for port numbers
    pub fn read_u16_be(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<HashId, CodecError> {
        Ok(HashId(self.read_array()?))
    }

    /// CompactSize: 1, 3, 5 or 9 bytes. Non-minimal encodings are rejected.
    pub fn read_compact_size(&mut self) -> Result<u64, CodecError> {
        let value = match self.read_u8()? {
            0xff => {
                let v = self.read_u64()?;
                if v <= 0xffff_ffff {
                    return Err(CodecError::NonCanonicalCompactSize);
                }
                v
            }
            0xfe => {
                let v = self.read_u32()? as u64;
                if v <= 0xffff {
                    return Err(CodecError::NonCanonicalCompactSize);
                }
                v
            }
            0xfd => {
                let v = self.read_u16()? as u64;
                if v < 0xfd {
                    return Err(CodecError::NonCanonicalCompactSize);
                }
                v
            }
            n => n as u64,
        };
        Ok(value)
    }

    /// CompactSize used as a length or element count
    pub fn read_length(&mut self) -> Result<usize, CodecError> {
        let n = self.read_compact_size()?;
        if n > MAX_COMPACT_SIZE {
            return Err(CodecError::OversizedLength(n));
        }
        Ok(n as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_length()?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_var_str(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidString)
    }

    /// 7-bit continuation VarInt.
    ///
    /// Each byte contributes its low 7 bits; a set high bit means another
    /// byte follows and the accumulator is incremented by one.
    pub fn read_varint(&mut self) -> Result<u64, CodecError> {
        let mut n: u64 = 0;
        loop {
            let byte = self.read_u8()?;
            if n > (u64::MAX >> 7) {
                return Err(CodecError::VarIntOverflow);
            }
            n = (n << 7) | (byte & 0x7f) as u64;
            if byte & 0x80 == 0 {
                return Ok(n);
            }
            if n == u64::MAX {
                return Err(CodecError::VarIntOverflow);
            }
            n += 1;
        }
    }

    /// Read `count` items using the decoder of `T`
    pub fn read_vec<T: Decodable>(&mut self, count: usize) -> Result<Vec<T>, CodecError> {
        // Cap the up-front allocation; a lying count fails on EOF instead.
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            out.push(T::decode(self)?);
        }
        Ok(out)
    }
}

/// Growable output buffer
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Writer { buf: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u16_be(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_hash(&mut self, h: &HashId) {
        self.write_bytes(&h.0);
    }

    pub fn write_compact_size(&mut self, n: u64) {
        match n {
            0..=0xfc => self.write_u8(n as u8),
            0xfd..=0xffff => {
                self.write_u8(0xfd);
                self.write_u16(n as u16);
            }
            0x1_0000..=0xffff_ffff => {
                self.write_u8(0xfe);
                self.write_u32(n as u32);
            }
            _ => {
                self.write_u8(0xff);
                self.write_u64(n);
            }
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_compact_size(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_var_str(&mut self, s: &str) {
        self.write_var_bytes(s.as_bytes());
    }

    /// 7-bit continuation VarInt, the inverse of [`Reader::read_varint`]
    pub fn write_varint(&mut self, mut n: u64) {
        let mut tmp = [0u8; 10];
        let mut len = 0;
        loop {
            tmp[len] = (n & 0x7f) as u8 | if len > 0 { 0x80 } else { 0x00 };
            if n <= 0x7f {
                break;
            }
            n = (n >> 7) - 1;
            len += 1;
        }
        for byte in tmp[..=len].iter().rev() {
            self.buf.push(*byte);
        }
    }

    /// Write a CompactSize count followed by each item
    pub fn write_list<T: Encodable>(&mut self, items: &[T]) {
        self.write_compact_size(items.len() as u64);
        for item in items {
            item.encode(self);
        }
    }
}

impl std::io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

macro_rules! impl_int_codec {
    ($ty:ty, $read:ident, $write:ident) => {
        impl Encodable for $ty {
            fn encode(&self, w: &mut Writer) {
                w.$write(*self);
            }
        }

        impl Decodable for $ty {
            fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
                r.$read()
            }
        }
    };
}

impl_int_codec!(u8, read_u8, write_u8);
impl_int_codec!(u16, read_u16, write_u16);
impl_int_codec!(u32, read_u32, write_u32);
impl_int_codec!(i32, read_i32, write_i32);
impl_int_codec!(u64, read_u64, write_u64);
impl_int_codec!(i64, read_i64, write_i64);
impl_int_codec!(bool, read_bool, write_bool);

impl Encodable for HashId {
    fn encode(&self, w: &mut Writer) {
        w.write_hash(self);
    }
}

impl Decodable for HashId {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.read_hash()
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode(&self, w: &mut Writer) {
        w.write_list(self);
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let count = r.read_length()?;
        r.read_vec(count)
    }
}
