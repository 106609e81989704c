//! # Wire Codec
//!
//! The deterministic binary serializer behind every consensus object on the
//! network: transactions, blocks, packets, and the records in the on-disk
//! stores all pass through the same `Writer`/`Reader` pair.
//!
//! The format has exactly four primitives and no others:
//!
//! - **varint** — unsigned LEB128: little-endian groups of seven bits, high
//!   bit set on every byte except the last. Every multi-byte integer goes
//!   through this, so the format has no endianness to argue about.
//! - **key** — a fixed-width byte string written verbatim (32-byte hashes
//!   and keys, 64-byte signatures).
//! - **blob** — a varint length prefix followed by raw bytes.
//! - **boolean** — one byte, `0` or `1`.
//!
//! The contract for every persistent type `T` is that
//! `T::read(&mut Reader::new(&t.to_bytes())) == t` and that
//! `sha3(t.to_bytes())` is the canonical content hash of `t`. Breaking
//! either property on a consensus type is a hard fork.

use thiserror::Error;

/// The longest legal varint encoding of a `u64` (ten groups of seven bits).
const MAX_VARINT_BYTES: usize = 10;

/// Errors produced while decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("varint does not fit in 64 bits")]
    VarintOverflow,

    #[error("unknown type tag: {0}")]
    UnknownTag(u64),

    #[error("trailing bytes after decode")]
    TrailingBytes,

    #[error("boolean byte must be 0 or 1, got {0}")]
    InvalidBoolean(u8),

    #[error("{0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only serializer over a growable byte buffer.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buffer: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an unsigned LEB128 varint.
    pub fn varint(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7f) as u8;

            value >>= 7;

            if value != 0 {
                byte |= 0x80;
            }

            self.buffer.push(byte);

            if value == 0 {
                break;
            }
        }
    }

    /// Appends a fixed-width key verbatim. The reader must know the width.
    pub fn key<K: AsRef<[u8]>>(&mut self, key: &K) {
        self.buffer.extend_from_slice(key.as_ref());
    }

    /// Appends raw bytes with no length prefix.
    pub fn bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends a varint length prefix followed by the bytes.
    pub fn blob(&mut self, data: &[u8]) {
        self.varint(data.len() as u64);

        self.buffer.extend_from_slice(data);
    }

    /// Appends a boolean as a single byte.
    pub fn boolean(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    /// Appends a varint count followed by each fixed-width key.
    pub fn key_vec<K: AsRef<[u8]>>(&mut self, keys: &[K]) {
        self.varint(keys.len() as u64);

        for key in keys {
            self.key(key);
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Cursor-style deserializer over a byte slice. Every read advances the
/// cursor; `peek_varint` is the single lookahead used for polymorphic
/// decoding (the `type` tag is peeked before dispatching to a variant).
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    input: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, offset: 0 }
    }

    /// Reads an unsigned LEB128 varint.
    pub fn varint(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;

        for i in 0..MAX_VARINT_BYTES {
            let byte = *self
                .input
                .get(self.offset)
                .ok_or(CodecError::UnexpectedEof)?;

            self.offset += 1;

            // The tenth byte may only carry the final single bit of a u64.
            if i == MAX_VARINT_BYTES - 1 && byte > 0x01 {
                return Err(CodecError::VarintOverflow);
            }

            value |= u64::from(byte & 0x7f) << (7 * i as u32);

            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }

        Err(CodecError::VarintOverflow)
    }

    /// Reads a varint without advancing the cursor.
    pub fn peek_varint(&self) -> Result<u64, CodecError> {
        self.clone().varint()
    }

    /// Reads a fixed-width key.
    pub fn key<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let slice = self.take(N)?;

        let mut out = [0u8; N];

        out.copy_from_slice(slice);

        Ok(out)
    }

    /// Reads `count` raw bytes.
    pub fn bytes(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        self.take(count)
    }

    /// Reads a varint length prefix followed by that many bytes.
    pub fn blob(&mut self) -> Result<Vec<u8>, CodecError> {
        let count = self.varint()? as usize;

        Ok(self.take(count)?.to_vec())
    }

    /// Reads a single boolean byte.
    pub fn boolean(&mut self) -> Result<bool, CodecError> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBoolean(other)),
        }
    }

    /// Reads a varint count followed by that many fixed-width keys.
    pub fn key_vec<const N: usize>(&mut self) -> Result<Vec<[u8; N]>, CodecError> {
        let count = self.varint()? as usize;

        // An attacker-controlled count must not drive allocation beyond
        // what the input can actually back.
        if count.saturating_mul(N) > self.remaining() {
            return Err(CodecError::UnexpectedEof);
        }

        let mut keys = Vec::with_capacity(count);

        for _ in 0..count {
            keys.push(self.key::<N>()?);
        }

        Ok(keys)
    }

    /// Bytes left between the cursor and the end of the input.
    pub fn remaining(&self) -> usize {
        self.input.len() - self.offset
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < count {
            return Err(CodecError::UnexpectedEof);
        }

        let slice = &self.input[self.offset..self.offset + count];

        self.offset += count;

        Ok(slice)
    }
}

// ---------------------------------------------------------------------------
// Serializable
// ---------------------------------------------------------------------------

/// A type with a canonical wire form.
pub trait Serializable: Sized {
    /// Appends the canonical encoding of `self` to the writer.
    fn write(&self, writer: &mut Writer);

    /// Decodes one value from the reader, consuming exactly its bytes.
    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError>;

    /// The canonical encoding as an owned buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();

        self.write(&mut writer);

        writer.into_vec()
    }

    /// Decodes a value that must span the entire input.
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);

        let value = Self::read(&mut reader)?;

        if reader.remaining() != 0 {
            return Err(CodecError::TrailingBytes);
        }

        Ok(value)
    }

    /// The size of the canonical encoding, in bytes.
    fn wire_size(&self) -> usize {
        let mut writer = Writer::new();

        self.write(&mut writer);

        writer.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_bytes(value: u64) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.varint(value);
        writer.into_vec()
    }

    #[test]
    fn varint_known_vectors() {
        assert_eq!(varint_bytes(0), vec![0x00]);
        assert_eq!(varint_bytes(1), vec![0x01]);
        assert_eq!(varint_bytes(127), vec![0x7f]);
        assert_eq!(varint_bytes(128), vec![0x80, 0x01]);
        assert_eq!(varint_bytes(300), vec![0xac, 0x02]);
        assert_eq!(varint_bytes(u64::MAX).len(), 10);
    }

    #[test]
    fn varint_round_trip() {
        for value in [
            0u64,
            1,
            127,
            128,
            255,
            16_384,
            u32::MAX as u64,
            u64::MAX - 1,
            u64::MAX,
        ] {
            let bytes = varint_bytes(value);
            let mut reader = Reader::new(&bytes);
            assert_eq!(reader.varint().unwrap(), value);
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn varint_truncated_input_is_eof() {
        // High bit set on the final byte promises a continuation that
        // never arrives.
        let mut reader = Reader::new(&[0x80]);
        assert_eq!(reader.varint(), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn varint_overflow_is_rejected() {
        // Ten continuation bytes followed by anything cannot fit in 64 bits.
        let bytes = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.varint(), Err(CodecError::VarintOverflow));
    }

    #[test]
    fn peek_does_not_advance() {
        let bytes = varint_bytes(4_000);
        let mut reader = Reader::new(&bytes);

        assert_eq!(reader.peek_varint().unwrap(), 4_000);
        assert_eq!(reader.peek_varint().unwrap(), 4_000);
        assert_eq!(reader.varint().unwrap(), 4_000);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn key_round_trip() {
        let key = [0xabu8; 32];

        let mut writer = Writer::new();
        writer.key(&key);

        let mut reader = Reader::new(writer.data());
        assert_eq!(reader.key::<32>().unwrap(), key);
    }

    #[test]
    fn key_vec_round_trip() {
        let keys = vec![[1u8; 32], [2u8; 32], [3u8; 32]];

        let mut writer = Writer::new();
        writer.key_vec(&keys);

        let mut reader = Reader::new(writer.data());
        assert_eq!(reader.key_vec::<32>().unwrap(), keys);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn key_vec_rejects_overstated_count() {
        // Claims 1000 keys but carries none: must fail cleanly instead of
        // allocating for the stated count.
        let mut writer = Writer::new();
        writer.varint(1_000);

        let mut reader = Reader::new(writer.data());
        assert_eq!(reader.key_vec::<32>(), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn blob_round_trip() {
        let payload = b"the quick brown fox".to_vec();

        let mut writer = Writer::new();
        writer.blob(&payload);

        let mut reader = Reader::new(writer.data());
        assert_eq!(reader.blob().unwrap(), payload);
    }

    #[test]
    fn boolean_round_trip_and_rejection() {
        let mut writer = Writer::new();
        writer.boolean(true);
        writer.boolean(false);

        let mut reader = Reader::new(writer.data());
        assert!(reader.boolean().unwrap());
        assert!(!reader.boolean().unwrap());

        let mut bad = Reader::new(&[2u8]);
        assert_eq!(bad.boolean(), Err(CodecError::InvalidBoolean(2)));
    }

    #[test]
    fn mixed_sequence_round_trip() {
        let mut writer = Writer::new();
        writer.varint(1_000);
        writer.key(&[7u8; 32]);
        writer.boolean(true);
        writer.blob(b"payload");
        writer.varint(42);

        let mut reader = Reader::new(writer.data());
        assert_eq!(reader.varint().unwrap(), 1_000);
        assert_eq!(reader.key::<32>().unwrap(), [7u8; 32]);
        assert!(reader.boolean().unwrap());
        assert_eq!(reader.blob().unwrap(), b"payload");
        assert_eq!(reader.varint().unwrap(), 42);
        assert_eq!(reader.remaining(), 0);
    }
}
