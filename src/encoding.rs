//! Chunk codec: delta-of-delta timestamps and Gorilla XOR values packed into an append-only
//! bit stream, plus the 64-bit metadata word persisted next to every chunk.
//!
//! A chunk keeps a committed byte offset so a growing chunk can be shipped incrementally:
//! [`XorChunk::get_chunk_buffer`] hands out only the bytes from that offset onward and
//! [`XorChunk::move_offset`] advances it once the remote write is acknowledged.

use crate::error::TsdbError;
use crate::types::{Sample, Timestamp, Value};

use std::fmt;

/// Identifier of a chunk encoding, stored in the top byte of the metadata word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    None = 0,
    Xor = 1,
}

impl TryFrom<u8> for Encoding {
    type Error = TsdbError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Encoding::None),
            1 => Ok(Encoding::Xor),
            other => Err(TsdbError::UnknownEncoding(other)),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::None => f.write_str("none"),
            Encoding::Xor => f.write_str("XOR"),
        }
    }
}

/// Decoded form of the persisted metadata word.
///
/// Layout (LSB first): `count` bits 0-15, `private` bits 16-31, `length` bits 32-47,
/// `bits` 48-55, `encoding` 56-63. This layout is persisted and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkMeta {
    /// Number of samples encoded in the chunk.
    pub count: u16,
    /// Flags reserved for the owner of the chunk; carried verbatim.
    pub private: u16,
    /// Byte length of the encoded stream.
    pub length: u16,
    /// Bits used in the final byte of the stream (0 for an empty stream).
    pub bits: u8,
    pub encoding: u8,
}

impl ChunkMeta {
    pub fn pack(&self) -> u64 {
        (self.encoding as u64) << 56
            | (self.bits as u64) << 48
            | (self.length as u64) << 32
            | (self.private as u64) << 16
            | self.count as u64
    }

    pub fn unpack(word: u64) -> Self {
        ChunkMeta {
            count: word as u16,
            private: (word >> 16) as u16,
            length: (word >> 32) as u16,
            bits: (word >> 48) as u8,
            encoding: (word >> 56) as u8,
        }
    }
}

/// Packs bytes into little-endian u64 words, zero padding the final word.
pub fn to_u64_words(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks(8)
        .map(|c| {
            let mut word = [0u8; 8];
            word[..c.len()].copy_from_slice(c);
            u64::from_le_bytes(word)
        })
        .collect()
}

/// Inverse of [`to_u64_words`]: unpacks words and truncates to `len` bytes.
pub fn from_u64_words(words: &[u64], len: usize) -> Result<Vec<u8>, TsdbError> {
    if words.len() * 8 < len {
        return Err(TsdbError::corrupt(format!(
            "array holds {} bytes, metadata claims {}",
            words.len() * 8,
            len
        )));
    }
    let mut out: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    out.truncate(len);
    Ok(out)
}

// --- bit stream ---

#[derive(Debug, Clone, Default)]
struct BitStream {
    stream: Vec<u8>,
    /// Bits used in the last byte, 1..=8 once the stream is non-empty.
    used: u8,
}

impl BitStream {
    fn push_bit(&mut self, bit: bool) {
        if self.stream.is_empty() || self.used == 8 {
            self.stream.push(0);
            self.used = 0;
        }
        if bit {
            let last = self.stream.len() - 1;
            self.stream[last] |= 1u8 << (7 - self.used);
        }
        self.used += 1;
    }

    fn push_bits(&mut self, mut v: u64, count: u8) {
        if count == 0 {
            return;
        }
        if count < 64 {
            v &= (1u64 << count) - 1;
        }
        for i in (0..count).rev() {
            self.push_bit(((v >> i) & 1) == 1);
        }
    }

    fn push_varint(&mut self, v: i64) {
        let mut z = ((v << 1) ^ (v >> 63)) as u64;
        while z >= 0x80 {
            self.push_bits((z as u8 | 0x80) as u64, 8);
            z >>= 7;
        }
        self.push_bits(z, 8);
    }

    fn bit_len(&self) -> usize {
        match self.stream.len() {
            0 => 0,
            n => (n - 1) * 8 + self.used as usize,
        }
    }
}

struct BitReader<'a> {
    stream: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> BitReader<'a> {
    fn new(stream: &'a [u8], end: usize) -> Self {
        Self {
            stream,
            pos: 0,
            end,
        }
    }

    fn read_bit(&mut self) -> Result<bool, TsdbError> {
        if self.pos >= self.end {
            return Err(TsdbError::corrupt("bit stream truncated"));
        }
        let byte = self.stream[self.pos / 8];
        let bit = (byte >> (7 - (self.pos % 8))) & 1 == 1;
        self.pos += 1;
        Ok(bit)
    }

    fn read_bits(&mut self, count: u8) -> Result<u64, TsdbError> {
        let mut out = 0u64;
        for _ in 0..count {
            out = (out << 1) | self.read_bit()? as u64;
        }
        Ok(out)
    }

    fn read_varint(&mut self) -> Result<i64, TsdbError> {
        let mut z: u64 = 0;
        let mut shift: u32 = 0;
        for _ in 0..10 {
            let byte = self.read_bits(8)? as u8;
            z |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok((z >> 1) as i64 ^ -((z & 1) as i64));
            }
            shift += 7;
        }
        Err(TsdbError::corrupt("varint too long"))
    }
}

// --- chunk ---

/// Upper bound on the bytes one encoded sample can add to a stream.
pub const MAX_SAMPLE_BYTES: usize = 20;

/// Timestamp delta-of-delta buckets: (control prefix, prefix length, payload bits).
const DOD_BUCKETS: [(u64, u8, u8); 3] = [(0b10, 2, 14), (0b110, 3, 17), (0b1110, 4, 20)];

fn fits_bits(dod: i64, nbits: u8) -> bool {
    let half = 1i64 << (nbits - 1);
    -(half - 1) <= dod && dod <= half
}

/// Append-only XOR chunk.
#[derive(Debug, Clone, Default)]
pub struct XorChunk {
    b: BitStream,
    samples: u16,
    private: u16,
    /// Byte offset already acknowledged by the remote store.
    sent: usize,
}

impl XorChunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a chunk from its persisted metadata word and byte buffer.
    ///
    /// The buffer may carry padding past `length`; it is truncated.
    pub fn from_buffer(meta_word: u64, buffer: &[u8]) -> Result<Self, TsdbError> {
        let meta = ChunkMeta::unpack(meta_word);
        match Encoding::try_from(meta.encoding)? {
            Encoding::Xor => {}
            Encoding::None => {
                return Err(TsdbError::Encoding(
                    "chunk has no encoding and cannot be decoded".to_string(),
                ))
            }
        }
        let length = meta.length as usize;
        if buffer.len() < length {
            return Err(TsdbError::corrupt(format!(
                "chunk buffer holds {} bytes, metadata claims {}",
                buffer.len(),
                length
            )));
        }
        if meta.bits > 8 {
            return Err(TsdbError::corrupt(format!("invalid bit offset {}", meta.bits)));
        }
        let used = match (length, meta.bits) {
            (0, _) => 0,
            (_, 0) => 8,
            (_, b) => b,
        };
        Ok(XorChunk {
            b: BitStream {
                stream: buffer[..length].to_vec(),
                used,
            },
            samples: meta.count,
            private: meta.private,
            sent: 0,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.b.stream
    }

    pub fn encoding(&self) -> Encoding {
        Encoding::Xor
    }

    pub fn num_samples(&self) -> usize {
        self.samples as usize
    }

    pub fn set_private(&mut self, flags: u16) {
        self.private = flags;
    }

    pub fn meta(&self) -> ChunkMeta {
        ChunkMeta {
            count: self.samples,
            private: self.private,
            length: self.b.stream.len() as u16,
            bits: if self.b.stream.is_empty() { 0 } else { self.b.used },
            encoding: Encoding::Xor as u8,
        }
    }

    /// Returns `(metadata word, committed byte offset, bytes from that offset)`.
    pub fn get_chunk_buffer(&self) -> (u64, usize, &[u8]) {
        let offset = self.sent.min(self.b.stream.len());
        (self.meta().pack(), offset, &self.b.stream[offset..])
    }

    /// Byte offset acknowledged by the remote store so far.
    pub fn committed_offset(&self) -> usize {
        self.sent
    }

    /// Commits that bytes up to `offset` reached the remote store. Never moves backwards.
    pub fn move_offset(&mut self, offset: usize) -> Result<(), TsdbError> {
        if offset > self.b.stream.len() {
            return Err(TsdbError::OffsetOutOfRange {
                offset,
                len: self.b.stream.len(),
            });
        }
        if offset > self.sent {
            self.sent = offset;
        }
        Ok(())
    }

    /// Fresh iterator from the first sample; the chunk can be iterated any number of times.
    pub fn iter(&self) -> XorIterator<'_> {
        XorIterator::new(&self.b.stream, self.b.bit_len(), self.samples)
    }

    /// Builds an appender positioned after the last encoded sample.
    ///
    /// Replays the stream to recover the encoder state, so a restored chunk can keep growing.
    pub fn appender(self) -> Result<XorAppender, TsdbError> {
        let mut app = XorAppender {
            chunk: self,
            t: 0,
            v: 0.0,
            t_delta: 0,
            leading: 0,
            trailing: 0,
            sigbits: 0,
        };
        if app.chunk.samples == 0 {
            return Ok(app);
        }
        let mut it = app.chunk.iter();
        for next in it.by_ref() {
            next.map_err(|e| TsdbError::Encoding(format!("cannot resume chunk: {}", e)))?;
        }
        if it.pos() != app.chunk.b.bit_len() {
            return Err(TsdbError::Encoding(format!(
                "chunk stream has {} trailing bits after {} samples",
                app.chunk.b.bit_len() - it.pos(),
                app.chunk.samples
            )));
        }
        app.t = it.t;
        app.v = it.v;
        app.t_delta = it.t_delta;
        app.leading = it.leading;
        app.trailing = it.trailing;
        app.sigbits = it.sigbits;
        Ok(app)
    }
}

/// Encoder state bound to one chunk.
#[derive(Debug, Clone)]
pub struct XorAppender {
    chunk: XorChunk,
    t: Timestamp,
    v: Value,
    t_delta: i64,
    leading: u8,
    trailing: u8,
    sigbits: u8,
}

impl XorAppender {
    pub fn chunk(&self) -> &XorChunk {
        &self.chunk
    }

    pub fn chunk_mut(&mut self) -> &mut XorChunk {
        &mut self.chunk
    }

    pub fn into_chunk(self) -> XorChunk {
        self.chunk
    }

    /// Encodes one sample. Timestamps must be non-decreasing; the codec does not sort.
    pub fn append(&mut self, t: Timestamp, v: Value) -> Result<(), TsdbError> {
        if self.chunk.samples == u16::MAX {
            return Err(TsdbError::Encoding("chunk sample count exhausted".to_string()));
        }
        if self.chunk.b.stream.len() + MAX_SAMPLE_BYTES > u16::MAX as usize {
            return Err(TsdbError::Encoding("chunk byte length exhausted".to_string()));
        }
        let b = &mut self.chunk.b;
        match self.chunk.samples {
            0 => {
                b.push_varint(t);
                b.push_bits(v.to_bits(), 64);
            }
            1 => {
                let t_delta = t.wrapping_sub(self.t);
                b.push_varint(t_delta);
                self.t_delta = t_delta;
                self.write_value(v);
            }
            _ => {
                let t_delta = t.wrapping_sub(self.t);
                let dod = t_delta.wrapping_sub(self.t_delta);
                if dod == 0 {
                    b.push_bit(false);
                } else if let Some(&(prefix, plen, nbits)) =
                    DOD_BUCKETS.iter().find(|(_, _, nbits)| fits_bits(dod, *nbits))
                {
                    b.push_bits(prefix, plen);
                    b.push_bits(dod as u64, nbits);
                } else {
                    b.push_bits(0b1111, 4);
                    b.push_bits(dod as u64, 64);
                }
                self.t_delta = t_delta;
                self.write_value(v);
            }
        }
        self.t = t;
        self.v = v;
        self.chunk.samples += 1;
        Ok(())
    }

    fn write_value(&mut self, v: Value) {
        let b = &mut self.chunk.b;
        let x = self.v.to_bits() ^ v.to_bits();
        if x == 0 {
            b.push_bit(false);
            return;
        }
        b.push_bit(true);
        let leading = x.leading_zeros() as u8;
        let trailing = x.trailing_zeros() as u8;
        if self.sigbits != 0 && leading >= self.leading && trailing >= self.trailing {
            b.push_bit(false);
            b.push_bits(x >> self.trailing, self.sigbits);
        } else {
            let sigbits = 64 - leading - trailing;
            b.push_bit(true);
            b.push_bits(leading as u64, 6);
            b.push_bits((sigbits - 1) as u64, 6);
            b.push_bits(x >> trailing, sigbits);
            self.leading = leading;
            self.trailing = trailing;
            self.sigbits = sigbits;
        }
    }
}

/// Lazy forward-only decoder over a chunk's samples.
///
/// Yields at most `count` items; the first decode error is yielded once and ends iteration.
pub struct XorIterator<'a> {
    r: BitReader<'a>,
    count: u16,
    read: u16,
    t: Timestamp,
    v: Value,
    t_delta: i64,
    leading: u8,
    trailing: u8,
    sigbits: u8,
    failed: bool,
}

impl<'a> XorIterator<'a> {
    fn new(stream: &'a [u8], end: usize, count: u16) -> Self {
        Self {
            r: BitReader::new(stream, end),
            count,
            read: 0,
            t: 0,
            v: 0.0,
            t_delta: 0,
            leading: 0,
            trailing: 0,
            sigbits: 0,
            failed: false,
        }
    }

    fn pos(&self) -> usize {
        self.r.pos
    }

    fn decode_next(&mut self) -> Result<Sample, TsdbError> {
        match self.read {
            0 => {
                self.t = self.r.read_varint()?;
                self.v = f64::from_bits(self.r.read_bits(64)?);
            }
            1 => {
                self.t_delta = self.r.read_varint()?;
                self.t = self.t.wrapping_add(self.t_delta);
                self.read_value()?;
            }
            _ => {
                let mut prefix_len = 0u8;
                while prefix_len < 4 && self.r.read_bit()? {
                    prefix_len += 1;
                }
                let dod = match prefix_len {
                    0 => 0,
                    4 => self.r.read_bits(64)? as i64,
                    n => {
                        let nbits = DOD_BUCKETS[(n - 1) as usize].2;
                        let raw = self.r.read_bits(nbits)? as i64;
                        if raw > (1i64 << (nbits - 1)) {
                            raw - (1i64 << nbits)
                        } else {
                            raw
                        }
                    }
                };
                self.t_delta = self.t_delta.wrapping_add(dod);
                self.t = self.t.wrapping_add(self.t_delta);
                self.read_value()?;
            }
        }
        Ok(Sample::new(self.t, self.v))
    }

    fn read_value(&mut self) -> Result<(), TsdbError> {
        if !self.r.read_bit()? {
            return Ok(());
        }
        if self.r.read_bit()? {
            let leading = self.r.read_bits(6)? as u8;
            let sigbits = self.r.read_bits(6)? as u8 + 1;
            if leading as u32 + sigbits as u32 > 64 {
                return Err(TsdbError::corrupt("invalid XOR bit widths"));
            }
            self.leading = leading;
            self.sigbits = sigbits;
            self.trailing = 64 - leading - sigbits;
        } else if self.sigbits == 0 {
            return Err(TsdbError::corrupt("XOR window reused before initialization"));
        }
        let x = self.r.read_bits(self.sigbits)? << self.trailing;
        self.v = f64::from_bits(self.v.to_bits() ^ x);
        Ok(())
    }
}

impl Iterator for XorIterator<'_> {
    type Item = Result<Sample, TsdbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.read >= self.count {
            return None;
        }
        match self.decode_next() {
            Ok(s) => {
                self.read += 1;
                Some(Ok(s))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Decodes every sample of a chunk, failing on the first corrupt one.
pub fn decode_all(chunk: &XorChunk) -> Result<Vec<Sample>, TsdbError> {
    chunk.iter().collect()
}
