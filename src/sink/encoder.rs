//! Record Stream Encoding
//!
//! Binary container for the records of one sink file. All integers are
//! little-endian.
//!
//! ```text
//! header (once, 26 bytes)
//! ┌──────┬─────────┬──────────┬──────────────────┬────────────┐
//! │ GSNK │ version │ reserved │ sync marker (16) │ header crc │
//! └──────┴─────────┴──────────┴──────────────────┴────────────┘
//!
//! block (per flush with pending records)
//! ┌──────┬───────────┬───────┬─────────────┬─────────────────────────┬─────────────┬──────────────────┐
//! │ BLK0 │ seq (u64) │ count │ payload len │ count × [len u32 bytes] │ running crc │ sync marker (16) │
//! └──────┴───────────┴───────┴─────────────┴─────────────────────────┴─────────────┴──────────────────┘
//! ```
//!
//! `running crc` covers the payloads of every block from 0 through `seq`.
//! The block counter and running checksum live in the encoder and carry over
//! from one destination to the next, which is what lets a file be written as
//! a sequence of independently uploaded parts that only decode correctly
//! once concatenated in order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use rand::Rng;
use std::io::{self, Write};
use thiserror::Error;

const STREAM_MAGIC: &[u8; 4] = b"GSNK";
const BLOCK_MAGIC: &[u8; 4] = b"BLK0";
/// Current stream format version
pub const FORMAT_VERSION: u8 = 1;
pub const SYNC_MARKER_LEN: usize = 16;
/// magic + version + reserved + marker + crc
pub const HEADER_LEN: usize = 4 + 1 + 1 + SYNC_MARKER_LEN + 4;
/// magic + seq + count + payload len
const BLOCK_PREFIX_LEN: usize = 4 + 8 + 4 + 4;
/// running crc + marker
const BLOCK_SUFFIX_LEN: usize = 4 + SYNC_MARKER_LEN;
/// Records are split across blocks once a payload would exceed this
pub const BLOCK_PAYLOAD_MAX: usize = 4 * 1024 * 1024;

/// Per-stream marker repeated after every block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncMarker([u8; SYNC_MARKER_LEN]);

impl SyncMarker {
    pub fn new(bytes: [u8; SYNC_MARKER_LEN]) -> Self {
        SyncMarker(bytes)
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; SYNC_MARKER_LEN];
        rng.fill(&mut bytes);
        SyncMarker(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SYNC_MARKER_LEN] {
        &self.0
    }
}

/// Decoded stream header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u8,
    pub sync_marker: SyncMarker,
}

impl StreamHeader {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..4].copy_from_slice(STREAM_MAGIC);
        buf[4] = self.version;
        buf[5] = 0;
        buf[6..6 + SYNC_MARKER_LEN].copy_from_slice(self.sync_marker.as_bytes());
        let crc = crc32fast::hash(&buf[..HEADER_LEN - 4]);
        buf[HEADER_LEN - 4..].copy_from_slice(&crc.to_le_bytes());
        buf
    }
}

/// Streaming encoder writing the header on creation and one block per flush
///
/// Writes go to `W`, which may be redirected between calls (see
/// [`RetargetingWriter`](crate::sink::RetargetingWriter)). Encoder state only
/// advances once a block has been fully written.
#[derive(Debug)]
pub struct RecordEncoder<W: Write> {
    out: W,
    header: StreamHeader,
    next_block_seq: u64,
    running_crc: Hasher,
    records_written: u64,
}

impl<W: Write> RecordEncoder<W> {
    /// Create the encoder and write the stream header to `out`
    pub fn new(mut out: W, sync_marker: SyncMarker) -> io::Result<Self> {
        let header = StreamHeader {
            version: FORMAT_VERSION,
            sync_marker,
        };
        out.write_all(&header.encode())?;
        Ok(RecordEncoder {
            out,
            header,
            next_block_seq: 0,
            running_crc: Hasher::new(),
            records_written: 0,
        })
    }

    /// Encode `records` as one or more blocks; returns the number of blocks written
    ///
    /// Nothing is written when `records` is empty.
    pub fn append(&mut self, records: &[Bytes]) -> io::Result<u32> {
        let mut blocks = 0;
        let mut start = 0;
        while start < records.len() {
            let mut end = start;
            let mut payload_len = 0usize;
            while end < records.len() {
                let entry = 4 + records[end].len();
                if end > start && payload_len + entry > BLOCK_PAYLOAD_MAX {
                    break;
                }
                payload_len += entry;
                end += 1;
            }
            self.write_block(&records[start..end], payload_len)?;
            blocks += 1;
            start = end;
        }
        Ok(blocks)
    }

    fn write_block(&mut self, records: &[Bytes], payload_len: usize) -> io::Result<()> {
        let payload_len_u32 = u32::try_from(payload_len).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block payload of {} bytes exceeds u32", payload_len),
            )
        })?;

        let mut block = BytesMut::with_capacity(BLOCK_PREFIX_LEN + payload_len + BLOCK_SUFFIX_LEN);
        block.put_slice(BLOCK_MAGIC);
        block.put_u64_le(self.next_block_seq);
        block.put_u32_le(records.len() as u32);
        block.put_u32_le(payload_len_u32);
        let payload_start = block.len();
        for record in records {
            block.put_u32_le(record.len() as u32);
            block.put_slice(record);
        }

        let mut running_crc = self.running_crc.clone();
        running_crc.update(&block[payload_start..]);
        block.put_u32_le(running_crc.clone().finalize());
        block.put_slice(self.header.sync_marker.as_bytes());

        self.out.write_all(&block)?;

        self.running_crc = running_crc;
        self.next_block_seq += 1;
        self.records_written += records.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Blocks written so far
    pub fn blocks_written(&self) -> u64 {
        self.next_block_seq
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Stream decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("stream truncated at offset {offset}: need {needed} more bytes")]
    Truncated { offset: usize, needed: usize },
    #[error("invalid magic at offset {offset}")]
    InvalidMagic { offset: usize },
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("header checksum mismatch")]
    HeaderChecksum,
    #[error("expected block {expected}, found {found}")]
    BlockSequence { expected: u64, found: u64 },
    #[error("sync marker mismatch after block {block}")]
    SyncMarker { block: u64 },
    #[error("running checksum mismatch in block {block}: expected {expected:#010x}, found {found:#010x}")]
    Checksum { block: u64, expected: u32, found: u32 },
    #[error("malformed block {block}: {reason}")]
    MalformedBlock { block: u64, reason: String },
}

/// Everything in a fully decoded stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStream {
    pub header: StreamHeader,
    pub records: Vec<Bytes>,
    pub blocks: u64,
}

/// Block-at-a-time reader over a complete object
#[derive(Debug)]
pub struct RecordReader {
    data: Bytes,
    pos: usize,
    header: StreamHeader,
    next_block_seq: u64,
    running_crc: Hasher,
}

impl RecordReader {
    /// Validate the header and position at the first block
    pub fn new(data: Bytes) -> Result<Self, DecodeError> {
        let mut reader = RecordReader {
            data,
            pos: 0,
            header: StreamHeader {
                version: FORMAT_VERSION,
                sync_marker: SyncMarker::new([0; SYNC_MARKER_LEN]),
            },
            next_block_seq: 0,
            running_crc: Hasher::new(),
        };

        let raw = reader.take(HEADER_LEN)?;
        if &raw[..4] != STREAM_MAGIC {
            return Err(DecodeError::InvalidMagic { offset: 0 });
        }
        let expected = crc32fast::hash(&raw[..HEADER_LEN - 4]);
        let found = (&raw[HEADER_LEN - 4..]).get_u32_le();
        if expected != found {
            return Err(DecodeError::HeaderChecksum);
        }
        if raw[4] != FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(raw[4]));
        }
        let mut marker = [0u8; SYNC_MARKER_LEN];
        marker.copy_from_slice(&raw[6..6 + SYNC_MARKER_LEN]);
        reader.header = StreamHeader {
            version: raw[4],
            sync_marker: SyncMarker::new(marker),
        };
        Ok(reader)
    }

    /// Decode an entire object
    pub fn open(data: Bytes) -> Result<DecodedStream, DecodeError> {
        let mut reader = RecordReader::new(data)?;
        let mut records = Vec::new();
        while let Some(block) = reader.next_block()? {
            records.extend(block);
        }
        Ok(DecodedStream {
            header: reader.header,
            records,
            blocks: reader.next_block_seq,
        })
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Records of the next block, or `None` at a clean end of stream
    pub fn next_block(&mut self) -> Result<Option<Vec<Bytes>>, DecodeError> {
        if self.pos == self.data.len() {
            return Ok(None);
        }

        let block = self.next_block_seq;
        let offset = self.pos;
        let mut prefix = self.take(BLOCK_PREFIX_LEN)?;
        if &prefix[..4] != BLOCK_MAGIC {
            return Err(DecodeError::InvalidMagic { offset });
        }
        prefix.advance(4);
        let seq = prefix.get_u64_le();
        if seq != block {
            return Err(DecodeError::BlockSequence {
                expected: block,
                found: seq,
            });
        }
        let count = prefix.get_u32_le() as usize;
        let payload_len = prefix.get_u32_le() as usize;

        let payload = self.take(payload_len)?;
        self.running_crc.update(&payload);
        let records = split_payload(block, payload, count)?;

        let mut suffix = self.take(BLOCK_SUFFIX_LEN)?;
        let found = suffix.get_u32_le();
        let expected = self.running_crc.clone().finalize();
        if found != expected {
            return Err(DecodeError::Checksum {
                block,
                expected,
                found,
            });
        }
        if &suffix[..] != self.header.sync_marker.as_bytes() {
            return Err(DecodeError::SyncMarker { block });
        }

        self.next_block_seq += 1;
        Ok(Some(records))
    }

    fn take(&mut self, len: usize) -> Result<Bytes, DecodeError> {
        let remaining = self.data.len() - self.pos;
        if remaining < len {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: len - remaining,
            });
        }
        let slice = self.data.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(slice)
    }
}

fn split_payload(block: u64, mut payload: Bytes, count: usize) -> Result<Vec<Bytes>, DecodeError> {
    let malformed = |reason: String| DecodeError::MalformedBlock { block, reason };
    let mut records = Vec::with_capacity(count.min(payload.len() / 4));
    for index in 0..count {
        if payload.remaining() < 4 {
            return Err(malformed(format!("record {} length cut short", index)));
        }
        let len = payload.get_u32_le() as usize;
        if payload.remaining() < len {
            return Err(malformed(format!(
                "record {} declares {} bytes, {} remain",
                index,
                len,
                payload.remaining()
            )));
        }
        records.push(payload.split_to(len));
    }
    if payload.has_remaining() {
        return Err(malformed(format!(
            "{} trailing bytes after {} records",
            payload.remaining(),
            count
        )));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn marker() -> SyncMarker {
        SyncMarker::random(&mut ChaCha8Rng::seed_from_u64(42))
    }

    fn records(items: &[&str]) -> Vec<Bytes> {
        items.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
    }

    #[test]
    fn test_header_only_stream() {
        let encoder = RecordEncoder::new(Vec::new(), marker()).unwrap();
        let data = encoder.into_inner();
        assert_eq!(data.len(), HEADER_LEN);

        let decoded = RecordReader::open(Bytes::from(data)).unwrap();
        assert!(decoded.records.is_empty());
        assert_eq!(decoded.blocks, 0);
        assert_eq!(decoded.header.sync_marker, marker());
    }

    #[test]
    fn test_records_in_order_across_blocks() {
        let mut encoder = RecordEncoder::new(Vec::new(), marker()).unwrap();
        assert_eq!(encoder.append(&records(&["r1", "r2"])).unwrap(), 1);
        assert_eq!(encoder.append(&[]).unwrap(), 0);
        assert_eq!(encoder.append(&records(&["r3", "", "r5"])).unwrap(), 1);
        assert_eq!(encoder.blocks_written(), 2);
        assert_eq!(encoder.records_written(), 5);

        let decoded = RecordReader::open(Bytes::from(encoder.into_inner())).unwrap();
        assert_eq!(decoded.records, records(&["r1", "r2", "r3", "", "r5"]));
        assert_eq!(decoded.blocks, 2);
    }

    #[test]
    fn test_state_continues_across_destinations() {
        let mut encoder = RecordEncoder::new(Vec::new(), marker()).unwrap();
        let header = std::mem::take(encoder.get_mut());
        encoder.append(&records(&["a"])).unwrap();
        let part1 = std::mem::take(encoder.get_mut());
        encoder.append(&records(&["b", "c"])).unwrap();
        let part2 = std::mem::take(encoder.get_mut());

        let concatenated = [header.clone(), part1.clone(), part2.clone()].concat();
        let decoded = RecordReader::open(Bytes::from(concatenated)).unwrap();
        assert_eq!(decoded.records, records(&["a", "b", "c"]));

        // Parts out of order break the block sequence.
        let reordered = [header, part2, part1].concat();
        assert!(matches!(
            RecordReader::open(Bytes::from(reordered)),
            Err(DecodeError::BlockSequence { expected: 0, found: 1 })
        ));
    }

    #[test]
    fn test_duplicate_part_detected() {
        let mut encoder = RecordEncoder::new(Vec::new(), marker()).unwrap();
        let header = std::mem::take(encoder.get_mut());
        encoder.append(&records(&["a"])).unwrap();
        let part = std::mem::take(encoder.get_mut());

        let duplicated = [header, part.clone(), part].concat();
        assert!(matches!(
            RecordReader::open(Bytes::from(duplicated)),
            Err(DecodeError::BlockSequence { expected: 1, found: 0 })
        ));
    }

    #[test]
    fn test_large_batches_split_into_blocks() {
        let big = Bytes::from(vec![7u8; BLOCK_PAYLOAD_MAX / 2]);
        let mut encoder = RecordEncoder::new(Vec::new(), marker()).unwrap();
        let blocks = encoder
            .append(&[big.clone(), big.clone(), big.clone()])
            .unwrap();
        assert_eq!(blocks, 3);

        let decoded = RecordReader::open(Bytes::from(encoder.into_inner())).unwrap();
        assert_eq!(decoded.records.len(), 3);
        assert!(decoded.records.iter().all(|r| *r == big));
    }

    #[test]
    fn test_failed_write_does_not_advance_state() {
        struct Refuse;
        impl Write for Refuse {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "refused"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut encoder = RecordEncoder::new(Vec::new(), marker()).unwrap();
        let header = std::mem::take(encoder.get_mut());
        let mut refusing = RecordEncoder {
            out: Refuse,
            header: *encoder.header(),
            next_block_seq: 0,
            running_crc: Hasher::new(),
            records_written: 0,
        };
        assert!(refusing.append(&records(&["lost"])).is_err());
        assert_eq!(refusing.blocks_written(), 0);
        assert_eq!(refusing.records_written(), 0);

        encoder.append(&records(&["kept"])).unwrap();
        let stream = [header, encoder.into_inner()].concat();
        assert_eq!(
            RecordReader::open(Bytes::from(stream)).unwrap().records,
            records(&["kept"])
        );
    }

    #[test]
    fn test_corruption_detected() {
        let mut encoder = RecordEncoder::new(Vec::new(), marker()).unwrap();
        encoder.append(&records(&["payload"])).unwrap();
        let clean = encoder.into_inner();

        let mut flipped = clean.clone();
        flipped[HEADER_LEN + BLOCK_PREFIX_LEN + 5] ^= 0xff;
        assert!(matches!(
            RecordReader::open(Bytes::from(flipped)),
            Err(DecodeError::Checksum { block: 0, .. })
        ));

        let mut bad_header = clean.clone();
        bad_header[8] ^= 0xff;
        assert_eq!(
            RecordReader::open(Bytes::from(bad_header)).unwrap_err(),
            DecodeError::HeaderChecksum
        );

        let truncated = clean[..clean.len() - 3].to_vec();
        assert!(matches!(
            RecordReader::open(Bytes::from(truncated)),
            Err(DecodeError::Truncated { .. })
        ));

        assert!(matches!(
            RecordReader::open(Bytes::from_static(b"not a stream at all, definitely")),
            Err(DecodeError::InvalidMagic { offset: 0 })
        ));
    }
}
