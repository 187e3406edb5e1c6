//! Data log record format.
//!
//! Every mutation is appended to the data log as one record:
//!
//! ```text
//! +-----------+------------+------------+------------+-----------+-------------+
//! | CRC32 (4) | KeyLen (4) | ValLen (4) | HdrCRC (4) | Key (var) | Value (var) |
//! +-----------+------------+------------+------------+-----------+-------------+
//! ```
//!
//! All integers are little-endian. `ValLen == u32::MAX` marks a tombstone
//! (no value bytes follow). `CRC32` covers the lengths, key and value;
//! `HdrCRC` covers the two lengths alone, so a damaged length is caught
//! before it is used to size the payload read.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{EngineError, EngineResult};
use lode_common::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Value length marking a deletion.
pub const TOMBSTONE: u32 = u32::MAX;

/// Fixed record header (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Checksum of lengths, key and value.
    pub checksum: u32,
    /// Key length in bytes.
    pub key_len: u32,
    /// Value length in bytes, or [`TOMBSTONE`].
    pub value_len: u32,
    /// Checksum of the two length fields.
    pub header_checksum: u32,
}

impl RecordHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 16;

    /// Returns true if the record is a deletion.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.value_len == TOMBSTONE
    }

    /// Number of payload bytes that follow the header.
    #[inline]
    pub fn payload_len(&self) -> usize {
        let value = if self.is_tombstone() { 0 } else { self.value_len as usize };
        self.key_len as usize + value
    }

    /// Decodes a header, checking its own checksum and then the lengths
    /// against the engine limits.
    pub fn decode(buf: &mut impl Buf, offset: u64) -> EngineResult<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(EngineError::corrupted(offset, "short header"));
        }
        let header = Self {
            checksum: buf.get_u32_le(),
            key_len: buf.get_u32_le(),
            value_len: buf.get_u32_le(),
            header_checksum: buf.get_u32_le(),
        };
        let computed = header_checksum(header.key_len, header.value_len);
        if computed != header.header_checksum {
            return Err(EngineError::ChecksumMismatch {
                offset,
                expected: header.header_checksum,
                computed,
            });
        }
        if header.key_len as usize > MAX_KEY_SIZE {
            return Err(EngineError::corrupted(
                offset,
                format!("key length {} exceeds limit", header.key_len),
            ));
        }
        if !header.is_tombstone() && header.value_len as usize > MAX_VALUE_SIZE {
            return Err(EngineError::corrupted(
                offset,
                format!("value length {} exceeds limit", header.value_len),
            ));
        }
        Ok(header)
    }

    /// Verifies the checksum against the payload that followed the header.
    pub fn verify(&self, payload: &[u8], offset: u64) -> EngineResult<()> {
        let computed = compute_checksum(self.key_len, self.value_len, payload);
        if computed != self.checksum {
            return Err(EngineError::ChecksumMismatch {
                offset,
                expected: self.checksum,
                computed,
            });
        }
        Ok(())
    }
}

fn header_checksum(key_len: u32, value_len: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key_len.to_le_bytes());
    hasher.update(&value_len.to_le_bytes());
    hasher.finalize()
}

fn compute_checksum(key_len: u32, value_len: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key_len.to_le_bytes());
    hasher.update(&value_len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Encodes a put (`Some(value)`) or delete (`None`) record.
pub fn encode(key: &[u8], value: Option<&[u8]>) -> Bytes {
    let key_len = key.len() as u32;
    let value_len = value.map_or(TOMBSTONE, |v| v.len() as u32);

    let mut payload = BytesMut::with_capacity(key.len() + value.map_or(0, <[u8]>::len));
    payload.put_slice(key);
    if let Some(v) = value {
        payload.put_slice(v);
    }

    let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + payload.len());
    buf.put_u32_le(compute_checksum(key_len, value_len, &payload));
    buf.put_u32_le(key_len);
    buf.put_u32_le(value_len);
    buf.put_u32_le(header_checksum(key_len, value_len));
    buf.put_slice(&payload);
    buf.freeze()
}
