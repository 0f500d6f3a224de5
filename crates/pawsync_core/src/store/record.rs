//! Log frame encoding.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! | len u32 | keyspace u8 | flags u8 | seq u64 | key_len u16 | key | value | crc32 u32 |
//! ```
//!
//! `len` covers the whole frame, itself and the CRC included. The CRC is
//! computed over every byte before it.

use crate::error::{CoreError, CoreResult};

/// Namespaces inside the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Keyspace {
    /// Replicated entities.
    Entities,
    /// Change queue items.
    Queue,
    /// Per-user sync state.
    SyncState,
    /// Conflict records.
    Conflicts,
    /// Persisted network samples.
    NetworkSamples,
    /// Integrity check results.
    IntegrityLog,
    /// Engine metadata (migration ledger, watermarks).
    Meta,
}

impl Keyspace {
    /// Every keyspace.
    pub const ALL: [Keyspace; 7] = [
        Keyspace::Entities,
        Keyspace::Queue,
        Keyspace::SyncState,
        Keyspace::Conflicts,
        Keyspace::NetworkSamples,
        Keyspace::IntegrityLog,
        Keyspace::Meta,
    ];

    /// On-disk tag.
    pub const fn as_byte(self) -> u8 {
        match self {
            Keyspace::Entities => 1,
            Keyspace::Queue => 2,
            Keyspace::SyncState => 3,
            Keyspace::Conflicts => 4,
            Keyspace::NetworkSamples => 5,
            Keyspace::IntegrityLog => 6,
            Keyspace::Meta => 7,
        }
    }

    /// Parses an on-disk tag.
    pub fn from_byte(b: u8) -> Option<Self> {
        Keyspace::ALL.into_iter().find(|k| k.as_byte() == b)
    }

    /// Lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Keyspace::Entities => "entities",
            Keyspace::Queue => "queue",
            Keyspace::SyncState => "sync_state",
            Keyspace::Conflicts => "conflicts",
            Keyspace::NetworkSamples => "network_samples",
            Keyspace::IntegrityLog => "integrity_log",
            Keyspace::Meta => "meta",
        }
    }
}

/// Frame flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// The key was deleted.
    pub const TOMBSTONE: Self = Self(0x01);

    /// Raw byte.
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// From a raw byte.
    pub const fn from_byte(b: u8) -> Self {
        Self(b)
    }

    /// Checks the tombstone bit.
    pub const fn is_tombstone(self) -> bool {
        self.0 & 0x01 != 0
    }
}

/// One entry of the store log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Namespace.
    pub keyspace: Keyspace,
    /// Flags.
    pub flags: FrameFlags,
    /// Write sequence.
    pub seq: u64,
    /// Record key.
    pub key: String,
    /// Record bytes; empty for tombstones.
    pub value: Vec<u8>,
}

impl Frame {
    // len (4) + keyspace (1) + flags (1) + seq (8) + key_len (2)
    const HEADER_SIZE: usize = 16;
    const CRC_SIZE: usize = 4;
    /// Encoded bytes a frame adds on top of its key and value.
    pub const OVERHEAD: usize = Self::HEADER_SIZE + Self::CRC_SIZE;

    /// A put frame.
    pub fn put(keyspace: Keyspace, key: impl Into<String>, value: Vec<u8>, seq: u64) -> Self {
        Self {
            keyspace,
            flags: FrameFlags::NONE,
            seq,
            key: key.into(),
            value,
        }
    }

    /// A tombstone frame.
    pub fn tombstone(keyspace: Keyspace, key: impl Into<String>, seq: u64) -> Self {
        Self {
            keyspace,
            flags: FrameFlags::TOMBSTONE,
            seq,
            key: key.into(),
            value: Vec::new(),
        }
    }

    /// Size of the encoded frame.
    pub fn encoded_size(&self) -> usize {
        Self::HEADER_SIZE + self.key.len() + self.value.len() + Self::CRC_SIZE
    }

    /// Encodes the frame.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let key_len = u16::try_from(self.key.len())
            .map_err(|_| CoreError::invalid_operation(format!("key too long: {} bytes", self.key.len())))?;
        let frame_len = u32::try_from(self.encoded_size())
            .map_err(|_| CoreError::invalid_operation("record too large"))?;

        let mut buf = Vec::with_capacity(self.encoded_size());
        buf.extend_from_slice(&frame_len.to_le_bytes());
        buf.push(self.keyspace.as_byte());
        buf.push(self.flags.as_byte());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(self.key.as_bytes());
        buf.extend_from_slice(&self.value);

        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes one frame from the front of `data`, returning it with its length.
    ///
    /// Returns `Ok(None)` when `data` ends mid-frame (torn tail).
    pub fn decode(data: &[u8]) -> CoreResult<Option<(Self, usize)>> {
        if data.len() < Self::HEADER_SIZE + Self::CRC_SIZE {
            return Ok(None);
        }

        let frame_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if frame_len < Self::HEADER_SIZE + Self::CRC_SIZE {
            return Err(CoreError::corruption(format!("frame length {frame_len} too small")));
        }
        if data.len() < frame_len {
            return Ok(None);
        }

        let body = &data[..frame_len - Self::CRC_SIZE];
        let stored_crc = u32::from_le_bytes([
            data[frame_len - 4],
            data[frame_len - 3],
            data[frame_len - 2],
            data[frame_len - 1],
        ]);
        let computed_crc = compute_crc32(body);
        if stored_crc != computed_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let keyspace = Keyspace::from_byte(data[4])
            .ok_or_else(|| CoreError::corruption(format!("unknown keyspace tag {}", data[4])))?;
        let flags = FrameFlags::from_byte(data[5]);
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&data[6..14]);
        let seq = u64::from_le_bytes(seq_bytes);
        let key_len = u16::from_le_bytes([data[14], data[15]]) as usize;

        let key_end = Self::HEADER_SIZE + key_len;
        if key_end > body.len() {
            return Err(CoreError::corruption("key overruns frame"));
        }
        let key = std::str::from_utf8(&data[Self::HEADER_SIZE..key_end])
            .map_err(|_| CoreError::corruption("key is not utf-8"))?
            .to_string();
        let value = body[key_end..].to_vec();

        Ok(Some((
            Self {
                keyspace,
                flags,
                seq,
                key,
                value,
            },
            frame_len,
        )))
    }
}

/// CRC32 (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn frame_roundtrip_with_trailing_bytes() {
        let frame = Frame::put(Keyspace::Queue, "item-1", vec![1, 2, 3], 9);
        let mut bytes = frame.encode().unwrap();
        let len = bytes.len();
        bytes.extend_from_slice(&[0xAA, 0xBB]);

        let (decoded, used) = Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(used, len);
    }

    #[test]
    fn torn_tail_is_not_an_error() {
        let bytes = Frame::tombstone(Keyspace::Entities, "dog/1", 3).encode().unwrap();
        assert!(Frame::decode(&bytes[..bytes.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn flipped_bit_fails_crc() {
        let mut bytes = Frame::put(Keyspace::Meta, "k", b"value".to_vec(), 1).encode().unwrap();
        bytes[18] ^= 0x01;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }
}
