//! On-disk layout of the value store.
//!
//! One memory-mapped file, three segments:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header   magic │ version │ file_size │ arena_end │           │
//! │          n_entries │ n_slots │ slot_offset │ crc32 │ pad     │  48 B
//! ├──────────────────────────────────────────────────────────────┤
//! │ Slot[n_slots] of { offset: u32, hash: u32 }                  │
//! │   offset 0 = empty, 0xFFFF_FFFF = tombstone                  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Record arena (append-only)                                   │
//! │   { magic │ key_len │ value_len │ pad │ key │ value } …      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers little-endian. The header CRC covers the 40 bytes that
//! precede the CRC field; it is rewritten whenever the header changes, so
//! a reopened file either validates or is rejected as corrupt. Growth may
//! relocate the slot table (`slot_offset` names its current position);
//! records never move.

use crate::error::StoreError;

/// File and record magic.
pub const STORE_MAGIC: u32 = 0xFDB2_0024;
pub const STORE_VERSION: u32 = 2;

pub const KEY_MAX: usize = 256;

pub const HEADER_LEN: usize = 48;
/// The CRC field sits at this offset and covers the bytes before it.
pub const CRC_OFFSET: usize = 40;

pub const SLOT_LEN: usize = 8;
pub const RECORD_HEADER_LEN: usize = 16;

pub const SLOT_EMPTY: u32 = 0;
pub const SLOT_TOMBSTONE: u32 = u32::MAX;

/// Parsed file header. The store keeps one in memory and mirrors every
/// change back into the mapped bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub file_size: u64,
    pub arena_end: u64,
    pub n_entries: u32,
    pub n_slots: u32,
    pub slot_offset: u64,
    pub crc32: u32,
}

impl Header {
    /// Header for a freshly initialized file: slot table directly after the
    /// header, arena starting right behind the table.
    pub fn fresh(file_size: u64, n_slots: u32) -> Self {
        let slot_offset = HEADER_LEN as u64;
        let arena_end = slot_offset + n_slots as u64 * SLOT_LEN as u64;
        Self {
            magic: STORE_MAGIC,
            version: STORE_VERSION,
            file_size,
            arena_end,
            n_entries: 0,
            n_slots,
            slot_offset,
            crc32: 0,
        }
    }

    pub fn read_from(buf: &[u8]) -> Result<Self, StoreError> {
        if buf.len() < HEADER_LEN {
            return Err(StoreError::Corrupt("file shorter than header"));
        }
        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        let u64_at = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
        Ok(Self {
            magic: u32_at(0),
            version: u32_at(4),
            file_size: u64_at(8),
            arena_end: u64_at(16),
            n_entries: u32_at(24),
            n_slots: u32_at(28),
            slot_offset: u64_at(32),
            crc32: u32_at(40),
        })
    }

    /// Serializes the header, stamping a fresh CRC over the leading bytes.
    pub fn write_to(&mut self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.file_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.arena_end.to_le_bytes());
        buf[24..28].copy_from_slice(&self.n_entries.to_le_bytes());
        buf[28..32].copy_from_slice(&self.n_slots.to_le_bytes());
        buf[32..40].copy_from_slice(&self.slot_offset.to_le_bytes());
        self.crc32 = crc32fast::hash(&buf[..CRC_OFFSET]);
        buf[40..44].copy_from_slice(&self.crc32.to_le_bytes());
        buf[44..HEADER_LEN].fill(0);
    }

    /// Open-time validation: magic, version, checksum, and segment bounds.
    pub fn validate(&self, buf: &[u8], mapped_len: u64) -> Result<(), StoreError> {
        if self.magic != STORE_MAGIC {
            return Err(StoreError::BadMagic);
        }
        if self.version != STORE_VERSION {
            return Err(StoreError::BadVersion {
                found: self.version,
            });
        }
        if self.crc32 != crc32fast::hash(&buf[..CRC_OFFSET]) {
            return Err(StoreError::BadChecksum);
        }
        if self.file_size > mapped_len {
            return Err(StoreError::Corrupt("recorded file size exceeds the file"));
        }
        let table_end = self
            .slot_offset
            .checked_add(self.n_slots as u64 * SLOT_LEN as u64)
            .ok_or(StoreError::Corrupt("slot table offset overflow"))?;
        if self.slot_offset < HEADER_LEN as u64 || table_end > self.file_size {
            return Err(StoreError::Corrupt("slot table out of bounds"));
        }
        if self.arena_end < table_end || self.arena_end > self.file_size {
            return Err(StoreError::Corrupt("arena end out of bounds"));
        }
        if self.n_slots == 0 || !self.n_slots.is_power_of_two() {
            return Err(StoreError::Corrupt("slot count is not a power of two"));
        }
        Ok(())
    }
}

/// One hash-table slot as stored on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    /// File offset of the record, or the empty/tombstone sentinel.
    pub offset: u32,
    pub hash: u32,
}

impl Slot {
    pub fn read_at(buf: &[u8], pos: usize) -> Self {
        Self {
            offset: u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()),
            hash: u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap()),
        }
    }

    pub fn write_at(self, buf: &mut [u8], pos: usize) {
        buf[pos..pos + 4].copy_from_slice(&self.offset.to_le_bytes());
        buf[pos + 4..pos + 8].copy_from_slice(&self.hash.to_le_bytes());
    }

    pub fn is_empty(self) -> bool {
        self.offset == SLOT_EMPTY
    }

    pub fn is_tombstone(self) -> bool {
        self.offset == SLOT_TOMBSTONE
    }
}

/// Record header preceding each `{key, value}` pair in the arena.
#[derive(Clone, Copy, Debug)]
pub struct RecordHeader {
    pub magic: u32,
    pub key_len: u32,
    pub value_len: u32,
}

impl RecordHeader {
    pub fn read_at(buf: &[u8], pos: usize) -> Result<Self, StoreError> {
        if pos + RECORD_HEADER_LEN > buf.len() {
            return Err(StoreError::Corrupt("record header out of bounds"));
        }
        let u32_at = |o: usize| u32::from_le_bytes(buf[pos + o..pos + o + 4].try_into().unwrap());
        let hdr = Self {
            magic: u32_at(0),
            key_len: u32_at(4),
            value_len: u32_at(8),
        };
        if hdr.magic != STORE_MAGIC {
            return Err(StoreError::Corrupt("record magic mismatch"));
        }
        Ok(hdr)
    }

    pub fn write_at(self, buf: &mut [u8], pos: usize) {
        buf[pos..pos + 4].copy_from_slice(&self.magic.to_le_bytes());
        buf[pos + 4..pos + 8].copy_from_slice(&self.key_len.to_le_bytes());
        buf[pos + 8..pos + 12].copy_from_slice(&self.value_len.to_le_bytes());
        buf[pos + 12..pos + 16].fill(0);
    }
}
