//! Append-only mmap key-value store.
//!
//! Spill target for large event payloads and the persistence backend for
//! captured changes. Records are only ever appended; a delete tombstones
//! the slot and leaves the bytes in the arena. One readers-writer lock
//! guards the slot table and the arena together: lookups take it shared,
//! mutation (including growth and table relocation) takes it exclusive.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use pagewatch_core::hash::fnv1a_32;
use pagewatch_mmap::MmapFileMut;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::layout::{
    Header, RecordHeader, Slot, HEADER_LEN, KEY_MAX, RECORD_HEADER_LEN, SLOT_LEN, SLOT_TOMBSTONE,
    STORE_MAGIC,
};

/// Tunables for [`ValueStore::open`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Initial (and minimum) file size.
    pub initial_capacity: u64,
    /// Initial slot count; must be a power of two.
    pub initial_slots: u32,
    /// Per-record value cap.
    pub value_max: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            initial_capacity: 1 << 20,
            initial_slots: 16_384,
            value_max: 100 * 1024,
        }
    }
}

struct StoreInner {
    mm: MmapFileMut,
    header: Header,
    value_max: usize,
}

/// Append-only key→bytes store over one memory-mapped file.
pub struct ValueStore {
    path: PathBuf,
    inner: RwLock<StoreInner>,
}

impl std::fmt::Debug for ValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStore").field("path", &self.path).finish()
    }
}

enum Probe {
    /// Key present at this slot index, record at this offset.
    Found { slot: usize, record: usize },
    /// Key absent; this slot index is where it would be inserted.
    Vacant { slot: usize },
    /// Every slot is occupied or tombstoned.
    Exhausted,
}

impl ValueStore {
    /// Opens (or creates) a store file.
    ///
    /// An existing file is validated: magic, version, header CRC, and
    /// segment bounds. Validation failure rejects the file; the caller
    /// decides whether to proceed without persistence.
    pub fn open(path: impl AsRef<Path>, opts: StoreOptions) -> Result<Self, StoreError> {
        assert!(
            opts.initial_slots.is_power_of_two(),
            "slot count must be a power of 2"
        );
        let path = path.as_ref().to_path_buf();
        let min_len = opts
            .initial_capacity
            .max(HEADER_LEN as u64 + opts.initial_slots as u64 * SLOT_LEN as u64);
        let mut mm = MmapFileMut::open_or_create(&path, min_len)?;

        let raw_magic = u32::from_le_bytes(mm.as_slice()[0..4].try_into().unwrap());
        let header = if raw_magic == 0 {
            // Fresh file (or one too short to have been initialized; the
            // mapping extended it with zeroes).
            let mut header = Header::fresh(mm.len() as u64, opts.initial_slots);
            header.write_to(&mut mm.as_mut_slice()[..HEADER_LEN]);
            mm.flush_async()?;
            info!(path = %path.display(), slots = opts.initial_slots, "value store created");
            header
        } else {
            let header = Header::read_from(mm.as_slice())?;
            header.validate(mm.as_slice(), mm.len() as u64)?;
            info!(
                path = %path.display(),
                entries = header.n_entries,
                arena_end = header.arena_end,
                "value store opened"
            );
            header
        };

        Ok(Self {
            path,
            inner: RwLock::new(StoreInner {
                mm,
                header,
                value_max: opts.value_max,
            }),
        })
    }

    /// Inserts or overwrites a key. The new record is appended to the
    /// arena; an overwritten record's bytes stay behind as dead space.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let key_bytes = key.as_bytes();
        if key_bytes.is_empty() || key_bytes.len() > KEY_MAX {
            return Err(StoreError::KeyTooLong);
        }
        let mut inner = self.inner.write().unwrap();
        if value.len() > inner.value_max {
            return Err(StoreError::ValueTooLarge {
                len: value.len(),
                max: inner.value_max,
            });
        }

        // Keep the load factor at or below 3/4 counting the new entry.
        if (inner.header.n_entries as u64 + 1) * 4 > inner.header.n_slots as u64 * 3 {
            grow_table(&mut inner)?;
        }

        let hash = fnv1a_32(key_bytes);
        let (slot, existing) = match probe(&inner, key_bytes, hash) {
            Probe::Found { slot, .. } => (slot, true),
            Probe::Vacant { slot } => (slot, false),
            Probe::Exhausted => return Err(StoreError::NoSpace),
        };

        let record_len = RECORD_HEADER_LEN + key_bytes.len() + value.len();
        let record_offset = reserve_arena(&mut inner, record_len)?;

        let buf = inner.mm.as_mut_slice();
        RecordHeader {
            magic: STORE_MAGIC,
            key_len: key_bytes.len() as u32,
            value_len: value.len() as u32,
        }
        .write_at(buf, record_offset);
        let key_start = record_offset + RECORD_HEADER_LEN;
        buf[key_start..key_start + key_bytes.len()].copy_from_slice(key_bytes);
        let value_start = key_start + key_bytes.len();
        buf[value_start..value_start + value.len()].copy_from_slice(value);

        let slot_pos = inner.header.slot_offset as usize + slot * SLOT_LEN;
        Slot {
            offset: record_offset as u32,
            hash,
        }
        .write_at(inner.mm.as_mut_slice(), slot_pos);

        inner.header.arena_end = (record_offset + record_len) as u64;
        if !existing {
            inner.header.n_entries += 1;
        }
        write_header(&mut inner);
        Ok(())
    }

    /// Returns the bytes stored under a key.
    pub fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.read().unwrap();
        let (_, record) = find(&inner, key)?;
        let hdr = RecordHeader::read_at(inner.mm.as_slice(), record)?;
        let value_start = record + RECORD_HEADER_LEN + hdr.key_len as usize;
        let value_end = value_start + hdr.value_len as usize;
        if value_end as u64 > inner.header.arena_end {
            return Err(StoreError::Corrupt("record extends past the arena"));
        }
        Ok(inner.mm.as_slice()[value_start..value_end].to_vec())
    }

    /// Copies the value into `out`, erroring with the required size when
    /// the buffer is too small.
    pub fn get_into(&self, key: &str, out: &mut [u8]) -> Result<usize, StoreError> {
        let inner = self.inner.read().unwrap();
        let (_, record) = find(&inner, key)?;
        let hdr = RecordHeader::read_at(inner.mm.as_slice(), record)?;
        let len = hdr.value_len as usize;
        if out.len() < len {
            return Err(StoreError::Truncated { needed: len });
        }
        let value_start = record + RECORD_HEADER_LEN + hdr.key_len as usize;
        if (value_start + len) as u64 > inner.header.arena_end {
            return Err(StoreError::Corrupt("record extends past the arena"));
        }
        out[..len].copy_from_slice(&inner.mm.as_slice()[value_start..value_start + len]);
        Ok(len)
    }

    /// Tombstones a key. The record bytes stay in the arena.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let hash_pos = {
            let (slot, _) = find(&inner, key)?;
            inner.header.slot_offset as usize + slot * SLOT_LEN
        };
        Slot {
            offset: SLOT_TOMBSTONE,
            hash: 0,
        }
        .write_at(inner.mm.as_mut_slice(), hash_pos);
        inner.header.n_entries -= 1;
        write_header(&mut inner);
        Ok(())
    }

    pub fn exists(&self, key: &str) -> bool {
        let inner = self.inner.read().unwrap();
        find(&inner, key).is_ok()
    }

    /// Schedules dirty pages for writeback (`msync` async) after
    /// restamping the header CRC.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        write_header(&mut inner);
        inner.mm.flush_async()?;
        Ok(())
    }

    pub fn count(&self) -> u32 {
        self.inner.read().unwrap().header.n_entries
    }

    /// Bytes consumed by header, slot table and arena.
    pub fn bytes_used(&self) -> u64 {
        self.inner.read().unwrap().header.arena_end
    }

    pub fn capacity(&self) -> u64 {
        self.inner.read().unwrap().header.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ValueStore {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.write() {
            write_header(&mut inner);
            let _ = inner.mm.flush_async();
        }
    }
}

/// Mirrors the in-memory header into the mapped file, restamping the CRC,
/// so the on-disk header is always self-consistent for crash recovery.
fn write_header(inner: &mut StoreInner) {
    let header = &mut inner.header;
    // Split borrow: header serializes into the file's first bytes.
    let buf = inner.mm.as_mut_slice();
    header.write_to(&mut buf[..HEADER_LEN]);
}

/// Linear probe for a key. Tombstones keep chains intact and are reused
/// for insertion.
fn probe(inner: &StoreInner, key: &[u8], hash: u32) -> Probe {
    let buf = inner.mm.as_slice();
    let n_slots = inner.header.n_slots as usize;
    let table = inner.header.slot_offset as usize;
    let mut idx = hash as usize % n_slots;
    let mut reusable: Option<usize> = None;

    for _ in 0..n_slots {
        let slot = Slot::read_at(buf, table + idx * SLOT_LEN);
        if slot.is_empty() {
            return Probe::Vacant {
                slot: reusable.unwrap_or(idx),
            };
        }
        if slot.is_tombstone() {
            if reusable.is_none() {
                reusable = Some(idx);
            }
        } else if slot.hash == hash {
            // Hash match still requires a byte-exact key comparison.
            let record = slot.offset as usize;
            if let Ok(hdr) = RecordHeader::read_at(buf, record) {
                let key_start = record + RECORD_HEADER_LEN;
                if hdr.key_len as usize == key.len()
                    && &buf[key_start..key_start + key.len()] == key
                {
                    return Probe::Found { slot: idx, record };
                }
            }
        }
        idx = (idx + 1) % n_slots;
    }

    match reusable {
        Some(slot) => Probe::Vacant { slot },
        None => Probe::Exhausted,
    }
}

fn find(inner: &StoreInner, key: &str) -> Result<(usize, usize), StoreError> {
    let key_bytes = key.as_bytes();
    if key_bytes.is_empty() || key_bytes.len() > KEY_MAX {
        return Err(StoreError::KeyTooLong);
    }
    match probe(inner, key_bytes, fnv1a_32(key_bytes)) {
        Probe::Found { slot, record } => Ok((slot, record)),
        _ => Err(StoreError::NotFound),
    }
}

/// Ensures `len` arena bytes are available and returns their offset.
/// Grows the file geometrically when the arena would overflow.
fn reserve_arena(inner: &mut StoreInner, len: usize) -> Result<usize, StoreError> {
    let offset = inner.header.arena_end;
    let needed = offset
        .checked_add(len as u64)
        .ok_or(StoreError::NoSpace)?;
    if needed > inner.header.file_size {
        let new_size = needed.next_power_of_two();
        debug!(from = inner.header.file_size, to = new_size, "growing store file");
        inner.mm.grow(new_size)?;
        inner.header.file_size = new_size;
        write_header(inner);
    }
    // Slots address records with 32 bits.
    if offset + len as u64 > u32::MAX as u64 {
        return Err(StoreError::NoSpace);
    }
    Ok(offset as usize)
}

/// Doubles the slot table. The new table is laid down at the current arena
/// end (the header's `slot_offset` tracks it), live entries are re-hashed
/// into it, and the old table's bytes become dead arena space.
fn grow_table(inner: &mut StoreInner) -> Result<(), StoreError> {
    let old_slots = inner.header.n_slots as usize;
    let old_table = inner.header.slot_offset as usize;
    let new_slots = old_slots
        .checked_mul(2)
        .ok_or(StoreError::NoSpace)?;
    let table_len = new_slots * SLOT_LEN;

    let new_table = reserve_arena(inner, table_len)?;
    debug!(from = old_slots, to = new_slots, "rehashing slot table");

    let buf = inner.mm.as_mut_slice();
    buf[new_table..new_table + table_len].fill(0);

    for i in 0..old_slots {
        let slot = Slot::read_at(buf, old_table + i * SLOT_LEN);
        if slot.is_empty() || slot.is_tombstone() {
            continue;
        }
        let mut idx = slot.hash as usize % new_slots;
        loop {
            let pos = new_table + idx * SLOT_LEN;
            if Slot::read_at(buf, pos).is_empty() {
                slot.write_at(buf, pos);
                break;
            }
            idx = (idx + 1) % new_slots;
        }
    }

    inner.header.slot_offset = new_table as u64;
    inner.header.n_slots = new_slots as u32;
    inner.header.arena_end = (new_table + table_len) as u64;
    write_header(inner);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn tmp_path(tag: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/tmp/pagewatch_store_{tag}_{ts}")
    }

    fn small_opts() -> StoreOptions {
        StoreOptions {
            initial_capacity: 1 << 16,
            initial_slots: 16,
            value_max: 100 * 1024,
        }
    }

    #[test]
    fn put_get_roundtrip() {
        let path = tmp_path("roundtrip");
        let store = ValueStore::open(&path, small_opts()).unwrap();
        store.put("mem/1/2/3/old", b"hello").unwrap();
        store.put("mem/1/2/3/new", &[0u8; 4096]).unwrap();
        assert_eq!(store.get("mem/1/2/3/old").unwrap(), b"hello");
        assert_eq!(store.get("mem/1/2/3/new").unwrap(), vec![0u8; 4096]);
        assert_eq!(store.count(), 2);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn overwrite_keeps_one_entry() {
        let path = tmp_path("overwrite");
        let store = ValueStore::open(&path, small_opts()).unwrap();
        store.put("k", b"first").unwrap();
        let used_before = store.bytes_used();
        store.put("k", b"second").unwrap();
        assert_eq!(store.get("k").unwrap(), b"second");
        assert_eq!(store.count(), 1);
        // Append-only: the overwrite consumed fresh arena bytes.
        assert!(store.bytes_used() > used_before);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn delete_tombstones_and_chain_survives() {
        let path = tmp_path("delete");
        let store = ValueStore::open(&path, small_opts()).unwrap();
        for i in 0..8 {
            store.put(&format!("key-{i}"), &[i as u8]).unwrap();
        }
        store.delete("key-3").unwrap();
        assert!(matches!(store.get("key-3"), Err(StoreError::NotFound)));
        assert!(matches!(store.delete("key-3"), Err(StoreError::NotFound)));
        // Neighbours probing through the tombstone still resolve.
        for i in (0..8).filter(|&i| i != 3) {
            assert_eq!(store.get(&format!("key-{i}")).unwrap(), vec![i as u8]);
        }
        assert_eq!(store.count(), 7);
        store.put("key-3", b"back").unwrap();
        assert_eq!(store.get("key-3").unwrap(), b"back");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn exists_and_not_found() {
        let path = tmp_path("exists");
        let store = ValueStore::open(&path, small_opts()).unwrap();
        assert!(!store.exists("nope"));
        assert!(matches!(store.get("nope"), Err(StoreError::NotFound)));
        store.put("yes", b"1").unwrap();
        assert!(store.exists("yes"));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn key_and_value_limits() {
        let path = tmp_path("limits");
        let store = ValueStore::open(
            &path,
            StoreOptions {
                value_max: 64,
                ..small_opts()
            },
        )
        .unwrap();
        let long_key = "k".repeat(KEY_MAX + 1);
        assert!(matches!(
            store.put(&long_key, b"x"),
            Err(StoreError::KeyTooLong)
        ));
        assert!(matches!(store.put("", b"x"), Err(StoreError::KeyTooLong)));
        assert!(matches!(
            store.put("big", &[0u8; 65]),
            Err(StoreError::ValueTooLarge { len: 65, max: 64 })
        ));
        // The cap itself is fine.
        store.put("ok", &[0u8; 64]).unwrap();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn file_grows_geometrically() {
        let path = tmp_path("grow");
        let store = ValueStore::open(
            &path,
            StoreOptions {
                initial_capacity: 1 << 12,
                initial_slots: 16_384,
                value_max: 100 * 1024,
            },
        )
        .unwrap();
        let before = store.capacity();
        for i in 0..64 {
            store.put(&format!("blob-{i}"), &[0xeeu8; 50 * 1024]).unwrap();
        }
        assert!(store.capacity() > before);
        assert!(store.capacity().is_power_of_two());
        for i in 0..64 {
            assert_eq!(store.get(&format!("blob-{i}")).unwrap(), vec![0xeeu8; 50 * 1024]);
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn slot_table_doubles_under_load() {
        let path = tmp_path("rehash");
        let store = ValueStore::open(&path, small_opts()).unwrap();
        // 16 initial slots, 3/4 load: the 13th insert must trigger a rehash.
        for i in 0..40 {
            store.put(&format!("entry-{i}"), &[i as u8]).unwrap();
        }
        for i in 0..40 {
            assert_eq!(store.get(&format!("entry-{i}")).unwrap(), vec![i as u8]);
        }
        assert_eq!(store.count(), 40);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reopen_recovers_contents() {
        let path = tmp_path("recover");
        {
            let store = ValueStore::open(&path, small_opts()).unwrap();
            store.put("persist/a", b"alpha").unwrap();
            store.put("persist/b", b"beta").unwrap();
            store.flush().unwrap();
        }
        {
            let store = ValueStore::open(&path, small_opts()).unwrap();
            assert_eq!(store.count(), 2);
            assert_eq!(store.get("persist/a").unwrap(), b"alpha");
            assert_eq!(store.get("persist/b").unwrap(), b"beta");
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_header_rejected_on_open() {
        let path = tmp_path("torn");
        {
            let store = ValueStore::open(&path, small_opts()).unwrap();
            store.put("k", b"v").unwrap();
        }
        // Corrupt a counted field without restamping the CRC.
        let mut bytes = fs::read(&path).unwrap();
        bytes[24] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let err = ValueStore::open(&path, small_opts()).unwrap_err();
        assert!(err.is_corruption());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn concurrent_readers_see_complete_values() {
        use std::sync::Arc;

        let path = tmp_path("concurrent");
        let store = Arc::new(ValueStore::open(&path, small_opts()).unwrap());

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for round in 0..200u8 {
                    // Overwrite the same key with a self-consistent value.
                    store.put("hot", &[round; 512]).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut observed = 0usize;
                    while observed < 500 {
                        match store.get("hot") {
                            Ok(value) => {
                                // Never a torn mix of two writes.
                                assert!(value.iter().all(|&b| b == value[0]));
                                assert_eq!(value.len(), 512);
                                observed += 1;
                            }
                            Err(StoreError::NotFound) => {}
                            Err(err) => panic!("reader failed: {err}"),
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.count(), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn get_into_reports_needed_size() {
        let path = tmp_path("getinto");
        let store = ValueStore::open(&path, small_opts()).unwrap();
        store.put("k", &[7u8; 100]).unwrap();
        let mut small = [0u8; 10];
        assert!(matches!(
            store.get_into("k", &mut small),
            Err(StoreError::Truncated { needed: 100 })
        ));
        let mut big = [0u8; 128];
        assert_eq!(store.get_into("k", &mut big).unwrap(), 100);
        assert_eq!(&big[..100], &[7u8; 100][..]);
        let _ = fs::remove_file(&path);
    }
}
