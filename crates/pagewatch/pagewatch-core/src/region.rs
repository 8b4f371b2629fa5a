//! Region registry.
//!
//! A region is one caller-registered contiguous byte range. The table owns
//! all region storage and hands out stable `u32` ids; everything else in the
//! engine (page buckets, events) refers to regions by id, never by pointer.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::event::{RegionId, SourceLocation};

/// Arguments to `watch`, bundled so the engine and the C ABI share one path.
#[derive(Clone, Debug)]
pub struct WatchRequest {
    pub addr: usize,
    pub len: usize,
    pub adapter_id: u32,
    pub name: Option<String>,
    pub user_data: usize,
    pub location: Option<SourceLocation>,
}

/// One tracked region. Base and length never change while the region is
/// alive; `last_hash`, `epoch`, `last_check_ns` and `snapshot` are owned by
/// the worker after registration.
#[derive(Debug)]
pub struct Region {
    pub id: RegionId,
    pub addr: usize,
    pub len: usize,
    pub adapter_id: u32,
    pub name: Option<String>,
    pub user_data: usize,
    pub location: Option<SourceLocation>,
    /// Content hash at the last published change (or at registration).
    pub last_hash: u64,
    /// Incremented once per published change.
    pub epoch: u32,
    pub last_check_ns: u64,
    /// Copy of the region bytes at the last published change. `None` for
    /// regions above the snapshot cap, which diff by hash alone.
    pub snapshot: Option<Vec<u8>>,
}

impl Region {
    /// Live bytes of the tracked range.
    ///
    /// # Safety
    /// The caller of `watch` vouched that `[addr, addr+len)` stays valid and
    /// readable until `unwatch`; the worker reads it only between those two
    /// points.
    pub unsafe fn live_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }

    /// Base addresses of every page this region overlaps.
    pub fn pages(&self, page_size: usize) -> impl Iterator<Item = usize> + use<> {
        let first = self.addr & !(page_size - 1);
        let last = (self.addr + self.len - 1) & !(page_size - 1);
        (first..=last).step_by(page_size)
    }
}

/// Point-in-time description of one tracked region, for enumeration.
#[derive(Clone, Debug)]
pub struct RegionInfo {
    pub id: RegionId,
    pub addr: usize,
    pub len: usize,
    pub adapter_id: u32,
    pub name: Option<String>,
    pub epoch: u32,
    pub last_check_ns: u64,
}

/// Registry of tracked regions. Callers wrap it in a mutex; it is never
/// touched from the signal path.
#[derive(Debug, Default)]
pub struct RegionTable {
    regions: HashMap<RegionId, Region>,
    next_id: RegionId,
}

impl RegionTable {
    pub fn new() -> Self {
        Self {
            regions: HashMap::new(),
            // 0 is the invalid id.
            next_id: 1,
        }
    }

    /// Inserts a region whose baseline hash and snapshot were computed by the
    /// caller before any page protection was armed.
    ///
    /// Rejects ranges overlapping an existing region of the same adapter;
    /// overlap across adapters is allowed and produces one event per region.
    pub fn insert(
        &mut self,
        req: WatchRequest,
        baseline_hash: u64,
        snapshot: Option<Vec<u8>>,
        now_ns: u64,
    ) -> Result<RegionId, EngineError> {
        if req.addr == 0 || req.len == 0 {
            return Err(EngineError::InvalidAddress);
        }
        if self.overlaps(req.adapter_id, req.addr, req.len) {
            return Err(EngineError::RegionOverlap);
        }

        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).ok_or(EngineError::OutOfMemory)?;

        self.regions.insert(
            id,
            Region {
                id,
                addr: req.addr,
                len: req.len,
                adapter_id: req.adapter_id,
                name: req.name,
                user_data: req.user_data,
                location: req.location,
                last_hash: baseline_hash,
                epoch: 0,
                last_check_ns: now_ns,
                snapshot,
            },
        );
        Ok(id)
    }

    pub fn remove(&mut self, id: RegionId) -> Option<Region> {
        self.regions.remove(&id)
    }

    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(&id)
    }

    pub fn get_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.regions.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Region ids in ascending order, used by the sampling capture mode for
    /// deterministic delivery.
    pub fn ids_sorted(&self) -> Vec<RegionId> {
        let mut ids: Vec<RegionId> = self.regions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of every tracked region, in ascending id order.
    pub fn infos(&self) -> Vec<RegionInfo> {
        let mut infos: Vec<RegionInfo> = self
            .regions
            .values()
            .map(|r| RegionInfo {
                id: r.id,
                addr: r.addr,
                len: r.len,
                adapter_id: r.adapter_id,
                name: r.name.clone(),
                epoch: r.epoch,
                last_check_ns: r.last_check_ns,
            })
            .collect();
        infos.sort_unstable_by_key(|info| info.id);
        infos
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn overlaps(&self, adapter_id: u32, addr: usize, len: usize) -> bool {
        let end = addr.saturating_add(len);
        self.regions.values().any(|r| {
            r.adapter_id == adapter_id && addr < r.addr.saturating_add(r.len) && r.addr < end
        })
    }
}
