//! Differ/worker thread.
//!
//! The single consumer of the fault ring. In protect mode each drained
//! fault opens a pending window for its page; when the coalescing window
//! expires the page is re-armed **first** and the diff runs second, so a
//! write racing the diff faults again instead of slipping through while
//! the page is still writable. In sample mode there is no ring at all:
//! every region is re-hashed on a fixed interval and fed through the same
//! diff/publish path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pagewatch_config::CaptureMode;
use pagewatch_core::{
    clock, fnv1a, spill_key, ChangeEvent, PageIndex, RawFault, Region, RegionTable, ValuePayload,
    INLINE_MAX, PREVIEW_MAX,
};
use pagewatch_store::ValueStore;
use tracing::{debug, trace, warn};

use crate::journal;
use crate::protect;
use crate::shared::EngineShared;
use crate::subscriber::Subscribers;
use crate::trap;

/// Cap on faults taken from the ring per iteration, so re-arm deadlines
/// are honored even while the ring is busy.
const MAX_BATCH: usize = 256;

pub struct WorkerConfig {
    pub mode: CaptureMode,
    pub coalesce_window: Duration,
    pub idle_sleep: Duration,
    pub sample_interval: Duration,
    /// Journal every published event into the value store.
    pub persist_events: bool,
}

pub struct Worker {
    pub shared: Arc<EngineShared>,
    pub regions: Arc<Mutex<RegionTable>>,
    pub pages: Arc<Mutex<PageIndex>>,
    pub subs: Arc<Subscribers>,
    pub store: Option<Arc<ValueStore>>,
    pub config: WorkerConfig,
    /// Exposed through stats once the thread is running.
    pub tid: Arc<AtomicU32>,
}

/// One faulted page waiting out its coalescing window.
struct PendingPage {
    deadline: Instant,
    /// First fault of the window; its seq/ip/timestamp go on the events.
    fault: RawFault,
}

impl Worker {
    pub fn run(self) {
        self.tid.store(trap::current_tid(), Ordering::Relaxed);
        debug!(mode = ?self.config.mode, "worker started");
        match self.config.mode {
            CaptureMode::Protect => self.run_protect(),
            CaptureMode::Sample => self.run_sample(),
        }
        debug!("worker stopped");
    }

    fn run_protect(&self) {
        let mut pending: HashMap<usize, PendingPage> = HashMap::new();
        // Publish cursor; kept at or ahead of every trap-assigned seq so
        // delivered sequence numbers stay strictly increasing even when one
        // fault fans out to several regions.
        let mut pub_seq: u32 = 1;

        loop {
            let shutting_down = self.shared.shutdown.load(Ordering::Relaxed);

            let mut drained = 0usize;
            while drained < MAX_BATCH {
                let Some(fault) = self.shared.ring.pop() else {
                    break;
                };
                drained += 1;
                // One window per page: the page stays writable until the
                // deadline, so a second fault for it cannot arrive first.
                pending.entry(fault.page_base).or_insert(PendingPage {
                    deadline: Instant::now() + self.config.coalesce_window,
                    fault,
                });
            }

            self.flush_due(&mut pending, shutting_down, &mut pub_seq);

            if shutting_down && drained == 0 && pending.is_empty() {
                break;
            }

            if drained == 0 && !shutting_down {
                let mut nap = self.config.idle_sleep;
                if let Some(earliest) = pending.values().map(|p| p.deadline).min() {
                    nap = nap.min(earliest.saturating_duration_since(Instant::now()));
                }
                if nap > Duration::ZERO {
                    std::thread::sleep(nap);
                }
            }
        }
    }

    /// Re-arms and diffs every pending page whose window expired.
    fn flush_due(&self, pending: &mut HashMap<usize, PendingPage>, force: bool, pub_seq: &mut u32) {
        if pending.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut due: Vec<(u32, usize)> = pending
            .iter()
            .filter(|(_, p)| force || p.deadline <= now)
            .map(|(page, p)| (p.fault.seq, *page))
            .collect();
        // Ring order, not map order: pages diff in the order they faulted.
        due.sort_unstable();

        for (_, page_base) in due {
            let pending_page = pending.remove(&page_base).unwrap();

            // Close the write window before diffing: a write landing from
            // here on faults and starts a fresh window.
            {
                let pages = self.pages.lock().unwrap();
                if pages.regions_on(page_base).is_some() {
                    if let Err(err) = protect::arm(page_base) {
                        warn!(page = page_base, %err, "re-arm failed");
                    }
                }
                // A vacated bucket means unwatch already restored the page.
            }

            self.diff_page(page_base, &pending_page.fault, pub_seq);
        }
    }

    /// Diffs every region on a page against its last published state and
    /// delivers one event per region whose bytes actually differ.
    fn diff_page(&self, page_base: usize, fault: &RawFault, pub_seq: &mut u32) {
        let region_ids: Vec<u32> = {
            let pages = self.pages.lock().unwrap();
            match pages.regions_on(page_base) {
                Some(ids) => ids.to_vec(),
                None => return,
            }
        };

        *pub_seq = (*pub_seq).max(fault.seq);

        let mut events = Vec::new();
        {
            let mut regions = self.regions.lock().unwrap();
            for id in region_ids {
                let Some(region) = regions.get_mut(id) else {
                    continue;
                };
                if let Some((new_hash, current)) = region_changed(region) {
                    let event = publish_change(
                        region,
                        new_hash,
                        current,
                        *pub_seq,
                        fault.timestamp_ns,
                        fault.fault_ip as u64,
                        self.store.as_deref(),
                    );
                    *pub_seq += 1;
                    events.push(event);
                } else {
                    // Another region on this page was the real mutator.
                    region.last_check_ns = fault.timestamp_ns;
                }
            }
        }

        // Locks are released before delivery so callbacks may re-enter.
        for event in events {
            self.publish(event);
        }
    }

    /// Counts, optionally journals, and delivers one event.
    fn publish(&self, event: ChangeEvent) {
        self.shared.total_events.fetch_add(1, Ordering::Relaxed);
        trace!(seq = event.seq, region = event.region_id, "change event");
        if self.config.persist_events {
            if let Some(store) = self.store.as_deref() {
                if let Err(err) = store.put(&journal::key(event.seq), &journal::encode(&event)) {
                    warn!(seq = event.seq, %err, "event journal write failed");
                }
            }
        }
        self.subs.deliver(event);
    }

    fn run_sample(&self) {
        loop {
            if self.shared.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let ids = self.regions.lock().unwrap().ids_sorted();
            let mut events = Vec::new();
            {
                let mut regions = self.regions.lock().unwrap();
                let now = clock::now_ns();
                for id in ids {
                    let Some(region) = regions.get_mut(id) else {
                        continue;
                    };
                    if let Some((new_hash, current)) = region_changed(region) {
                        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
                        events.push(publish_change(
                            region,
                            new_hash,
                            current,
                            seq,
                            now,
                            0,
                            self.store.as_deref(),
                        ));
                    } else {
                        region.last_check_ns = now;
                    }
                }
            }
            for event in events {
                self.publish(event);
            }

            // Interval sleep in idle-sized slices so shutdown preempts it.
            let deadline = Instant::now() + self.config.sample_interval;
            while Instant::now() < deadline {
                if self.shared.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                std::thread::sleep(self.config.idle_sleep.min(
                    deadline.saturating_duration_since(Instant::now()),
                ));
            }
        }
    }
}

/// Re-hashes a region's live bytes. Returns the new hash and a copy of the
/// current bytes when they differ from the last published state.
fn region_changed(region: &Region) -> Option<(u64, Vec<u8>)> {
    let current = unsafe { region.live_bytes() };
    let new_hash = fnv1a(current);
    if new_hash == region.last_hash {
        return None;
    }
    Some((new_hash, current.to_vec()))
}

/// Builds the change event for one region and advances the region's
/// published state (hash, epoch, snapshot).
fn publish_change(
    region: &mut Region,
    new_hash: u64,
    current: Vec<u8>,
    seq: u32,
    timestamp_ns: u64,
    fault_ip: u64,
    store: Option<&ValueStore>,
) -> ChangeEvent {
    let epoch = region.epoch + 1;
    let old = region.snapshot.as_deref();

    // Preview window sits around the first changed byte; for regions that
    // fit the preview entirely it is simply the whole range.
    let diff_at = old
        .and_then(|o| o.iter().zip(current.iter()).position(|(a, b)| a != b))
        .unwrap_or(0);
    let (lo, hi) = preview_window(current.len(), diff_at);
    let new_preview = current[lo..hi].to_vec();
    let old_preview = old.map(|o| o[lo..hi].to_vec()).unwrap_or_default();

    let (old_value, new_value) = if current.len() <= INLINE_MAX {
        let old_value = match old {
            Some(o) => ValuePayload::Inline(o.to_vec()),
            None => ValuePayload::Unavailable,
        };
        (old_value, ValuePayload::Inline(current.clone()))
    } else {
        let old_value = match old {
            Some(o) => spill(store, region, epoch, "old", o),
            None => ValuePayload::Unavailable,
        };
        let new_value = spill(store, region, epoch, "new", &current);
        (old_value, new_value)
    };

    let event = ChangeEvent {
        seq,
        timestamp_ns,
        adapter_id: region.adapter_id,
        region_id: region.id,
        name: region.name.clone(),
        location: region.location.clone(),
        fault_ip,
        epoch,
        old_preview,
        new_preview,
        old_value,
        new_value,
        user_data: region.user_data,
    };

    region.last_hash = new_hash;
    region.epoch = epoch;
    region.last_check_ns = timestamp_ns;
    if region.snapshot.is_some() {
        region.snapshot = Some(current);
    }

    event
}

/// Writes one payload side into the value store. A failed spill degrades
/// that side to `Unavailable`; tracking continues.
fn spill(
    store: Option<&ValueStore>,
    region: &Region,
    epoch: u32,
    side: &str,
    bytes: &[u8],
) -> ValuePayload {
    let Some(store) = store else {
        return ValuePayload::Unavailable;
    };
    let key = spill_key(region.adapter_id, region.id, epoch, side);
    match store.put(&key, bytes) {
        Ok(()) => ValuePayload::Spilled(key),
        Err(err) => {
            warn!(region = region.id, %err, "payload spill failed");
            ValuePayload::Unavailable
        }
    }
}

/// `[lo, hi)` window of at most [`PREVIEW_MAX`] bytes containing `diff_at`.
fn preview_window(len: usize, diff_at: usize) -> (usize, usize) {
    if len <= PREVIEW_MAX {
        return (0, len);
    }
    let lo = diff_at
        .saturating_sub(PREVIEW_MAX / 2)
        .min(len - PREVIEW_MAX);
    (lo, lo + PREVIEW_MAX)
}
