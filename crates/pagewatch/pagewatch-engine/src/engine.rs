//! Engine facade: the process-wide capture instance and its public API.
//!
//! One engine per process. `init` wires the shared trap state, opens the
//! spill store, spawns the worker and installs the fault handler; every
//! other call routes through the global state. `shutdown` unwinds in the
//! reverse order and is idempotent; a later `init` yields a fresh, fully
//! functional engine.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use pagewatch_config::{CaptureMode, EngineConfig};
use pagewatch_core::{
    clock, fnv1a, AdapterId, AdapterRegistry, ChangeEvent, EngineError, PageIndex, RegionId,
    RegionInfo, RegionTable, Stats, WatchRequest,
};
use pagewatch_store::{StoreOptions, ValueStore};
use tracing::{debug, info, warn};

use crate::protect;
use crate::shared::{EngineShared, ENGINE, HANDLER_DEPTH};
use crate::subscriber::{Callback, Subscribers};
use crate::trap;
use crate::worker::{Worker, WorkerConfig};

struct EngineState {
    shared: Arc<EngineShared>,
    regions: Arc<Mutex<RegionTable>>,
    pages: Arc<Mutex<PageIndex>>,
    adapters: Mutex<AdapterRegistry>,
    subs: Arc<Subscribers>,
    store: Option<Arc<ValueStore>>,
    worker: Option<JoinHandle<()>>,
    worker_tid: Arc<AtomicU32>,
    mode: CaptureMode,
    snapshot_cap: usize,
    page_size: usize,
}

static STATE: Mutex<Option<EngineState>> = Mutex::new(None);

/// Brings the engine up. Idempotent: a second call on a live engine is a
/// no-op. On any failure no partial state is left behind.
pub fn init(config: EngineConfig) -> Result<(), EngineError> {
    let mut state = STATE.lock().unwrap();
    if state.is_some() {
        return Ok(());
    }

    let page_size = protect::page_size();
    let ring_capacity = config.ring_capacity.next_power_of_two();
    let page_table_capacity = config.page_table_capacity.next_power_of_two();

    let shared = Arc::new(EngineShared::new(
        ring_capacity,
        page_table_capacity,
        page_size,
    ));

    let store = if config.store.enabled {
        let opts = StoreOptions {
            initial_capacity: config.store.initial_capacity_bytes,
            initial_slots: config.store.initial_slots.next_power_of_two(),
            value_max: config.store.value_max_bytes,
        };
        match ValueStore::open(&config.store.path, opts) {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                // Large payloads degrade to preview-only; tracking still works.
                warn!(%err, "value store unavailable, continuing without persistent spill");
                None
            }
        }
    } else {
        None
    };

    let regions = Arc::new(Mutex::new(RegionTable::new()));
    let pages = Arc::new(Mutex::new(PageIndex::new()));
    let subs = Arc::new(Subscribers::new(config.poll_queue_capacity));
    let worker_tid = Arc::new(AtomicU32::new(0));

    let worker = Worker {
        shared: Arc::clone(&shared),
        regions: Arc::clone(&regions),
        pages: Arc::clone(&pages),
        subs: Arc::clone(&subs),
        store: store.clone(),
        config: WorkerConfig {
            mode: config.capture_mode,
            coalesce_window: Duration::from_millis(config.coalesce_window_ms),
            idle_sleep: Duration::from_millis(config.idle_sleep_ms.max(1)),
            sample_interval: Duration::from_millis(config.sample_interval_ms.max(1)),
            persist_events: config.store.persist_events,
        },
        tid: Arc::clone(&worker_tid),
    };

    let handle = std::thread::Builder::new()
        .name("pagewatch-worker".into())
        .spawn(move || worker.run())
        .map_err(EngineError::WorkerSpawn)?;

    if config.capture_mode == CaptureMode::Protect {
        // Publish the shared state before the handler can observe a fault.
        ENGINE.store(Arc::as_ptr(&shared) as *mut EngineShared, Ordering::Release);
        if let Err(err) = trap::install() {
            ENGINE.store(std::ptr::null_mut(), Ordering::Release);
            shared.shutdown.store(true, Ordering::Relaxed);
            let _ = handle.join();
            return Err(EngineError::HandlerInstall(err));
        }
    }

    info!(
        mode = ?config.capture_mode,
        ring_capacity,
        spill = store.is_some(),
        "engine initialized"
    );

    *state = Some(EngineState {
        shared,
        regions,
        pages,
        adapters: Mutex::new(AdapterRegistry::new()),
        subs,
        store,
        worker: Some(handle),
        worker_tid,
        mode: config.capture_mode,
        snapshot_cap: config.snapshot_cap_bytes,
        page_size,
    });
    Ok(())
}

/// Tears the engine down: drains the worker, disarms every protected page,
/// restores the previous fault handler and releases the store. Safe to call
/// repeatedly and from a callback-free context only (never from a signal).
pub fn shutdown() {
    let Some(mut state) = STATE.lock().unwrap().take() else {
        return;
    };

    state.shared.shutdown.store(true, Ordering::Relaxed);
    if let Some(handle) = state.worker.take() {
        let _ = handle.join();
    }

    if state.mode == CaptureMode::Protect {
        // No more re-arms can happen; restore every page before dropping
        // the handler so a late write cannot hit a dead protection.
        {
            let pages = state.pages.lock().unwrap();
            for page in pages.pages() {
                let _ = protect::disarm(page);
            }
        }
        trap::uninstall();
        ENGINE.store(std::ptr::null_mut(), Ordering::Release);
        // A handler that raced the uninstall may still be on some stack;
        // the shared state cannot be freed under it.
        while HANDLER_DEPTH.load(Ordering::SeqCst) > 0 {
            std::hint::spin_loop();
        }
    }

    if let Some(store) = &state.store {
        if let Err(err) = store.flush() {
            warn!(%err, "final store flush failed");
        }
    }

    info!("engine shut down");
}

pub fn is_initialized() -> bool {
    STATE.lock().unwrap().is_some()
}

pub fn register_adapter(name: &str) -> Result<AdapterId, EngineError> {
    let guard = STATE.lock().unwrap();
    let state = guard.as_ref().ok_or(EngineError::NotInitialized)?;
    state.adapters.lock().unwrap().register(name)
}

pub fn unregister_adapter(id: AdapterId) {
    if let Some(state) = STATE.lock().unwrap().as_ref() {
        state.adapters.lock().unwrap().unregister(id);
    }
}

/// Starts watching a byte range.
///
/// The baseline hash (and snapshot, for regions up to the snapshot cap) is
/// taken synchronously before the first page is armed, so the first diff
/// compares against the bytes as they were at registration.
///
/// # Safety
/// `[req.addr, req.addr + req.len)` must be valid, readable memory and stay
/// so until `unwatch` (or `shutdown`) returns for this region.
pub unsafe fn watch(req: WatchRequest) -> Result<RegionId, EngineError> {
    let (shared, regions, pages, mode, snapshot_cap, page_size) = {
        let guard = STATE.lock().unwrap();
        let state = guard.as_ref().ok_or(EngineError::NotInitialized)?;
        if req.adapter_id != 0 && !state.adapters.lock().unwrap().is_live(req.adapter_id) {
            return Err(EngineError::NotFound);
        }
        (
            Arc::clone(&state.shared),
            Arc::clone(&state.regions),
            Arc::clone(&state.pages),
            state.mode,
            state.snapshot_cap,
            state.page_size,
        )
    };

    if req.addr == 0 || req.len == 0 {
        return Err(EngineError::InvalidAddress);
    }

    // Baseline before any protection exists for these pages.
    let bytes = unsafe { std::slice::from_raw_parts(req.addr as *const u8, req.len) };
    let baseline = fnv1a(bytes);
    let snapshot = (req.len <= snapshot_cap).then(|| bytes.to_vec());

    let id = regions
        .lock()
        .unwrap()
        .insert(req.clone(), baseline, snapshot, clock::now_ns())?;

    if mode == CaptureMode::Protect {
        let first_page = req.addr & !(page_size - 1);
        let last_page = (req.addr + req.len - 1) & !(page_size - 1);

        let mut failure: Option<EngineError> = None;
        let mut attached: Vec<usize> = Vec::new();
        {
            let mut pages_guard = pages.lock().unwrap();
            for page in (first_page..=last_page).step_by(page_size) {
                let newly_armed = pages_guard.attach(page, id);
                attached.push(page);
                if newly_armed {
                    // Membership first: the handler must classify a fault
                    // that lands the instant protection is applied.
                    let armed = shared
                        .armed
                        .insert(page)
                        .and_then(|_| protect::arm(page).map_err(EngineError::ProtectFailed));
                    if let Err(err) = armed {
                        failure = Some(err);
                        break;
                    }
                }
            }
            if failure.is_some() {
                for page in attached {
                    if pages_guard.detach(page, id) {
                        // Writable again before the membership entry goes,
                        // so a racing fault still classifies as tracked.
                        let _ = protect::disarm(page);
                        shared.armed.remove(page);
                    }
                }
            }
        }
        if let Some(err) = failure {
            regions.lock().unwrap().remove(id);
            return Err(err);
        }
    }

    debug!(region = id, addr = req.addr, len = req.len, "watch");
    Ok(id)
}

/// Stops watching a region. Pages whose bucket becomes empty are restored
/// to read+write. Returns `false` for an unknown id.
pub fn unwatch(id: RegionId) -> bool {
    let Some((shared, regions, pages, mode, page_size)) = ({
        let guard = STATE.lock().unwrap();
        guard.as_ref().map(|state| {
            (
                Arc::clone(&state.shared),
                Arc::clone(&state.regions),
                Arc::clone(&state.pages),
                state.mode,
                state.page_size,
            )
        })
    }) else {
        return false;
    };

    let Some(region) = regions.lock().unwrap().remove(id) else {
        return false;
    };

    if mode == CaptureMode::Protect {
        let mut pages_guard = pages.lock().unwrap();
        for page in region.pages(page_size) {
            if pages_guard.detach(page, id) {
                // Writable again before the membership entry goes, so a
                // fault racing the unwatch still classifies as tracked.
                let _ = protect::disarm(page);
                shared.armed.remove(page);
            }
        }
    }

    debug!(region = id, "unwatch");
    true
}

/// Registers the in-process callback (or clears it with `None`). The
/// callback runs on the worker thread and must not block it.
pub fn set_callback(cb: Option<Callback>) -> Result<(), EngineError> {
    let guard = STATE.lock().unwrap();
    let state = guard.as_ref().ok_or(EngineError::NotInitialized)?;
    state.subs.set_callback(cb);
    Ok(())
}

/// Polling mode: removes and returns up to `max` accumulated events.
pub fn drain(max: usize) -> Vec<ChangeEvent> {
    let subs = {
        let guard = STATE.lock().unwrap();
        match guard.as_ref() {
            Some(state) => Arc::clone(&state.subs),
            None => return Vec::new(),
        }
    };
    subs.drain(max)
}

pub fn stats() -> Result<Stats, EngineError> {
    let guard = STATE.lock().unwrap();
    let state = guard.as_ref().ok_or(EngineError::NotInitialized)?;
    Ok(Stats {
        tracked_regions: state.regions.lock().unwrap().len() as u32,
        armed_pages: state.shared.armed.count() as u32,
        total_events: state.shared.total_events.load(Ordering::Relaxed),
        ring_writes: state.shared.ring.writes(),
        ring_drops: state.shared.ring.drops(),
        poll_drops: state.subs.poll_drops(),
        store_bytes_used: state.store.as_ref().map(|s| s.bytes_used()).unwrap_or(0),
        worker_thread_id: state.worker_tid.load(Ordering::Relaxed),
    })
}

/// Enumerates every tracked region, in ascending id order.
pub fn list_regions() -> Vec<RegionInfo> {
    let regions = {
        let guard = STATE.lock().unwrap();
        match guard.as_ref() {
            Some(state) => Arc::clone(&state.regions),
            None => return Vec::new(),
        }
    };
    regions.lock().unwrap().infos()
}

/// Fetches a spilled payload back out of the value store.
pub fn fetch_spilled(key: &str) -> Result<Vec<u8>, EngineError> {
    let store = {
        let guard = STATE.lock().unwrap();
        let state = guard.as_ref().ok_or(EngineError::NotInitialized)?;
        state.store.as_ref().cloned().ok_or(EngineError::NotFound)?
    };
    store.get(key).map_err(|_| EngineError::NotFound)
}

/// Reads a journaled change record back (requires `persist_events`).
/// Payload sides come back spilled or unavailable; previews and provenance
/// are complete.
pub fn fetch_event(seq: u32) -> Result<ChangeEvent, EngineError> {
    let bytes = fetch_spilled(&crate::journal::key(seq))?;
    crate::journal::decode(&bytes).ok_or(EngineError::NotFound)
}
