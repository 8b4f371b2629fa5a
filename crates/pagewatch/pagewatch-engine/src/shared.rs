//! State shared with signal context.
//!
//! The trap handler can only touch data reachable through relaxed/acquire
//! atomic loads: the process-wide engine pointer below, and through it the
//! fault ring, the armed-page table and a handful of counters. Everything
//! else in the engine sits behind mutexes and stays off the signal path.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use pagewatch_core::{ArmedPages, RawFault};
use pagewatch_ring::Ring;

/// The slice of engine state the trap handler is allowed to see.
pub struct EngineShared {
    pub ring: Ring<RawFault>,
    pub armed: ArmedPages,
    /// Trap-assigned sequence counter; gaps mark ring drops.
    pub seq: AtomicU32,
    pub total_events: AtomicU64,
    pub shutdown: AtomicBool,
    /// Cached once at init so the handler never calls `sysconf`.
    pub page_size: usize,
}

impl EngineShared {
    pub fn new(ring_capacity: usize, page_table_capacity: usize, page_size: usize) -> Self {
        Self {
            ring: Ring::with_capacity(ring_capacity),
            armed: ArmedPages::new(page_table_capacity, page_size),
            // 0 is never a delivered sequence number.
            seq: AtomicU32::new(1),
            total_events: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            page_size,
        }
    }
}

/// Process-wide engine instance, set during `init` and cleared during
/// `shutdown`. Multiple simultaneous engines are deliberately unsupported.
pub static ENGINE: AtomicPtr<EngineShared> = AtomicPtr::new(std::ptr::null_mut());

/// Number of trap-handler activations currently on some thread's stack.
/// Shutdown spins on this reaching zero after clearing [`ENGINE`], so the
/// shared state is never freed under a live handler.
pub static HANDLER_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Loads the live engine, if any. Usable from signal context.
#[inline]
pub fn current() -> Option<&'static EngineShared> {
    let ptr = ENGINE.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        // Published with Release in init; shutdown only frees it after
        // HANDLER_DEPTH drains.
        Some(unsafe { &*ptr })
    }
}
