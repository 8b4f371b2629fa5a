//! Bounded lock-free ring for trap-to-worker handoff.
//!
//! Producers are signal handlers running on arbitrary target threads; the
//! consumer is the single worker thread. The write side is built for
//! async-signal context: no allocation, no locks, only atomic operations
//! over a fixed array, and a full ring is reported as a counted drop rather
//! than any form of waiting.
//!
//! # Protocol
//!
//! Each slot carries a stamp alongside its payload. For capacity `N` and a
//! monotonically claimed position `pos`:
//!
//! - stamp == `pos`: slot is free for the producer claiming `pos`
//! - stamp == `pos + 1`: payload published, ready for the consumer
//! - stamp == `pos + N`: slot consumed and recycled for the next lap
//!
//! **Producer:** claim `pos` with a CAS on `head`, write the payload, then
//! publish by storing `pos + 1` into the stamp with Release ordering.
//! Observing a stamp one full lap behind means the consumer has not caught
//! up: the ring is full and the event is dropped.
//!
//! **Consumer:** read the stamp at `tail` with Acquire ordering; if it
//! equals `tail + 1` the payload is safe to copy out, after which the stamp
//! is bumped a full lap ahead and `tail` advances.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of slots, matching the engine's default ring capacity.
pub const DEFAULT_CAPACITY: usize = 65_536;

struct Slot<T> {
    /// Lap-encoded state word; see the module protocol description.
    stamp: AtomicU64,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// Multi-producer (signal-safe), single-consumer bounded ring.
///
/// `T` must be `Copy`: payloads are published by bitwise write and consumed
/// by bitwise read, so a torn or recycled slot can never leak a destructor.
pub struct Ring<T: Copy> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    /// Next position a producer will claim.
    head: AtomicU64,
    /// Next position the consumer will read.
    tail: AtomicU64,
    drops: AtomicU64,
    writes: AtomicU64,
}

// Payloads are plain bytes and every slot transfer is mediated by the stamp
// protocol above.
unsafe impl<T: Copy + Send> Sync for Ring<T> {}
unsafe impl<T: Copy + Send> Send for Ring<T> {}

impl<T: Copy> Ring<T> {
    /// Creates a ring with `capacity` slots (must be a power of two).
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of 2");
        let slots = (0..capacity as u64)
            .map(|i| Slot {
                stamp: AtomicU64::new(i),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            mask: capacity as u64 - 1,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Publishes one payload. Returns `false` (and counts a drop) when the
    /// ring is full. Safe to call from a signal handler.
    #[inline]
    pub fn push(&self, value: T) -> bool {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & self.mask) as usize];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == pos {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Claimed: this producer owns the slot until publish.
                        unsafe { (*slot.data.get()).write(value) };
                        slot.stamp.store(pos.wrapping_add(1), Ordering::Release);
                        self.writes.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if stamp < pos {
                // Stamp is a lap behind: the consumer has not freed this
                // slot, so the ring is full.
                self.drops.fetch_add(1, Ordering::Relaxed);
                return false;
            } else {
                // Another producer claimed this position first; reload.
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Consumes one payload. Single-consumer: only the worker thread may
    /// call this.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let pos = self.tail.load(Ordering::Relaxed);
        let slot = &self.slots[(pos & self.mask) as usize];
        let stamp = slot.stamp.load(Ordering::Acquire);
        if stamp != pos.wrapping_add(1) {
            return None;
        }
        // Published and owned by the consumer until the stamp is recycled.
        let value = unsafe { (*slot.data.get()).assume_init_read() };
        slot.stamp
            .store(pos.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
        self.tail.store(pos.wrapping_add(1), Ordering::Relaxed);
        Some(value)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total payloads dropped because the ring was full.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Total payloads successfully published.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}
