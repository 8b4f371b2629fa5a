//! Monotonic nanosecond clock.
//!
//! Every timestamp in the pipeline comes from here, including the ones the
//! trap handler stamps onto raw faults, so this module is held to the
//! handler's contract: no locks, no allocation, no lazy-init primitive that
//! can block a thread. `clock_gettime(CLOCK_MONOTONIC)` and
//! `mach_absolute_time` are async-signal-safe; the macOS timebase cache
//! below is two relaxed atomics with racy-but-idempotent initialization
//! instead of a `OnceLock`, which may spin-wait and is off-limits in
//! signal context.

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Current monotonic time in nanoseconds. Returns 0 only if the clock
/// itself fails, which callers treat as "no timestamp".
#[inline(always)]
#[cfg(not(target_os = "macos"))]
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64).saturating_mul(NANOS_PER_SEC) + ts.tv_nsec as u64
}

/// Current monotonic time in nanoseconds.
///
/// Ticks from `mach_absolute_time` are scaled by the timebase ratio. The
/// ratio is cached in atomics; concurrent first calls may each query it,
/// but they all store the same pair, so the race is harmless and no
/// synchronization beyond relaxed loads is needed.
#[inline(always)]
#[cfg(target_os = "macos")]
#[allow(deprecated)]
pub fn now_ns() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NUMER: AtomicU64 = AtomicU64::new(0);
    static DENOM: AtomicU64 = AtomicU64::new(0);

    let mut numer = NUMER.load(Ordering::Relaxed);
    let mut denom = DENOM.load(Ordering::Relaxed);
    if denom == 0 {
        let mut info = libc::mach_timebase_info_data_t { numer: 0, denom: 0 };
        let rc = unsafe { libc::mach_timebase_info(&mut info) };
        (numer, denom) = if rc != 0 || info.denom == 0 {
            (1, 1)
        } else {
            (info.numer as u64, info.denom as u64)
        };
        NUMER.store(numer, Ordering::Relaxed);
        DENOM.store(denom, Ordering::Relaxed);
    }

    let ticks = unsafe { libc::mach_absolute_time() } as u128;
    ((ticks * numer as u128) / denom as u128) as u64
}
