//! Capture engine: page-protection write tracking with asynchronous diffs.
//!
//! The pipeline, front to back:
//!
//! ```text
//! watch(addr,len) ──▶ region table ──▶ page index ──▶ mprotect(read)
//!                                                         │
//!   target writes ──▶ SIGSEGV ──▶ trap handler ──▶ fault ring ──▶ page rw
//!                                                         │
//!                worker: coalescing window ──▶ re-arm ──▶ diff ──▶ events
//!                                                         │
//!                          callback + polling queue ◀─────┘
//!                          (payloads > 4 KiB spill to the value store)
//! ```
//!
//! The trap handler is async-signal-safe: it probes the armed-page table,
//! claims a ring slot and reopens the page, all through atomics. Everything
//! stateful (diffing, spilling, re-arming, delivery) happens on the one
//! worker thread.

mod journal;
mod protect;
mod shared;
mod subscriber;
mod trap;
mod worker;

pub mod engine;
pub mod ffi;

pub use engine::{
    drain, fetch_event, fetch_spilled, init, is_initialized, list_regions, register_adapter,
    set_callback, shutdown, stats, unregister_adapter, unwatch, watch,
};
pub use subscriber::Callback;

pub use pagewatch_config::{CaptureMode, EngineConfig};
pub use pagewatch_core::{
    AdapterId, ChangeEvent, EngineError, RegionId, RegionInfo, SourceLocation, Stats,
    ValuePayload, WatchRequest,
};
