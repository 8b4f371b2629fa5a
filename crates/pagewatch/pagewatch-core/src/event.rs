//! Event types flowing through the capture pipeline.
//!
//! Two shapes cross thread boundaries:
//!
//! - [`RawFault`]: written by the trap handler into the fault ring. `Copy`,
//!   fixed size, no heap pointers; the handler must not allocate.
//! - [`ChangeEvent`]: built by the worker after diffing and handed to
//!   subscribers. Owns its buffers; subscribers that retain data must copy.

/// Stable identifier for a tracked region. 0 is reserved for "invalid".
pub type RegionId = u32;

/// Previews delivered inline in every change event are capped at this size.
pub const PREVIEW_MAX: usize = 256;

/// Regions at most this large carry their full old/new bytes inline;
/// larger payloads spill to the value store.
pub const INLINE_MAX: usize = 4096;

/// One write-fault as recorded at signal time.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct RawFault {
    /// Base address of the faulting page.
    pub page_base: usize,
    /// Address of the faulting instruction (0 when unavailable).
    pub fault_ip: usize,
    /// Trap-assigned sequence number; gaps mark ring drops.
    pub seq: u32,
    /// OS thread id of the writer.
    pub thread_id: u32,
    /// Monotonic nanoseconds at fault time.
    pub timestamp_ns: u64,
}

/// Caller-supplied source position, echoed verbatim in events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub function: String,
    pub line: u32,
}

/// Old/new bytes of a change, in one of three encodings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValuePayload {
    /// Full bytes, present when the region fits [`INLINE_MAX`].
    Inline(Vec<u8>),
    /// Key into the value store holding the full bytes.
    Spilled(String),
    /// Payload could not be captured (no snapshot, or the spill path
    /// failed); previews are still delivered.
    Unavailable,
}

impl ValuePayload {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ValuePayload::Unavailable)
    }
}

/// Subscriber-facing structured diff for one region.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    /// Strictly increasing across all events of one engine instance.
    pub seq: u32,
    pub timestamp_ns: u64,
    pub adapter_id: u32,
    pub region_id: RegionId,
    pub name: Option<String>,
    pub location: Option<SourceLocation>,
    pub fault_ip: u64,
    /// Per-region change counter; versions the spill keys.
    pub epoch: u32,
    /// Up to [`PREVIEW_MAX`] bytes around the first changed byte.
    pub old_preview: Vec<u8>,
    pub new_preview: Vec<u8>,
    pub old_value: ValuePayload,
    pub new_value: ValuePayload,
    /// Opaque pointer-sized metadata supplied at watch time.
    pub user_data: usize,
}

/// Store key for a spilled payload: `mem/{adapter}/{region}/{epoch}/{side}`.
pub fn spill_key(adapter_id: u32, region_id: RegionId, epoch: u32, side: &str) -> String {
    format!("mem/{adapter_id}/{region_id}/{epoch}/{side}")
}

/// Engine counters surfaced through `stats()`. Layout is shared with the
/// C ABI.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Stats {
    pub tracked_regions: u32,
    pub armed_pages: u32,
    pub total_events: u64,
    pub ring_writes: u64,
    pub ring_drops: u64,
    pub poll_drops: u64,
    pub store_bytes_used: u64,
    pub worker_thread_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_key_shape() {
        assert_eq!(spill_key(3, 17, 5, "old"), "mem/3/17/5/old");
        assert_eq!(spill_key(3, 17, 5, "new"), "mem/3/17/5/new");
    }

    #[test]
    fn raw_fault_is_pointer_free() {
        // The handler copies these by value into the ring.
        fn assert_copy<T: Copy>() {}
        assert_copy::<RawFault>();
    }
}
