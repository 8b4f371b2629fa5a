//! C ABI: the language-neutral surface bindings build on.
//!
//! Every exported struct is `#[repr(C)]` and every pointer an event hands
//! out stays valid until `pagewatch_free_event` (or, for callback
//! deliveries, until the callback returns; retained data must be copied).

#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_void, CStr, CString};

use pagewatch_config::EngineConfig;
use pagewatch_core::{ChangeEvent, RegionInfo, Stats, ValuePayload, WatchRequest};
use pagewatch_core::error::STATUS_OK;

use crate::engine;
use crate::subscriber::Callback;

pub type pagewatch_stats_t = Stats;

/// Wire form of one change event.
#[repr(C)]
pub struct pagewatch_change_event_t {
    pub seq: u32,
    pub timestamp_ns: u64,
    pub adapter_id: u32,
    pub region_id: u32,
    pub name: *const c_char,
    pub file: *const c_char,
    pub function: *const c_char,
    pub line: u32,
    pub fault_ip: u64,
    pub epoch: u32,
    pub old_preview: *const u8,
    pub old_preview_len: usize,
    pub new_preview: *const u8,
    pub new_preview_len: usize,
    /// Full old bytes when inline; null when spilled or unavailable.
    pub old_value: *const u8,
    pub old_value_len: usize,
    pub new_value: *const u8,
    pub new_value_len: usize,
    /// Value-store key for a spilled payload; null otherwise.
    pub store_key_old: *const c_char,
    pub store_key_new: *const c_char,
    /// Set when a payload side was dropped (no snapshot or spill failure).
    pub payload_unavailable: u8,
    pub user_data: *mut c_void,
    /// Backing allocation; released by `pagewatch_free_event`.
    owner: *mut c_void,
}

/// Callback signature shared by all bindings.
pub type pagewatch_callback_t =
    extern "C" fn(event: *const pagewatch_change_event_t, ctx: *mut c_void);

/// Heap storage the exported pointers borrow from.
struct EventOwner {
    event: ChangeEvent,
    name: Option<CString>,
    file: Option<CString>,
    function: Option<CString>,
    key_old: Option<CString>,
    key_new: Option<CString>,
}

fn cstring(s: &str) -> Option<CString> {
    CString::new(s).ok()
}

fn export_event(event: ChangeEvent) -> pagewatch_change_event_t {
    let owner = Box::new(EventOwner {
        name: event.name.as_deref().and_then(cstring),
        file: event
            .location
            .as_ref()
            .and_then(|loc| cstring(&loc.file)),
        function: event
            .location
            .as_ref()
            .and_then(|loc| cstring(&loc.function)),
        key_old: match &event.old_value {
            ValuePayload::Spilled(key) => cstring(key),
            _ => None,
        },
        key_new: match &event.new_value {
            ValuePayload::Spilled(key) => cstring(key),
            _ => None,
        },
        event,
    });

    let cptr = |s: &Option<CString>| s.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());
    let inline = |payload: &ValuePayload| match payload {
        ValuePayload::Inline(bytes) => (bytes.as_ptr(), bytes.len()),
        _ => (std::ptr::null(), 0),
    };

    let ev = &owner.event;
    let (old_value, old_value_len) = inline(&ev.old_value);
    let (new_value, new_value_len) = inline(&ev.new_value);
    let unavailable = ev.old_value.is_unavailable() || ev.new_value.is_unavailable();

    let mut out = pagewatch_change_event_t {
        seq: ev.seq,
        timestamp_ns: ev.timestamp_ns,
        adapter_id: ev.adapter_id,
        region_id: ev.region_id,
        name: cptr(&owner.name),
        file: cptr(&owner.file),
        function: cptr(&owner.function),
        line: ev.location.as_ref().map_or(0, |loc| loc.line),
        fault_ip: ev.fault_ip,
        epoch: ev.epoch,
        old_preview: ev.old_preview.as_ptr(),
        old_preview_len: ev.old_preview.len(),
        new_preview: ev.new_preview.as_ptr(),
        new_preview_len: ev.new_preview.len(),
        old_value,
        old_value_len,
        new_value,
        new_value_len,
        store_key_old: cptr(&owner.key_old),
        store_key_new: cptr(&owner.key_new),
        payload_unavailable: unavailable as u8,
        user_data: ev.user_data as *mut c_void,
        owner: std::ptr::null_mut(),
    };
    out.owner = Box::into_raw(owner) as *mut c_void;
    out
}

unsafe fn release(event: &mut pagewatch_change_event_t) {
    if event.owner.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(event.owner as *mut EventOwner) });
    event.owner = std::ptr::null_mut();
}

/// # Safety
/// Standard ABI entry; no pointers are consumed.
#[unsafe(no_mangle)]
pub extern "C" fn pagewatch_init() -> i32 {
    match engine::init(EngineConfig::default()) {
        Ok(()) => STATUS_OK,
        Err(err) => err.code(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn pagewatch_shutdown() {
    engine::shutdown();
}

/// # Safety
/// `name` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagewatch_register_adapter(name: *const c_char) -> u32 {
    let name = if name.is_null() {
        ""
    } else {
        unsafe { CStr::from_ptr(name) }.to_str().unwrap_or("")
    };
    engine::register_adapter(name).unwrap_or(0)
}

#[unsafe(no_mangle)]
pub extern "C" fn pagewatch_unregister_adapter(adapter_id: u32) {
    engine::unregister_adapter(adapter_id);
}

/// # Safety
/// `[addr, addr+size)` must be valid readable memory until the region is
/// unwatched; `name` must be null or NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagewatch_watch(
    addr: u64,
    size: usize,
    name: *const c_char,
    user_data: *mut c_void,
) -> u32 {
    let name = if name.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(name) }
            .to_str()
            .ok()
            .map(str::to_owned)
    };
    let req = WatchRequest {
        addr: addr as usize,
        len: size,
        adapter_id: 0,
        name,
        user_data: user_data as usize,
        location: None,
    };
    unsafe { engine::watch(req) }.unwrap_or(0)
}

#[unsafe(no_mangle)]
pub extern "C" fn pagewatch_unwatch(region_id: u32) -> bool {
    engine::unwatch(region_id)
}

struct CallbackCtx(*mut c_void);
// The ABI contract makes the context pointer the caller's concurrency
// problem; the engine only passes it through from the worker thread.
unsafe impl Send for CallbackCtx {}
unsafe impl Sync for CallbackCtx {}

/// # Safety
/// `callback` must remain callable until replaced or shutdown.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagewatch_set_callback(
    callback: Option<pagewatch_callback_t>,
    ctx: *mut c_void,
) -> i32 {
    let wrapped: Option<Callback> = callback.map(|cb| {
        let ctx = CallbackCtx(ctx);
        Box::new(move |event: &ChangeEvent| {
            let ctx = &ctx;
            let mut exported = export_event(event.clone());
            cb(&exported as *const pagewatch_change_event_t, ctx.0);
            // The event is borrowed for the duration of the invocation.
            unsafe { release(&mut exported) };
        }) as Callback
    });
    match engine::set_callback(wrapped) {
        Ok(()) => STATUS_OK,
        Err(err) => err.code(),
    }
}

/// # Safety
/// `out` must point at `max_n` writable event slots. Each returned event
/// must be released with `pagewatch_free_event`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagewatch_drain(
    out: *mut pagewatch_change_event_t,
    max_n: usize,
) -> usize {
    if out.is_null() || max_n == 0 {
        return 0;
    }
    let events = engine::drain(max_n);
    let n = events.len();
    for (i, event) in events.into_iter().enumerate() {
        unsafe { out.add(i).write(export_event(event)) };
    }
    n
}

/// # Safety
/// `out` must point at a writable stats struct.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagewatch_stats(out: *mut pagewatch_stats_t) -> i32 {
    if out.is_null() {
        return pagewatch_core::EngineError::InvalidAddress.code();
    }
    match engine::stats() {
        Ok(stats) => {
            unsafe { out.write(stats) };
            STATUS_OK
        }
        Err(err) => err.code(),
    }
}

/// # Safety
/// `event` must be null or a value produced by `pagewatch_drain`.
/// Idempotent: releasing twice is a no-op.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagewatch_free_event(event: *mut pagewatch_change_event_t) {
    if event.is_null() {
        return;
    }
    unsafe { release(&mut *event) };
}

/// One tracked region, for enumeration. Self-contained: the name is an
/// inline NUL-terminated buffer, so no free call is needed.
#[repr(C)]
pub struct pagewatch_region_info_t {
    pub region_id: u32,
    pub adapter_id: u32,
    pub addr: u64,
    pub size: usize,
    pub epoch: u32,
    pub last_check_ns: u64,
    pub name: [c_char; 64],
}

fn export_region_info(info: &RegionInfo) -> pagewatch_region_info_t {
    let mut name = [0 as c_char; 64];
    if let Some(s) = &info.name {
        // Truncate to the buffer, always leaving the trailing NUL.
        for (dst, &src) in name[..63].iter_mut().zip(s.as_bytes()) {
            *dst = src as c_char;
        }
    }
    pagewatch_region_info_t {
        region_id: info.id,
        adapter_id: info.adapter_id,
        addr: info.addr as u64,
        size: info.len,
        epoch: info.epoch,
        last_check_ns: info.last_check_ns,
        name,
    }
}

/// # Safety
/// `out` must point at `max_n` writable info slots.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagewatch_list_regions(
    out: *mut pagewatch_region_info_t,
    max_n: usize,
) -> usize {
    if out.is_null() || max_n == 0 {
        return 0;
    }
    let infos = engine::list_regions();
    let n = infos.len().min(max_n);
    for (i, info) in infos[..n].iter().enumerate() {
        unsafe { out.add(i).write(export_region_info(info)) };
    }
    n
}
