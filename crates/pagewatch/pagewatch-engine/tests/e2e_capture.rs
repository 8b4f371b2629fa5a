//! End-to-end capture scenarios, each in its own child process.
//!
//! The engine is a process-wide singleton with a SIGSEGV handler, so the
//! scenarios cannot share one test process. The single `#[test]` below
//! re-invokes this binary once per scenario with an environment variable
//! selecting the role; the wild-pointer scenario additionally asserts that
//! the child dies by the default signal action instead of being swallowed.
//!
//! ```bash
//! cargo test -p pagewatch-engine --test e2e_capture -- --nocapture
//! ```

use std::env;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use pagewatch_engine::{CaptureMode, EngineConfig, ValuePayload, WatchRequest};

/// Writes to stderr with immediate flush to bypass test output capture.
macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_SCENARIO: &str = "PAGEWATCH_E2E_SCENARIO";

/// How long a child waits for the worker to publish after a write: several
/// coalescing windows plus scheduling slack.
const SETTLE: Duration = Duration::from_millis(200);

fn test_config(tag: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.store.path = format!("/tmp/pagewatch_e2e_{tag}_{}.store", std::process::id());
    config
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Page-aligned zeroed allocation, so a watched range owns its pages and
/// protection never brushes unrelated data.
fn alloc_pages(len: usize) -> (*mut u8, std::alloc::Layout) {
    let layout = std::alloc::Layout::from_size_align(len.max(1), page_size()).unwrap();
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    (ptr, layout)
}

fn write_byte(base: *mut u8, offset: usize, value: u8) {
    unsafe { std::ptr::write_volatile(base.add(offset), value) };
}

fn watch_range(addr: usize, len: usize, name: &str) -> u32 {
    let req = WatchRequest {
        addr,
        len,
        adapter_id: 0,
        name: Some(name.to_owned()),
        user_data: 0,
        location: None,
    };
    unsafe { pagewatch_engine::watch(req) }.expect("watch failed")
}

fn cleanup(config: &EngineConfig) {
    let _ = std::fs::remove_file(&config.store.path);
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

/// Single-byte flip in a small region: one event, previews and full values
/// inline, old and new bytes exact.
fn scenario_single_byte_flip() {
    let config = test_config("flip");
    pagewatch_engine::init(config.clone()).unwrap();
    let (base, layout) = alloc_pages(page_size());

    let region = watch_range(base as usize, 16, "flip");
    write_byte(base, 7, 0xff);
    std::thread::sleep(SETTLE);

    let events = pagewatch_engine::drain(16);
    assert_eq!(events.len(), 1, "expected exactly one event");
    let ev = &events[0];
    assert_eq!(ev.region_id, region);
    assert_eq!(ev.epoch, 1);
    assert!(ev.seq > 0);
    assert_eq!(ev.name.as_deref(), Some("flip"));
    assert_eq!(ev.old_preview.len(), 16);
    assert_eq!(ev.new_preview.len(), 16);
    assert_eq!(ev.old_preview[7], 0x00);
    assert_eq!(ev.new_preview[7], 0xff);
    match (&ev.old_value, &ev.new_value) {
        (ValuePayload::Inline(old), ValuePayload::Inline(new)) => {
            assert_eq!(old.len(), 16);
            assert_eq!(new.len(), 16);
            assert_eq!(old[7], 0x00);
            assert_eq!(new[7], 0xff);
        }
        other => panic!("expected inline payloads, got {other:?}"),
    }

    let stats = pagewatch_engine::stats().unwrap();
    assert_eq!(stats.tracked_regions, 1);
    assert_eq!(stats.total_events, 1);
    assert!(stats.ring_writes >= 1);

    pagewatch_engine::shutdown();
    unsafe { std::alloc::dealloc(base, layout) };
    cleanup(&config);
    log!("[flip] ok");
}

/// Three writes inside one coalescing window fuse into a single event that
/// reflects all of them.
fn scenario_coalesce() {
    let config = test_config("coalesce");
    pagewatch_engine::init(config.clone()).unwrap();
    let (base, layout) = alloc_pages(page_size());

    watch_range(base as usize, 64, "burst");
    write_byte(base, 0, 0x11);
    write_byte(base, 10, 0x22);
    write_byte(base, 20, 0x33);
    std::thread::sleep(SETTLE);

    let events = pagewatch_engine::drain(16);
    assert_eq!(events.len(), 1, "burst must coalesce into one event");
    let ValuePayload::Inline(new) = &events[0].new_value else {
        panic!("expected inline payload");
    };
    assert_eq!((new[0], new[10], new[20]), (0x11, 0x22, 0x33));

    pagewatch_engine::shutdown();
    unsafe { std::alloc::dealloc(base, layout) };
    cleanup(&config);
    log!("[coalesce] ok");
}

/// Two regions on one page: a write into one must not produce an event for
/// the other.
fn scenario_two_regions_one_page() {
    let config = test_config("shared_page");
    pagewatch_engine::init(config.clone()).unwrap();
    let (base, layout) = alloc_pages(page_size());

    let _a = watch_range(base as usize, 64, "a");
    let b = watch_range(base as usize + 128, 64, "b");
    // Both regions share one armed page.
    assert_eq!(pagewatch_engine::stats().unwrap().armed_pages, 1);

    write_byte(base, 130, 0x5a);
    std::thread::sleep(SETTLE);

    let events = pagewatch_engine::drain(16);
    assert_eq!(events.len(), 1, "untouched region must stay silent");
    assert_eq!(events[0].region_id, b);

    pagewatch_engine::shutdown();
    unsafe { std::alloc::dealloc(base, layout) };
    cleanup(&config);
    log!("[shared_page] ok");
}

/// 64 KiB region: previews around the change, payloads spilled to the
/// value store and readable back in full.
fn scenario_large_spill() {
    let config = test_config("spill");
    pagewatch_engine::init(config.clone()).unwrap();
    const LEN: usize = 64 * 1024;
    let (base, layout) = alloc_pages(LEN);

    watch_range(base as usize, LEN, "blob");
    write_byte(base, 40_000, 0xab);
    std::thread::sleep(SETTLE);

    let events = pagewatch_engine::drain(16);
    assert_eq!(events.len(), 1);
    let ev = &events[0];
    assert_eq!(ev.old_preview.len(), 256);
    assert_eq!(ev.new_preview.len(), 256);
    // The preview window contains the changed byte.
    assert!(ev.new_preview.contains(&0xab));
    assert!(!ev.old_preview.contains(&0xab));

    let (ValuePayload::Spilled(key_old), ValuePayload::Spilled(key_new)) =
        (&ev.old_value, &ev.new_value)
    else {
        panic!("expected spilled payloads, got {:?}", ev.new_value);
    };
    let old = pagewatch_engine::fetch_spilled(key_old).unwrap();
    let new = pagewatch_engine::fetch_spilled(key_new).unwrap();
    assert_eq!(old.len(), LEN);
    assert_eq!(new.len(), LEN);
    assert_eq!(old[40_000], 0x00);
    assert_eq!(new[40_000], 0xab);
    assert!(pagewatch_engine::stats().unwrap().store_bytes_used > 2 * LEN as u64);

    pagewatch_engine::shutdown();
    unsafe { std::alloc::dealloc(base, layout) };
    cleanup(&config);
    log!("[spill] ok");
}

/// A wild write outside any tracked page must reach the previously
/// installed action (here the default: terminate), never be swallowed.
fn scenario_wild_pointer() {
    let config = test_config("wild");
    pagewatch_engine::init(config.clone()).unwrap();
    let (base, layout) = alloc_pages(page_size());
    watch_range(base as usize, 64, "decoy");
    let _ = layout;

    log!("[wild] dereferencing an untracked wild pointer, expecting death");
    unsafe { std::ptr::write_volatile(0xdead_0000 as *mut u8, 1) };
    unreachable!("the wild write must have killed the process");
}

/// Unwatching removes protection and silences the region.
fn scenario_unwatch() {
    let config = test_config("unwatch");
    pagewatch_engine::init(config.clone()).unwrap();
    let (base, layout) = alloc_pages(page_size());

    let region = watch_range(base as usize, 32, "once");
    let listed = pagewatch_engine::list_regions();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, region);
    assert_eq!(listed[0].name.as_deref(), Some("once"));
    assert_eq!(listed[0].len, 32);

    write_byte(base, 1, 0x01);
    std::thread::sleep(SETTLE);
    assert_eq!(pagewatch_engine::drain(16).len(), 1);
    assert_eq!(pagewatch_engine::list_regions()[0].epoch, 1);

    assert!(pagewatch_engine::unwatch(region));
    assert!(!pagewatch_engine::unwatch(region), "second unwatch is false");
    let stats = pagewatch_engine::stats().unwrap();
    assert_eq!(stats.tracked_regions, 0);
    assert_eq!(stats.armed_pages, 0);
    assert!(pagewatch_engine::list_regions().is_empty());

    // The page is plain read+write again; this write must trap nothing.
    write_byte(base, 2, 0x02);
    std::thread::sleep(SETTLE);
    assert!(pagewatch_engine::drain(16).is_empty());

    pagewatch_engine::shutdown();
    unsafe { std::alloc::dealloc(base, layout) };
    cleanup(&config);
    log!("[unwatch] ok");
}

/// Shutdown twice, then a fresh init: the second engine works end to end.
fn scenario_reinit() {
    let config = test_config("reinit");
    pagewatch_engine::init(config.clone()).unwrap();
    let (base, layout) = alloc_pages(page_size());
    watch_range(base as usize, 16, "first-life");
    pagewatch_engine::shutdown();
    pagewatch_engine::shutdown(); // idempotent

    pagewatch_engine::init(config.clone()).unwrap();
    let region = watch_range(base as usize, 16, "second-life");
    write_byte(base, 3, 0x99);
    std::thread::sleep(SETTLE);
    let events = pagewatch_engine::drain(16);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].region_id, region);
    assert_eq!(events[0].name.as_deref(), Some("second-life"));

    pagewatch_engine::shutdown();
    unsafe { std::alloc::dealloc(base, layout) };
    cleanup(&config);
    log!("[reinit] ok");
}

/// With event persistence on, a published change can be read back from the
/// store by its sequence number, previews and provenance intact.
fn scenario_journal() {
    let mut config = test_config("journal");
    config.store.persist_events = true;
    pagewatch_engine::init(config.clone()).unwrap();
    let (base, layout) = alloc_pages(page_size());

    watch_range(base as usize, 24, "journaled");
    write_byte(base, 9, 0x66);
    std::thread::sleep(SETTLE);

    let events = pagewatch_engine::drain(16);
    assert_eq!(events.len(), 1);
    let live = &events[0];

    let stored = pagewatch_engine::fetch_event(live.seq).unwrap();
    assert_eq!(stored.seq, live.seq);
    assert_eq!(stored.region_id, live.region_id);
    assert_eq!(stored.epoch, 1);
    assert_eq!(stored.name.as_deref(), Some("journaled"));
    assert_eq!(stored.old_preview, live.old_preview);
    assert_eq!(stored.new_preview, live.new_preview);
    assert_eq!(stored.new_preview[9], 0x66);
    // Inline payloads are not journaled; only previews survive.
    assert!(stored.new_value.is_unavailable());

    assert!(matches!(
        pagewatch_engine::fetch_event(live.seq + 1000),
        Err(pagewatch_engine::EngineError::NotFound)
    ));

    pagewatch_engine::shutdown();
    unsafe { std::alloc::dealloc(base, layout) };
    cleanup(&config);
    log!("[journal] ok");
}

/// Sampling capture mode: no page protection, same events.
fn scenario_sampling() {
    let mut config = test_config("sampling");
    config.capture_mode = CaptureMode::Sample;
    config.sample_interval_ms = 5;
    pagewatch_engine::init(config.clone()).unwrap();

    // No alignment needed: sampling never touches page protection.
    let mut buf = vec![0u8; 128];
    let region = watch_range(buf.as_ptr() as usize, buf.len(), "sampled");
    assert_eq!(pagewatch_engine::stats().unwrap().armed_pages, 0);

    write_byte(buf.as_mut_ptr(), 50, 0x77);
    std::thread::sleep(SETTLE);
    let events = pagewatch_engine::drain(16);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].region_id, region);
    assert_eq!(events[0].fault_ip, 0);
    let ValuePayload::Inline(new) = &events[0].new_value else {
        panic!("expected inline payload");
    };
    assert_eq!(new[50], 0x77);

    pagewatch_engine::shutdown();
    cleanup(&config);
    log!("[sampling] ok");
}

/// Callback and polling both see every event; adapter id is carried.
fn scenario_callback() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let config = test_config("callback");
    pagewatch_engine::init(config.clone()).unwrap();
    let adapter = pagewatch_engine::register_adapter("e2e").unwrap();
    let (base, layout) = alloc_pages(page_size());

    let seen = Arc::new(AtomicU32::new(0));
    let seen_cb = Arc::clone(&seen);
    pagewatch_engine::set_callback(Some(Box::new(move |ev| {
        assert_eq!(ev.epoch, 1);
        seen_cb.store(ev.adapter_id, Ordering::Relaxed);
    })))
    .unwrap();

    let req = WatchRequest {
        addr: base as usize,
        len: 32,
        adapter_id: adapter,
        name: Some("observed".into()),
        user_data: 0xbeef,
        location: None,
    };
    unsafe { pagewatch_engine::watch(req) }.unwrap();

    write_byte(base, 0, 0x42);
    std::thread::sleep(SETTLE);

    // Callback saw the event, tagged with its adapter.
    assert_eq!(seen.load(Ordering::Relaxed), adapter);
    // The polling queue got its own copy.
    let events = pagewatch_engine::drain(16);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].adapter_id, adapter);
    assert_eq!(events[0].user_data, 0xbeef);

    pagewatch_engine::unregister_adapter(adapter);
    pagewatch_engine::shutdown();
    unsafe { std::alloc::dealloc(base, layout) };
    cleanup(&config);
    log!("[callback] ok");
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

const SCENARIOS: &[(&str, fn())] = &[
    ("single_byte_flip", scenario_single_byte_flip),
    ("coalesce", scenario_coalesce),
    ("two_regions_one_page", scenario_two_regions_one_page),
    ("large_spill", scenario_large_spill),
    ("wild_pointer", scenario_wild_pointer),
    ("unwatch", scenario_unwatch),
    ("journal", scenario_journal),
    ("reinit", scenario_reinit),
    ("sampling", scenario_sampling),
    ("callback", scenario_callback),
];

#[test]
fn e2e_capture_scenarios() {
    // Child role: run one scenario and exit.
    if let Ok(name) = env::var(ENV_SCENARIO) {
        let scenario = SCENARIOS
            .iter()
            .find(|(n, _)| *n == name)
            .unwrap_or_else(|| panic!("unknown scenario {name}"));
        (scenario.1)();
        return;
    }

    let exe = env::current_exe().expect("current_exe");
    for (name, _) in SCENARIOS {
        log!("[orchestrator] running scenario '{name}'");
        let status = Command::new(&exe)
            .arg("--exact")
            .arg("e2e_capture_scenarios")
            .env(ENV_SCENARIO, name)
            .stderr(Stdio::inherit())
            .status()
            .expect("failed to spawn scenario child");

        if *name == "wild_pointer" {
            use std::os::unix::process::ExitStatusExt;
            assert!(
                !status.success(),
                "wild pointer child must not exit cleanly"
            );
            assert_eq!(
                status.signal(),
                Some(libc::SIGSEGV),
                "wild pointer child must die by the default SIGSEGV action"
            );
        } else {
            assert!(status.success(), "scenario '{name}' failed: {status}");
        }
    }
    log!("[orchestrator] all scenarios passed");
}
