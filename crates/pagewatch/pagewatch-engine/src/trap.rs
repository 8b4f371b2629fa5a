//! Write-fault trap: installation, classification, and the handler itself.
//!
//! The handler is the only code in the engine that runs in signal context.
//! Its contract: no allocation, no locks, no library calls beyond the
//! async-signal-safe set (`clock_gettime`, `mprotect`, `sigaction`). It
//! does exactly this: classify the fault against the armed-page table,
//! enqueue a raw event, open the temporary write window, return. Diffing
//! and re-arming happen on the worker thread.
//!
//! Faults on pages the engine does not track are not swallowed: the
//! action that was installed before ours is invoked in place, without
//! touching the live signal disposition, so capture stays armed even when
//! a host-installed handler resolves a foreign fault and execution
//! continues. Only when the saved action is `SIG_DFL`/`SIG_IGN` (nothing
//! callable) is the disposition handed back: the faulting instruction then
//! re-executes under it, which for the default action terminates the
//! process.

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;

use pagewatch_core::{clock, RawFault};

use crate::shared::{self, HANDLER_DEPTH};

/// Previous `SIGSEGV` action, captured atomically at install time and used
/// both for forwarding foreign faults and for restore at shutdown.
struct OldAction(UnsafeCell<MaybeUninit<libc::sigaction>>);

// Written once by `install` (via the kernel) before any fault can reach the
// handler; read-only afterwards.
unsafe impl Sync for OldAction {}

static OLD_ACTION: OldAction = OldAction(UnsafeCell::new(MaybeUninit::zeroed()));

/// Installs the write-fault handler, saving the previous action.
pub fn install() -> Result<(), io::Error> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            on_write_fault;
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);

        // The old action lands directly in the static, so a fault arriving
        // immediately after installation already finds it in place.
        if libc::sigaction(
            libc::SIGSEGV,
            &action,
            OLD_ACTION.0.get() as *mut libc::sigaction,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Restores the action that was installed before [`install`].
pub fn uninstall() {
    unsafe {
        libc::sigaction(
            libc::SIGSEGV,
            OLD_ACTION.0.get() as *const libc::sigaction,
            std::ptr::null_mut(),
        );
    }
}

/// Hands a foreign fault to the action that was installed before ours.
///
/// A callable saved handler is invoked directly, which leaves our own
/// handler installed for the next tracked fault. `SIG_DFL` and `SIG_IGN`
/// cannot be invoked; for those the saved action is reinstated and the
/// handler returns, so the re-executed faulting instruction is taken by
/// the restored disposition (terminating the process under the default).
#[inline]
unsafe fn forward_to_previous(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let old = unsafe { &*(OLD_ACTION.0.get() as *const libc::sigaction) };
    match old.sa_sigaction {
        libc::SIG_DFL | libc::SIG_IGN => unsafe {
            libc::sigaction(libc::SIGSEGV, old, std::ptr::null_mut());
        },
        handler if old.sa_flags & libc::SA_SIGINFO != 0 => {
            let forward: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                unsafe { std::mem::transmute(handler) };
            forward(sig, info, ctx);
        }
        handler => {
            let forward: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(handler) };
            forward(sig);
        }
    }
}

/// Faulting instruction address out of the signal context.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[inline]
unsafe fn fault_ip(ctx: *mut libc::c_void) -> usize {
    if ctx.is_null() {
        return 0;
    }
    let uc = ctx as *const libc::ucontext_t;
    unsafe { (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as usize }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
#[inline]
unsafe fn fault_ip(ctx: *mut libc::c_void) -> usize {
    if ctx.is_null() {
        return 0;
    }
    let uc = ctx as *const libc::ucontext_t;
    unsafe { (*uc).uc_mcontext.pc as usize }
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
#[inline]
unsafe fn fault_ip(_ctx: *mut libc::c_void) -> usize {
    0
}

#[cfg(target_os = "linux")]
#[inline]
unsafe fn fault_addr(info: *mut libc::siginfo_t) -> usize {
    unsafe { (*info).si_addr() as usize }
}

#[cfg(not(target_os = "linux"))]
#[inline]
unsafe fn fault_addr(info: *mut libc::siginfo_t) -> usize {
    unsafe { (*info).si_addr as usize }
}

#[cfg(target_os = "linux")]
#[inline]
pub(crate) fn current_tid() -> u32 {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u32
}

#[cfg(not(target_os = "linux"))]
#[inline]
pub(crate) fn current_tid() -> u32 {
    (unsafe { libc::pthread_self() }) as u32
}

/// The `SIGSEGV` handler.
extern "C" fn on_write_fault(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    HANDLER_DEPTH.fetch_add(1, Ordering::SeqCst);
    handle(sig, info, ctx);
    HANDLER_DEPTH.fetch_sub(1, Ordering::SeqCst);
}

#[inline]
fn handle(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let Some(shared) = shared::current() else {
        unsafe { forward_to_previous(sig, info, ctx) };
        return;
    };

    if sig != libc::SIGSEGV || info.is_null() {
        unsafe { forward_to_previous(sig, info, ctx) };
        return;
    }

    let fault_addr = unsafe { fault_addr(info) };
    let page_base = fault_addr & !(shared.page_size - 1);

    // Lock-free membership probe; a miss is a foreign fault.
    if !shared.armed.contains(page_base) {
        unsafe { forward_to_previous(sig, info, ctx) };
        return;
    }

    let fault = RawFault {
        page_base,
        fault_ip: unsafe { fault_ip(ctx) },
        seq: shared.seq.fetch_add(1, Ordering::Relaxed),
        thread_id: current_tid(),
        timestamp_ns: clock::now_ns(),
    };

    // A full ring counts a drop inside `push`; the write window still opens
    // below so the faulting store retires instead of re-faulting forever.
    let _ = shared.ring.push(fault);

    unsafe {
        libc::mprotect(
            page_base as *mut libc::c_void,
            shared.page_size,
            libc::PROT_READ | libc::PROT_WRITE,
        );
    }
}
