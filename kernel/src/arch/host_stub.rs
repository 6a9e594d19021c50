//! Host stand-in for the architecture contract, compiled only under
//! `cfg(test)` (or non-x86_64 hosts) so the algorithmic core can be built
//! and unit-tested without real hardware. None of the scheduler's
//! algorithmic tests exercise `save_context`/`load_context`; both panic if
//! reached.

use core::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

pub fn interrupts_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn disable_interrupts() {
    ENABLED.store(false, Ordering::Relaxed);
}

pub fn enable_interrupts() {
    ENABLED.store(true, Ordering::Relaxed);
}

pub fn halt() {}

/// # Safety
/// Test-only stand-in; never actually switches control flow.
pub unsafe fn save_context(_out: *mut super::Context) -> i32 {
    0
}

/// # Safety
/// Test-only stand-in; never actually switches control flow.
pub unsafe fn load_context(_ctx: *const super::Context) -> ! {
    unreachable!("load_context is architecture-specific and not exercised on the host")
}
