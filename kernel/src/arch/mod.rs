//! Architecture contract surface.
//!
//! Everything in this module is a collaborator this crate consumes but does
//! not implement: interrupt masking is a thin wrapper over the `x86_64`
//! crate, while context save/restore and the actual thread hand-off are
//! assembly trampolines that live outside this repository's scope. They are
//! declared here as the narrow contract the scheduler and locks need.

use core::sync::atomic::{AtomicBool, Ordering};

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", not(test)))] {
        mod x86_64_impl;
        pub use x86_64_impl::*;
    } else {
        mod host_stub;
        pub use host_stub::*;
    }
}

/// Saved-register context handed between threads by the scheduler.
///
/// The layout is owned by the context-switch trampoline (out of scope for
/// this crate); the scheduler only ever moves this struct by pointer.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Tracks whether this CPU currently holds interrupts disabled via a
/// nested [`without_interrupts`] region. Used only for debug assertions
/// ("no kernel code sleeps while holding a spinlock").
static IRQ_GUARD_DEPTH: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn irq_guard_active() -> bool {
    IRQ_GUARD_DEPTH.load(Ordering::Relaxed)
}

#[inline]
pub(crate) fn set_irq_guard(v: bool) {
    IRQ_GUARD_DEPTH.store(v, Ordering::Relaxed);
}

/// A decoded page fault, as the trap-entry stub (out of scope: reading
/// `CR2` and the CPU-pushed error code) hands it to
/// [`crate::sched::page_fault`].
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    pub addr: usize,
    pub write: bool,
    pub user: bool,
}

/// Runs `f` with interrupts disabled, restoring the prior interrupt-enable
/// state on exit. This is the primitive [`crate::sync::Spinlock`] is built
/// on.
pub fn without_interrupts<F: FnOnce() -> R, R>(f: F) -> R {
    let was_enabled = interrupts_enabled();
    disable_interrupts();
    let prev_guard = irq_guard_active();
    set_irq_guard(true);
    let r = f();
    set_irq_guard(prev_guard);
    if was_enabled {
        enable_interrupts();
    }
    r
}
