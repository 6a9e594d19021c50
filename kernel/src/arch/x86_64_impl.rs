//! x86_64 bindings for the architecture contract. Thin wrappers over the
//! `x86_64` crate; the real interrupt entry/exit path and the context-switch
//! assembly trampoline are provided by the boot/interrupt collaborator and
//! only declared here.

use x86_64::instructions::interrupts;

#[inline]
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

#[inline]
pub fn disable_interrupts() {
    interrupts::disable();
}

#[inline]
pub fn enable_interrupts() {
    interrupts::enable();
}

#[inline]
pub fn halt() {
    x86_64::instructions::hlt();
}

extern "C" {
    /// Save the callee-saved registers and stack pointer of the calling
    /// thread into `out`. Returns 0 on the saving pass, non-zero when a
    /// later [`load_context`] resumes this context.
    ///
    /// Provided by the context-switch assembly trampoline (out of scope).
    fn __hxh_save_context(out: *mut super::Context) -> i32;

    /// Restore `ctx` and jump to it. Never returns.
    ///
    /// Provided by the context-switch assembly trampoline (out of scope).
    fn __hxh_load_context(ctx: *const super::Context) -> !;
}

/// # Safety
/// `out` must point at valid, writable storage for a [`super::Context`].
#[inline]
pub unsafe fn save_context(out: *mut super::Context) -> i32 {
    __hxh_save_context(out)
}

/// # Safety
/// `ctx` must describe a context previously produced by [`save_context`]
/// or initialized by the thread-creation path.
#[inline]
pub unsafe fn load_context(ctx: *const super::Context) -> ! {
    __hxh_load_context(ctx)
}
