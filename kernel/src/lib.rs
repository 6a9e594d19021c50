//! Hexahedron core runtime substrate.
//!
//! This crate is the mutually-dependent heart of the kernel: the physical
//! frame allocator, the paging layer, the per-process virtual address space
//! with lazy mapping and copy-on-write, the slab allocator, the
//! process/thread scheduler with signal delivery, and the UNIX-domain
//! socket layer that exercises all of the above.
//!
//! Interrupt dispatch, context-switch assembly, device drivers, the VFS,
//! the ELF loader and ACPI/SMP bring-up are external collaborators named
//! only by the contracts they expose (see [`arch`]).
//!
//! Built `no_std` for the bare-metal target; compiled with `std` under
//! `cfg(test)` so the algorithmic core (allocator bitmaps, slab geometry,
//! VAS interval lists, signal sets, run-queue ordering, socket state
//! machines) can be exercised on the host without a hardware harness.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;

pub mod arch;
pub mod errno;
pub mod ipc;
pub mod logging;
pub mod mm;
pub mod process;
pub mod sched;
pub mod signal;
pub mod sync;
pub mod syscall;

#[cfg(not(test))]
mod panic_handler {
    use core::panic::PanicInfo;

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        crate::logging::fatal(info);
        loop {
            crate::arch::halt();
        }
    }
}

#[cfg(not(test))]
#[global_allocator]
static KERNEL_HEAP: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

/// One-time bring-up of the core subsystems, called from the architecture's
/// entry point once the collaborator (interrupts, GDT/IDT, boot memory map)
/// has handed control to the kernel proper.
///
/// # Safety
/// `heap_range` must describe unmapped, owned virtual memory suitable for
/// the kernel heap, and must be called at most once.
#[cfg(not(test))]
pub unsafe fn init_core(heap_start: usize, heap_size: usize) {
    KERNEL_HEAP.lock().init(heap_start as *mut u8, heap_size);
    logging::init();
    mm::frame::init_subsystem();
    process::pid::init();
    sched::init();
}
