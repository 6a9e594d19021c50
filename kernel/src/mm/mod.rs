//! Physical memory, paging, slab allocation, and per-process address spaces.

pub mod frame;
pub mod layout;
pub mod paging;
pub mod slab;
pub mod vas;

/// Fatal consistency violation inside the memory subsystems: double-free,
/// bitmap/metadata mismatch, or an unresolvable kernel-mode page fault.
/// There is no recovery path; the caller should log and halt. The `&str`
/// names the specific violation (`"double free"`, `"retain after free"`,
/// ...); `Display` always carries the `MEMORY_MANAGEMENT_ERROR` tag spec
/// §4.B(iii) requires in the panic message so every call site and the
/// tests asserting on it stay in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct MemoryManagementError(pub &'static str);

impl core::fmt::Display for MemoryManagementError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "MEMORY_MANAGEMENT_ERROR: {}", self.0)
    }
}

/// Panics with the fixed `MEMORY_MANAGEMENT_ERROR` tag plus caller-supplied
/// detail. The single place every frame-allocator consistency check routes
/// through, so the literal the spec and the tests key on can't drift from
/// an individual call site's wording.
pub fn fatal(kind: &'static str, detail: core::fmt::Arguments) -> ! {
    panic!("{}: {}", MemoryManagementError(kind), detail)
}
