//! Physical Frame Allocator.
//!
//! Owns every usable physical frame. Frames are grouped into [`Section`]s,
//! each a contiguous physical range with its own bitmap, per-page
//! metadata, and mutex; sections chain into a single zone list. A bump
//! "hint" tracks the first bitmap byte that might still have a free bit,
//! so steady-state allocation rarely scans from the start.
//!
//! Invariant enforced throughout: `refcount(f) == 0 <=> bitmap-bit(f) == 0
//! <=> frame f is free`. Violating it (double free, retain-after-free,
//! metadata corruption) is fatal: [`crate::mm::MemoryManagementError`].

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::vec;
use alloc::vec::Vec;

use crate::mm::layout::PAGE_SIZE;
use crate::sync::Spinlock;

bitflags::bitflags! {
    #[derive(Default)]
    pub struct PageFlags: u8 {
        const FREE = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Available,
    Reserved,
    AcpiNvs,
    AcpiReclaimable,
    Bad,
    Kernel,
    Module,
}

#[derive(Debug, Clone, Copy)]
pub struct PhysRegion {
    pub start: usize,
    pub len: usize,
    pub kind: RegionKind,
}

struct PageMeta {
    flags: PageFlags,
    refcount: u8,
}

struct SectionInner {
    bitmap: Vec<u8>,
    metadata: Vec<PageMeta>,
    hint: usize,
}

/// A contiguous physical range owned by the allocator.
pub struct Section {
    pub start: usize,
    pub page_count: usize,
    inner: Spinlock<SectionInner>,
}

impl Section {
    fn new(start: usize, page_count: usize) -> Self {
        let bitmap_bytes = (page_count + 7) / 8;
        Section {
            start,
            page_count,
            inner: Spinlock::new(SectionInner {
                bitmap: vec![0u8; bitmap_bytes],
                metadata: (0..page_count)
                    .map(|_| PageMeta { flags: PageFlags::FREE, refcount: 0 })
                    .collect(),
                hint: 0,
            }),
        }
    }

    fn contains(&self, page_index: usize) -> bool {
        page_index < self.page_count
    }

    fn set_used(inner: &mut SectionInner, idx: usize) {
        inner.bitmap[idx / 8] |= 1 << (idx % 8);
        inner.metadata[idx].flags.remove(PageFlags::FREE);
        inner.metadata[idx].refcount = 1;
    }

    fn set_free(inner: &mut SectionInner, idx: usize) {
        inner.bitmap[idx / 8] &= !(1 << (idx % 8));
        inner.metadata[idx].flags.insert(PageFlags::FREE);
        inner.metadata[idx].refcount = 0;
        let byte = idx / 8;
        if byte < inner.hint {
            inner.hint = byte;
        }
    }

    fn refresh_hint(inner: &mut SectionInner) {
        while inner.hint < inner.bitmap.len() && inner.bitmap[inner.hint] == 0xFF {
            inner.hint += 1;
        }
    }

    /// Finds and marks used a single free page. Returns its index.
    fn alloc_one(&self) -> Option<usize> {
        let mut inner = self.inner.lock();
        for byte in inner.hint..inner.bitmap.len() {
            if inner.bitmap[byte] == 0xFF {
                continue;
            }
            for bit in 0..8 {
                let idx = byte * 8 + bit;
                if idx >= self.page_count {
                    break;
                }
                if inner.bitmap[byte] & (1 << bit) == 0 {
                    Self::set_used(&mut inner, idx);
                    inner.hint = byte;
                    Self::refresh_hint(&mut inner);
                    return Some(idx);
                }
            }
        }
        None
    }

    /// Finds a run of `n` contiguous clear bits starting the scan at the
    /// hint. Returns the starting index.
    fn alloc_run(&self, n: usize) -> Option<usize> {
        let mut inner = self.inner.lock();
        if n == 0 || n > self.page_count {
            return None;
        }
        let mut run_start = None;
        let mut run_len = 0usize;
        for idx in 0..self.page_count {
            let used = inner.bitmap[idx / 8] & (1 << (idx % 8)) != 0;
            if used {
                run_start = None;
                run_len = 0;
                continue;
            }
            if run_start.is_none() {
                run_start = Some(idx);
            }
            run_len += 1;
            if run_len == n {
                let start = run_start.unwrap();
                for i in start..start + n {
                    Self::set_used(&mut inner, i);
                }
                Self::refresh_hint(&mut inner);
                return Some(start);
            }
        }
        None
    }

    fn free_one(&self, idx: usize) {
        let mut inner = self.inner.lock();
        if inner.bitmap[idx / 8] & (1 << (idx % 8)) == 0 {
            crate::mm::fatal("double free", format_args!("frame at section offset {idx}"));
        }
        Self::set_free(&mut inner, idx);
    }

    fn retain(&self, idx: usize) {
        let mut inner = self.inner.lock();
        if inner.metadata[idx].refcount == 0 {
            crate::mm::fatal("retain after free", format_args!("frame at offset {idx}"));
        }
        inner.metadata[idx].refcount = inner.metadata[idx].refcount.saturating_add(1);
    }

    /// Decrements refcount; frees the frame if it reaches zero. Returns
    /// true if the frame was freed.
    fn release(&self, idx: usize) -> bool {
        let mut inner = self.inner.lock();
        if inner.metadata[idx].refcount == 0 {
            crate::mm::fatal("release after free", format_args!("frame at offset {idx}"));
        }
        inner.metadata[idx].refcount -= 1;
        if inner.metadata[idx].refcount == 0 {
            Self::set_free(&mut inner, idx);
            true
        } else {
            false
        }
    }

    fn refcount(&self, idx: usize) -> u8 {
        self.inner.lock().metadata[idx].refcount
    }

    fn is_free(&self, idx: usize) -> bool {
        self.inner.lock().metadata[idx].flags.contains(PageFlags::FREE)
    }
}

/// Owns all sections. There is exactly one of these, [`ALLOCATOR`].
pub struct PhysicalFrameAllocator {
    sections: Spinlock<Vec<Section>>,
    total_pages: AtomicUsize,
}

impl PhysicalFrameAllocator {
    const fn empty() -> Self {
        PhysicalFrameAllocator {
            sections: Spinlock::new(Vec::new()),
            total_pages: AtomicUsize::new(0),
        }
    }

    /// Consumes the firmware-provided memory map, creating one [`Section`]
    /// per `Available` region. The per-page metadata for a region lives in
    /// that region's own `Vec` (a host/no_std simplification of the
    /// "largest region hosts everyone's metadata" bootstrap trick, which
    /// exists to avoid a chicken-and-egg allocation before any allocator
    /// is up; with a global Rust allocator already available at init time
    /// via the early boot heap, the trick is unnecessary).
    pub fn init(&self, regions: &[PhysRegion]) {
        let mut sections = self.sections.lock();
        let mut total = 0usize;
        for region in regions {
            if region.kind != RegionKind::Available {
                continue;
            }
            let page_count = region.len / PAGE_SIZE;
            if page_count == 0 {
                continue;
            }
            total += page_count;
            sections.push(Section::new(region.start, page_count));
        }
        self.total_pages.store(total, Ordering::Relaxed);
    }

    fn locate(&self, sections: &[Section], phys: usize) -> Option<(usize, usize)> {
        for (si, s) in sections.iter().enumerate() {
            if phys >= s.start && phys < s.start + s.page_count * PAGE_SIZE {
                return Some((si, (phys - s.start) / PAGE_SIZE));
            }
        }
        None
    }

    pub fn allocate_page(&self) -> usize {
        let sections = self.sections.lock();
        for s in sections.iter() {
            if let Some(idx) = s.alloc_one() {
                return s.start + idx * PAGE_SIZE;
            }
        }
        panic!("OUT_OF_MEMORY");
    }

    /// Best-effort non-panicking variant used by syscall paths (`mmap`,
    /// page-fault resolution) that must surface `ENOMEM` to the caller
    /// instead of halting the kernel.
    pub fn try_allocate_page(&self) -> Option<usize> {
        let sections = self.sections.lock();
        for s in sections.iter() {
            if let Some(idx) = s.alloc_one() {
                return Some(s.start + idx * PAGE_SIZE);
            }
        }
        log::warn!("frame allocation failed: no free page in any section");
        None
    }

    pub fn allocate_pages(&self, n: usize) -> usize {
        self.try_allocate_pages(n).unwrap_or_else(|| panic!("OUT_OF_MEMORY"))
    }

    pub fn try_allocate_pages(&self, n: usize) -> Option<usize> {
        let sections = self.sections.lock();
        for s in sections.iter() {
            if let Some(idx) = s.alloc_run(n) {
                return Some(s.start + idx * PAGE_SIZE);
            }
        }
        log::warn!("frame allocation failed: no run of {n} contiguous free pages in any section");
        None
    }

    pub fn free_page(&self, phys: usize) {
        let sections = self.sections.lock();
        let (si, idx) = self
            .locate(&sections, phys)
            .unwrap_or_else(|| crate::mm::fatal("unowned frame", format_args!("free of {phys:#x}")));
        sections[si].free_one(idx);
    }

    pub fn free_pages(&self, phys: usize, n: usize) {
        for i in 0..n {
            self.free_page(phys + i * PAGE_SIZE);
        }
    }

    pub fn retain(&self, phys: usize) {
        let sections = self.sections.lock();
        let (si, idx) = self
            .locate(&sections, phys)
            .unwrap_or_else(|| crate::mm::fatal("unowned frame", format_args!("retain of {phys:#x}")));
        sections[si].retain(idx);
    }

    /// Decrements the frame's refcount, freeing it at zero. Returns
    /// whether the frame was freed.
    pub fn release(&self, phys: usize) -> bool {
        let sections = self.sections.lock();
        let (si, idx) = self
            .locate(&sections, phys)
            .unwrap_or_else(|| crate::mm::fatal("unowned frame", format_args!("release of {phys:#x}")));
        sections[si].release(idx)
    }

    pub fn refcount(&self, phys: usize) -> u8 {
        let sections = self.sections.lock();
        let (si, idx) = self
            .locate(&sections, phys)
            .unwrap_or_else(|| crate::mm::fatal("unowned frame", format_args!("refcount of {phys:#x}")));
        sections[si].refcount(idx)
    }

    pub fn is_free(&self, phys: usize) -> bool {
        let sections = self.sections.lock();
        match self.locate(&sections, phys) {
            Some((si, idx)) => sections[si].is_free(idx),
            None => false,
        }
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages.load(Ordering::Relaxed)
    }
}

pub static ALLOCATOR: PhysicalFrameAllocator = PhysicalFrameAllocator::empty();

pub fn init_subsystem() {
    // Real hardware init happens via `init_with_regions` once the boot
    // collaborator hands over the firmware memory map; this just ensures
    // the static is touched at a known point during bring-up.
}

pub fn init_with_regions(regions: &[PhysRegion]) {
    ALLOCATOR.init(regions);
}

pub fn allocate_page() -> usize {
    ALLOCATOR.allocate_page()
}

pub fn free_page(phys: usize) {
    ALLOCATOR.free_page(phys)
}

/// Initializes the global [`ALLOCATOR`] exactly once for tests that need
/// real physical frames (paging/VAS/slab tests exercise it through the
/// production singleton rather than a local instance, since those
/// modules are written against the global by design). Safe to call from
/// every test that needs it; later callers just observe the same state.
///
/// On real hardware a "physical address" is just an integer the MMU
/// resolves; here, on the host, `remap_phys_copy` and slab storage
/// dereference these addresses directly (there is no identity-mapped
/// physical window to borrow, unlike the real target). So the region this
/// hands to the allocator is backed by an actual leaked heap buffer rather
/// than an arbitrary physical-looking constant, making every "frame"
/// handed out a real, dereferenceable host address.
#[cfg(test)]
pub fn test_init_global() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        const LEN: usize = 64 * 1024 * 1024;
        let backing: &'static mut [u8] = alloc::boxed::Box::leak(
            alloc::vec![0u8; LEN].into_boxed_slice(),
        );
        let start = backing.as_mut_ptr() as usize;
        ALLOCATOR.init(&[PhysRegion { start, len: LEN, kind: RegionKind::Available }]);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(pages: usize) -> PhysicalFrameAllocator {
        let pfa = PhysicalFrameAllocator::empty();
        pfa.init(&[PhysRegion { start: 0x10_0000, len: pages * PAGE_SIZE, kind: RegionKind::Available }]);
        pfa
    }

    #[test]
    fn allocate_free_round_trip_preserves_state() {
        let pfa = fresh(64);
        let p = pfa.allocate_page();
        assert!(!pfa.is_free(p));
        pfa.free_page(p);
        assert!(pfa.is_free(p));
        let p2 = pfa.allocate_page();
        assert_eq!(p, p2, "freed frame should be reused as the lowest free bit");
    }

    #[test]
    fn contiguous_run_allocation() {
        let pfa = fresh(64);
        let base = pfa.allocate_pages(8);
        for i in 0..8 {
            assert!(!pfa.is_free(base + i * PAGE_SIZE));
        }
    }

    #[test]
    fn retain_release_refcounting() {
        let pfa = fresh(4);
        let p = pfa.allocate_page();
        assert_eq!(pfa.refcount(p), 1);
        pfa.retain(p);
        assert_eq!(pfa.refcount(p), 2);
        assert!(!pfa.release(p));
        assert_eq!(pfa.refcount(p), 1);
        assert!(pfa.release(p));
        assert!(pfa.is_free(p));
    }

    #[test]
    #[should_panic(expected = "OUT_OF_MEMORY")]
    fn exhaustion_panics() {
        let pfa = fresh(2);
        pfa.allocate_page();
        pfa.allocate_page();
        pfa.allocate_page();
    }

    #[test]
    fn try_allocate_pages_returns_none_on_oom_without_partial_success() {
        let pfa = fresh(4);
        assert!(pfa.try_allocate_pages(8).is_none());
        // no frame should have been consumed by the failed attempt
        assert_eq!(pfa.try_allocate_pages(4).map(|_| ()), Some(()));
    }

    #[test]
    #[should_panic(expected = "MEMORY_MANAGEMENT_ERROR")]
    fn double_free_panics() {
        let pfa = fresh(4);
        let p = pfa.allocate_page();
        pfa.free_page(p);
        pfa.free_page(p);
    }
}
