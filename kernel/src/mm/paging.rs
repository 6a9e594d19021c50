//! Paging layer contracts.
//!
//! The actual 4-level table walk (CR3 load, PML4/PDPT/PD/PT frame layout)
//! is the architecture collaborator's job, same as context-switch
//! assembly is `arch`'s. What lives here is the *logical* page table this
//! kernel reasons about: a page-aligned virtual address maps to at most
//! one [`PageTableEntry`]. [`PageTable`] is the thing a VAS clones and
//! mutates; on real hardware each entry additionally corresponds to a row
//! in the PML4→PT chain the collaborator maintains, but that
//! correspondence is exactly the part this module treats as opaque.

use hashbrown::HashMap;

use crate::mm::frame;
use crate::mm::layout::{page_align_down, PAGE_SIZE};
use crate::sync::Spinlock;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default)]
    pub struct PteFlags: u32 {
        const PRESENT     = 1 << 0;
        const WRITABLE    = 1 << 1;
        const USER        = 1 << 2;
        const NO_EXECUTE  = 1 << 3;
        const NOT_PRESENT = 1 << 4;
        const NOALLOC     = 1 << 5;
        const KERNEL      = 1 << 6;
        const READONLY    = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PageTableEntry {
    pub frame: usize,
    pub flags: PteFlags,
}

impl PageTableEntry {
    pub fn is_present(&self) -> bool {
        self.flags.contains(PteFlags::PRESENT)
    }
}

/// The root of a logical page table. Cheap to create; `clone()` performs
/// the deep per-entry copy the spec calls for, allocating a fresh frame
/// per present mapping.
pub struct PageTable {
    entries: Spinlock<HashMap<usize, PageTableEntry>>,
}

impl PageTable {
    pub fn new() -> Self {
        PageTable { entries: Spinlock::new(HashMap::new()) }
    }

    /// `get_page`: resolves the entry at `vaddr`, creating a default
    /// (not-present) one if `create_missing` is set and none exists yet.
    pub fn get_page(&self, vaddr: usize, create_missing: bool) -> Option<PageTableEntry> {
        let key = page_align_down(vaddr);
        let mut entries = self.entries.lock();
        if let Some(e) = entries.get(&key) {
            return Some(*e);
        }
        if create_missing {
            let e = PageTableEntry { frame: 0, flags: PteFlags::NOT_PRESENT };
            entries.insert(key, e);
            Some(e)
        } else {
            None
        }
    }

    /// `allocate_page`: ensures the entry at `vaddr` points at a fresh
    /// frame (via the PFA) unless `NOALLOC` is set, then writes the
    /// requested protection bits. Returns `None` on PFA exhaustion.
    pub fn allocate_page(&self, vaddr: usize, flags: PteFlags) -> Option<PageTableEntry> {
        let key = page_align_down(vaddr);
        let frame = if flags.contains(PteFlags::NOALLOC) {
            0
        } else {
            frame::ALLOCATOR.try_allocate_page()?
        };
        let entry = PageTableEntry {
            frame,
            flags: (flags | PteFlags::PRESENT) & !PteFlags::NOT_PRESENT,
        };
        self.entries.lock().insert(key, entry);
        Some(entry)
    }

    /// Installs an entry pointing at an already-owned frame (the caller
    /// already holds a reference on it, e.g. a CoW share). Does not touch
    /// the PFA.
    pub fn install(&self, vaddr: usize, frame: usize, flags: PteFlags) {
        let key = page_align_down(vaddr);
        self.entries.lock().insert(
            key,
            PageTableEntry { frame, flags: (flags | PteFlags::PRESENT) & !PteFlags::NOT_PRESENT },
        );
    }

    /// `free_page`: releases the frame via the PFA and clears the entry.
    pub fn free_page(&self, vaddr: usize) {
        let key = page_align_down(vaddr);
        if let Some(e) = self.entries.lock().remove(&key) {
            if e.is_present() && e.frame != 0 {
                frame::ALLOCATOR.release(e.frame);
            }
        }
    }

    /// Clears the entry without releasing the frame (the caller already
    /// accounted for the refcount, e.g. while splitting a CoW mapping).
    pub fn clear(&self, vaddr: usize) {
        self.entries.lock().remove(&page_align_down(vaddr));
    }

    /// `clone`: deep copy of every mapping, duplicating frames for
    /// present entries. CoW sharing is the VAS's job; this always
    /// produces fully independent pages.
    pub fn clone_deep(&self) -> PageTable {
        let src = self.entries.lock();
        let mut dst = HashMap::with_capacity(src.len());
        for (&vaddr, entry) in src.iter() {
            if entry.is_present() && entry.frame != 0 {
                let new_frame = frame::ALLOCATOR.allocate_page();
                remap_phys_copy(entry.frame, new_frame);
                dst.insert(vaddr, PageTableEntry { frame: new_frame, flags: entry.flags });
            } else {
                dst.insert(vaddr, *entry);
            }
        }
        PageTable { entries: Spinlock::new(dst) }
    }

    pub fn present_pages_in(&self, base: usize, size: usize) -> alloc::vec::Vec<usize> {
        let entries = self.entries.lock();
        let end = base + size;
        entries
            .keys()
            .copied()
            .filter(|&v| v >= base && v < end && entries[&v].is_present())
            .collect()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// `remap_phys`/`unmap_phys`: on real hardware these open/close a
/// temporary kernel-space window over a physical range so the kernel can
/// touch frame contents without a permanent mapping. The host/logical
/// representation just copies through identity-mapped memory, which is
/// the abstraction every caller in this crate (CoW copy, slab zeroing)
/// actually relies on.
pub fn remap_phys_copy(src_frame: usize, dst_frame: usize) {
    unsafe {
        let src = src_frame as *const u8;
        let dst = dst_frame as *mut u8;
        core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_get_round_trips() {
        frame::test_init_global();
        let pt = PageTable::new();
        let e = pt.allocate_page(0x1000, PteFlags::WRITABLE).unwrap();
        assert!(e.is_present());
        let got = pt.get_page(0x1000, false).unwrap();
        assert_eq!(got.frame, e.frame);
    }

    #[test]
    fn free_page_clears_entry_and_releases_frame() {
        frame::test_init_global();
        let pt = PageTable::new();
        let e = pt.allocate_page(0x2000, PteFlags::empty()).unwrap();
        assert!(!frame::ALLOCATOR.is_free(e.frame));
        pt.free_page(0x2000);
        assert!(pt.get_page(0x2000, false).is_none());
        assert!(frame::ALLOCATOR.is_free(e.frame));
    }

    #[test]
    fn noalloc_installs_without_touching_pfa() {
        frame::test_init_global();
        let pt = PageTable::new();
        let e = pt.allocate_page(0x3000, PteFlags::NOALLOC).unwrap();
        assert_eq!(e.frame, 0);
    }
}
