//! Per-process virtual address space: an ordered interval map of
//! reservations with lazy mapping and copy-on-write.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::errno::Errno;
use crate::mm::frame;
use crate::mm::layout::{page_align_down, page_align_up, PAGE_SIZE};
use crate::mm::paging::{PageTable, PteFlags};
use crate::sync::Spinlock;
use crate::syscall::MmapFlags;

bitflags::bitflags! {
    #[derive(Default)]
    pub struct VasFlags: u32 {
        const USERMODE = 1 << 0;
        const NO_COW   = 1 << 1;
        const REAL_ONLY = 1 << 2;
        const GLOBAL   = 1 << 3;
    }
}

bitflags::bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct Prot: u32 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Normal,
    Mmap,
    MmapShared,
    Stack,
    Brk,
    Executable,
}

const REFCOUNT_MAX: u8 = u8::MAX;

/// A reference-counted description of one reserved interval. Distinct
/// from the list node that threads it into the VAS: under CoW, two VASes
/// (parent and child) hold list nodes pointing at the *same* descriptor.
#[derive(Debug)]
pub struct AllocationDescriptor {
    pub base: usize,
    pub size: usize,
    pub prot: Prot,
    pub kind: AllocKind,
    refcount: Spinlock<u8>,
    pub pending_cow: Spinlock<bool>,
}

impl AllocationDescriptor {
    fn new(base: usize, size: usize, prot: Prot, kind: AllocKind) -> Arc<Self> {
        Arc::new(AllocationDescriptor {
            base,
            size,
            prot,
            kind,
            refcount: Spinlock::new(1),
            pending_cow: Spinlock::new(false),
        })
    }

    pub fn refcount(&self) -> u8 {
        *self.refcount.lock()
    }

    fn bump(&self) -> bool {
        let mut r = self.refcount.lock();
        if *r >= REFCOUNT_MAX {
            false
        } else {
            *r += 1;
            true
        }
    }

    fn drop_ref(&self) -> u8 {
        let mut r = self.refcount.lock();
        *r = r.saturating_sub(1);
        *r
    }
}

struct Node {
    alloc: Arc<AllocationDescriptor>,
}

/// Fault resolution outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResult {
    Resolved,
    NotResolved,
}

pub struct AddressSpace {
    pub flags: VasFlags,
    pub window_base: usize,
    pub window_end: usize,
    pub page_table: Arc<PageTable>,
    nodes: Spinlock<VecDeque<Node>>,
}

impl AddressSpace {
    pub fn new(window_base: usize, window_end: usize, flags: VasFlags) -> Arc<AddressSpace> {
        Arc::new(AddressSpace {
            flags,
            window_base,
            window_end,
            page_table: Arc::new(PageTable::new()),
            nodes: Spinlock::new(VecDeque::new()),
        })
    }

    fn in_window(&self, base: usize, size: usize) -> bool {
        base >= self.window_base && base.checked_add(size).map_or(false, |end| end <= self.window_end)
    }

    /// `reserve`: place a new interval at a caller-chosen address.
    pub fn reserve(&self, addr: usize, size: usize, kind: AllocKind, prot: Prot) -> Result<Arc<AllocationDescriptor>, Errno> {
        let base = page_align_down(addr);
        let size = page_align_up(size + (addr - base));
        if !self.in_window(base, size) {
            log::warn!("VAS mapping refused: {base:#x}..{:#x} outside window {:#x}..{:#x}", base + size, self.window_base, self.window_end);
            return Err(Errno::Inval);
        }

        let mut nodes = self.nodes.lock();
        let insert_at = match self.find_hole_for(&nodes, base, size) {
            Ok(idx) => idx,
            Err(e) => {
                log::warn!("VAS mapping refused: {base:#x}..{:#x} overlaps an existing allocation", base + size);
                return Err(e);
            }
        };
        let descriptor = AllocationDescriptor::new(base, size, prot, kind);
        nodes.insert(insert_at, Node { alloc: descriptor.clone() });
        Ok(descriptor)
    }

    fn find_hole_for(&self, nodes: &VecDeque<Node>, base: usize, size: usize) -> Result<usize, Errno> {
        let end = base + size;
        if nodes.is_empty() {
            return Ok(0);
        }
        if end <= nodes[0].alloc.base {
            return Ok(0);
        }
        for i in 0..nodes.len() {
            let cur = &nodes[i].alloc;
            let cur_end = cur.base + cur.size;
            if base < cur_end && end > cur.base {
                return Err(Errno::Inval); // overlap refused
            }
            let next_base = nodes.get(i + 1).map(|n| n.alloc.base).unwrap_or(self.window_end);
            if base >= cur_end && end <= next_base {
                return Ok(i + 1);
            }
        }
        Err(Errno::Inval)
    }

    /// `allocate`: like `reserve` but the caller does not pick the
    /// address; the first hole of sufficient size is used.
    pub fn allocate(&self, size: usize, kind: AllocKind, prot: Prot) -> Result<Arc<AllocationDescriptor>, Errno> {
        let size = page_align_up(size);
        let mut nodes = self.nodes.lock();

        let mut candidate = self.window_base;
        if nodes.is_empty() {
            candidate = self.window_base;
        } else if nodes[0].alloc.base - self.window_base >= size {
            candidate = self.window_base;
        } else {
            let mut found = None;
            for i in 0..nodes.len() {
                let cur_end = nodes[i].alloc.base + nodes[i].alloc.size;
                let next_base = nodes.get(i + 1).map(|n| n.alloc.base).unwrap_or(self.window_end);
                if next_base.saturating_sub(cur_end) >= size {
                    found = Some((i + 1, cur_end));
                    break;
                }
            }
            match found {
                Some((_, at)) => candidate = at,
                None => {
                    let tail = nodes.back().map(|n| n.alloc.base + n.alloc.size).unwrap_or(self.window_base);
                    if tail + size > self.window_end {
                        return Err(Errno::NoMem);
                    }
                    candidate = tail;
                }
            }
        }

        let insert_at = self.find_hole_for(&nodes, candidate, size)?;
        let descriptor = AllocationDescriptor::new(candidate, size, prot, kind);
        nodes.insert(insert_at, Node { alloc: descriptor.clone() });
        Ok(descriptor)
    }

    /// `free`: unlink the node and drop a reference; at zero, release all
    /// mapped frames in the range.
    pub fn free(&self, base: usize) -> Result<(), Errno> {
        let base = page_align_down(base);
        let mut nodes = self.nodes.lock();
        let pos = nodes.iter().position(|n| n.alloc.base == base).ok_or(Errno::Inval)?;
        let node = nodes.remove(pos).unwrap();
        drop(nodes);

        if node.alloc.drop_ref() == 0 {
            for page in self.page_table.present_pages_in(node.alloc.base, node.alloc.size) {
                self.page_table.free_page(page);
            }
        }
        Ok(())
    }

    /// `resize`: grow or shrink an existing allocation in place (its base
    /// stays fixed). Used by `brk`: a shrink releases any frames mapped in
    /// the vacated tail; a grow fails rather than overlap the next node.
    /// Shrinking to zero removes the allocation entirely.
    pub fn resize(&self, base: usize, new_size: usize) -> Result<(), Errno> {
        let new_size = page_align_up(new_size);
        let mut nodes = self.nodes.lock();
        let pos = nodes.iter().position(|n| n.alloc.base == base).ok_or(Errno::Inval)?;
        let old = nodes[pos].alloc.clone();
        if new_size == old.size {
            return Ok(());
        }

        if new_size == 0 {
            let node = nodes.remove(pos).unwrap();
            drop(nodes);
            for page in self.page_table.present_pages_in(node.alloc.base, node.alloc.size) {
                self.page_table.free_page(page);
            }
            return Ok(());
        }

        let end = base.checked_add(new_size).ok_or(Errno::Inval)?;
        if end > self.window_end {
            return Err(Errno::NoMem);
        }

        if new_size > old.size {
            let next_base = nodes.get(pos + 1).map(|n| n.alloc.base).unwrap_or(self.window_end);
            if end > next_base {
                return Err(Errno::NoMem);
            }
        } else {
            for page in self.page_table.present_pages_in(base + new_size, old.size - new_size) {
                self.page_table.free_page(page);
            }
        }

        let fresh = AllocationDescriptor::new(base, new_size, old.prot, old.kind);
        nodes[pos] = Node { alloc: fresh };
        Ok(())
    }

    /// `mmap`: anonymous-only (file-backed mappings need the VFS
    /// collaborator, out of scope here). `MAP_FIXED` demands the exact
    /// address via `reserve`; otherwise the first sufficiently large hole
    /// is used via `allocate`.
    pub fn mmap(&self, addr: Option<usize>, size: usize, prot: Prot, flags: MmapFlags) -> Result<usize, Errno> {
        if !flags.contains(MmapFlags::ANONYMOUS) {
            return Err(Errno::Inval);
        }
        let kind = if flags.contains(MmapFlags::SHARED) { AllocKind::MmapShared } else { AllocKind::Mmap };
        let desc = match addr {
            Some(a) if flags.contains(MmapFlags::FIXED) => self.reserve(a, size, kind, prot)?,
            Some(a) => self.reserve(a, size, kind, prot).or_else(|_| self.allocate(size, kind, prot))?,
            None => self.allocate(size, kind, prot)?,
        };
        Ok(desc.base)
    }

    /// `munmap`: unmaps the allocation starting exactly at `addr`. Partial
    /// unmap of a larger mapping is not supported; callers must pass the
    /// address `mmap` returned.
    pub fn munmap(&self, addr: usize, _size: usize) -> Result<(), Errno> {
        self.free(addr)
    }

    fn find_covering(&self, nodes: &VecDeque<Node>, addr: usize) -> Option<usize> {
        nodes.iter().position(|n| addr >= n.alloc.base && addr < n.alloc.base + n.alloc.size)
    }

    /// `vas_fault`: resolve a page fault at `addr`.
    pub fn fault(&self, addr: usize, size_hint: usize) -> FaultResult {
        if self.flags.intersects(VasFlags::NO_COW | VasFlags::REAL_ONLY) {
            return FaultResult::NotResolved;
        }
        let nodes = self.nodes.lock();
        let Some(idx) = self.find_covering(&nodes, addr) else {
            return FaultResult::NotResolved;
        };
        let alloc = nodes[idx].alloc.clone();
        drop(nodes);

        let pending = *alloc.pending_cow.lock();
        if pending {
            // Allocation-descriptor-level sharing (bumped once per
            // `clone_into`) is distinct from frame-level sharing (bumped
            // once per present page at clone time). The first VAS to
            // fault detaches its own private descriptor; which pages are
            // still physically shared is then decided per page, below,
            // by each frame's own refcount — so an unrelated page in the
            // same allocation that neither side has touched yet stays
            // shared until it is itself faulted.
            if alloc.refcount() > 1 {
                alloc.drop_ref();
                let fresh = AllocationDescriptor::new(alloc.base, alloc.size, alloc.prot, alloc.kind);
                *fresh.pending_cow.lock() = true;
                self.replace_node(alloc.base, fresh.clone());
                self.resolve_cow_window(&fresh, addr, size_hint);
            } else {
                self.resolve_cow_window(&alloc, addr, size_hint);
            }
        } else {
            self.resolve_lazy(&alloc, addr, size_hint);
        }
        FaultResult::Resolved
    }

    /// Resolves the present pages within `[addr, addr+window)` (the usual
    /// size-hint-bounded window) by consulting each page's *physical
    /// frame* refcount: still-shared frames are copied, already-exclusive
    /// frames are simply upgraded to full protection in place.
    fn resolve_cow_window(&self, alloc: &AllocationDescriptor, addr: usize, size_hint: usize) {
        let span = size_hint.min(alloc.size).min(alloc.base + alloc.size - addr);
        let start = page_align_down(addr);
        let end = (start + span.max(PAGE_SIZE)).min(alloc.base + alloc.size);

        let mut flags = PteFlags::PRESENT;
        if alloc.prot.contains(Prot::W) {
            flags |= PteFlags::WRITABLE;
        }
        if !alloc.prot.contains(Prot::X) {
            flags |= PteFlags::NO_EXECUTE;
        }

        let mut vaddr = start;
        while vaddr < end {
            if let Some(e) = self.page_table.get_page(vaddr, false) {
                if e.is_present() {
                    if frame::ALLOCATOR.refcount(e.frame) > 1 {
                        let new_frame = frame::ALLOCATOR.allocate_page();
                        crate::mm::paging::remap_phys_copy(e.frame, new_frame);
                        frame::ALLOCATOR.release(e.frame);
                        self.page_table.install(vaddr, new_frame, flags);
                    } else {
                        self.page_table.install(vaddr, e.frame, flags);
                    }
                }
            }
            vaddr += PAGE_SIZE;
        }
    }

    fn resolve_lazy(&self, alloc: &AllocationDescriptor, addr: usize, size_hint: usize) {
        let span = size_hint.min(alloc.size).min(alloc.base + alloc.size - addr);
        let start = page_align_down(addr);
        let pages = page_align_up(span) / PAGE_SIZE;
        let mut flags = PteFlags::READONLY | PteFlags::NO_EXECUTE;
        if self.flags.contains(VasFlags::USERMODE) {
            flags |= PteFlags::USER;
        } else {
            flags |= PteFlags::KERNEL;
        }
        for i in 0..pages.max(1) {
            let vaddr = start + i * PAGE_SIZE;
            if self.page_table.get_page(vaddr, false).map(|e| e.is_present()).unwrap_or(false) {
                continue;
            }
            self.page_table.allocate_page(vaddr, flags);
        }
    }

    fn replace_node(&self, base: usize, new_alloc: Arc<AllocationDescriptor>) {
        let mut nodes = self.nodes.lock();
        if let Some(pos) = nodes.iter().position(|n| n.alloc.base == base) {
            nodes[pos] = Node { alloc: new_alloc };
        }
    }

    /// `clone`: duplicate every allocation node into a child VAS,
    /// establishing CoW sharing where permitted.
    pub fn clone_into(&self, child: &AddressSpace) {
        let nodes = self.nodes.lock();
        let mut child_nodes = child.nodes.lock();
        for node in nodes.iter() {
            let cow_allowed = !self.flags.intersects(VasFlags::NO_COW | VasFlags::REAL_ONLY)
                && node.alloc.refcount() < REFCOUNT_MAX;
            if cow_allowed {
                node.alloc.bump();
                *node.alloc.pending_cow.lock() = true;
                for page in self.page_table.present_pages_in(node.alloc.base, node.alloc.size) {
                    if let Some(e) = self.page_table.get_page(page, false) {
                        let ro = (e.flags | PteFlags::READONLY) & !PteFlags::WRITABLE;
                        self.page_table.install(page, e.frame, ro);
                        frame::ALLOCATOR.retain(e.frame);
                        child.page_table.install(page, e.frame, ro);
                    }
                }
                child_nodes.push_back(Node { alloc: node.alloc.clone() });
            } else {
                let fresh = AllocationDescriptor::new(node.alloc.base, node.alloc.size, node.alloc.prot, node.alloc.kind);
                for page in self.page_table.present_pages_in(node.alloc.base, node.alloc.size) {
                    if let Some(e) = self.page_table.get_page(page, false) {
                        let new_frame = frame::ALLOCATOR.allocate_page();
                        crate::mm::paging::remap_phys_copy(e.frame, new_frame);
                        child.page_table.install(page, new_frame, e.flags);
                    }
                }
                child_nodes.push_back(Node { alloc: fresh });
            }
        }
    }

    /// `destroy`: free every allocation, dropping the page table with it
    /// (the `Arc<PageTable>` is reclaimed once the last VAS referencing
    /// it drops).
    pub fn destroy(&self) {
        let bases: alloc::vec::Vec<usize> = self.nodes.lock().iter().map(|n| n.alloc.base).collect();
        for base in bases {
            let _ = self.free(base);
        }
    }

    /// Debug helper: validates ascending, non-overlapping ordering. Logs
    /// the offending pair before reporting failure, since a caller only
    /// learns `false` and this is usually consulted after something has
    /// already gone wrong (e.g. a page fault in a VAS suspected corrupt).
    pub fn dump_check(&self) -> bool {
        let nodes = self.nodes.lock();
        let mut prev_end = None;
        for node in nodes.iter() {
            if let Some(pe) = prev_end {
                if node.alloc.base < pe {
                    log::error!(
                        "VAS corruption: allocation at {:#x} starts before the prior one ends at {pe:#x}",
                        node.alloc.base,
                    );
                    return false;
                }
            }
            prev_end = Some(node.alloc.base + node.alloc.size);
        }
        true
    }

    pub fn allocation_count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn find_allocation_at(&self, addr: usize) -> Option<(usize, usize, u8, bool)> {
        let nodes = self.nodes.lock();
        let idx = self.find_covering(&nodes, addr)?;
        let a = &nodes[idx].alloc;
        let result = (a.base, a.size, a.refcount(), *a.pending_cow.lock());
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vas() -> Arc<AddressSpace> {
        frame::test_init_global();
        AddressSpace::new(0x1000, 0x1000_0000, VasFlags::USERMODE)
    }

    #[test]
    fn reserve_rejects_overlap() {
        let v = vas();
        v.reserve(0x2000, 0x2000, AllocKind::Normal, Prot::R | Prot::W).unwrap();
        let err = v.reserve(0x3000, 0x1000, AllocKind::Normal, Prot::R).unwrap_err();
        assert_eq!(err, Errno::Inval);
    }

    #[test]
    fn list_stays_ascending_and_non_overlapping() {
        let v = vas();
        v.reserve(0x5000, 0x1000, AllocKind::Normal, Prot::R).unwrap();
        v.reserve(0x2000, 0x1000, AllocKind::Normal, Prot::R).unwrap();
        v.reserve(0x8000, 0x1000, AllocKind::Normal, Prot::R).unwrap();
        assert!(v.dump_check());
    }

    #[test]
    fn allocate_finds_interior_hole() {
        let v = vas();
        v.reserve(0x2000, 0x1000, AllocKind::Normal, Prot::R).unwrap();
        v.reserve(0x8000, 0x1000, AllocKind::Normal, Prot::R).unwrap();
        let a = v.allocate(0x1000, AllocKind::Normal, Prot::R).unwrap();
        assert!(a.base == v.window_base || (a.base >= 0x3000 && a.base < 0x8000));
    }

    #[test]
    fn lazy_fault_maps_a_page() {
        let v = vas();
        v.reserve(0x2000, 0x2000, AllocKind::Normal, Prot::R | Prot::W).unwrap();
        assert_eq!(v.fault(0x2000, 0x1000), FaultResult::Resolved);
        assert!(v.page_table.get_page(0x2000, false).unwrap().is_present());
    }

    #[test]
    fn fault_outside_any_allocation_not_resolved() {
        let v = vas();
        assert_eq!(v.fault(0x900_0000, 0x1000), FaultResult::NotResolved);
    }

    #[test]
    fn mmap_anonymous_picks_a_hole_and_munmap_frees_it() {
        let v = vas();
        let addr = v
            .mmap(None, 0x1000, Prot::R | Prot::W, MmapFlags::ANONYMOUS | MmapFlags::PRIVATE)
            .unwrap();
        assert!(v.find_allocation_at(addr).is_some());
        v.munmap(addr, 0x1000).unwrap();
        assert!(v.find_allocation_at(addr).is_none());
    }

    #[test]
    fn mmap_rejects_file_backed_requests() {
        let v = vas();
        let err = v.mmap(None, 0x1000, Prot::R, MmapFlags::PRIVATE).unwrap_err();
        assert_eq!(err, Errno::Inval);
    }

    #[test]
    fn resize_grows_and_shrinks_in_place() {
        let v = vas();
        let desc = v.reserve(0x2000, 0x1000, AllocKind::Brk, Prot::R | Prot::W).unwrap();
        v.resize(desc.base, 0x3000).unwrap();
        assert_eq!(v.find_allocation_at(0x2000).unwrap().1, 0x3000);

        v.resize(desc.base, 0x1000).unwrap();
        assert_eq!(v.find_allocation_at(0x2000).unwrap().1, 0x1000);
    }

    #[test]
    fn no_cow_vas_never_resolves_faults() {
        let v = AddressSpace::new(0x1000, 0x1000_0000, VasFlags::USERMODE | VasFlags::NO_COW);
        v.reserve(0x2000, 0x1000, AllocKind::Normal, Prot::R).unwrap();
        assert_eq!(v.fault(0x2000, 0x1000), FaultResult::NotResolved);
    }

    #[test]
    fn cow_fork_then_write_splits_allocation() {
        let parent = vas();
        let desc = parent.reserve(0x2000, 0x2000, AllocKind::Normal, Prot::R | Prot::W).unwrap();
        parent.fault(0x2000, 0x1000);
        parent.fault(0x3000, 0x1000);

        let child = AddressSpace::new(0x1000, 0x1000_0000, VasFlags::USERMODE);
        AddressSpace::clone_into(&parent, &child);
        assert_eq!(desc.refcount(), 2);

        // child writes to the first page: triggers the shared-refcount branch
        assert_eq!(child.fault(0x2000, 0x1000), FaultResult::Resolved);
        assert_eq!(desc.refcount(), 1, "parent's shared allocation drops to sole ownership");

        let (_, _, child_refcount, _) = child.find_allocation_at(0x2000).unwrap();
        assert_eq!(child_refcount, 1, "child detached into its own private descriptor");

        // parent and child's descriptors are now both private (refcount 1
        // each); the second page's physical frame is still the one
        // shared pair from the fork, untouched by the first page's split.
        let (_, _, parent_refcount, parent_pending) = parent.find_allocation_at(0x3000).unwrap();
        assert_eq!(parent_refcount, 1);
        assert!(parent_pending);

        let parent_frame = parent.page_table.get_page(0x3000, false).unwrap().frame;
        let child_frame = child.page_table.get_page(0x3000, false).unwrap().frame;
        assert_eq!(parent_frame, child_frame, "second page remains shared");
        assert_eq!(frame::ALLOCATOR.refcount(parent_frame), 2);
    }
}
