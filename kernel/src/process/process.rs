//! Process control block and the process tree.

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::errno::Errno;
use crate::mm::layout;
use crate::mm::vas::{AddressSpace, AllocKind, Prot, VasFlags};
use crate::process::fd::FdTable;
use crate::process::pid;
use crate::process::thread::Thread;
use crate::signal::{ActionTable, ThreadSignalState};
use crate::sync::{SleepQueue, Spinlock};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ProcessFlags: u32 {
        const KERNEL    = 1 << 0;
        const STARTED   = 1 << 1;
        const RUNNING   = 1 << 2;
        const STOPPED   = 1 << 3;
        const SUSPENDED = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

pub struct Process {
    pub pid: u32,
    parent: Spinlock<Weak<Process>>,
    pub name: Spinlock<String>,
    flags: Spinlock<ProcessFlags>,
    pub credentials: Spinlock<Credentials>,
    pub pgid: AtomicU32,
    pub sid: AtomicU32,
    pub cwd: Spinlock<String>,
    pub vas: Arc<AddressSpace>,
    pub fds: Spinlock<Arc<FdTable>>,
    pub threads: Spinlock<Vec<Arc<Thread>>>,
    pub children: Spinlock<Vec<Arc<Process>>>,
    pub waitpid_queue: SleepQueue,
    /// Process-directed signal state (e.g. `SIGCHLD` to a parent); a
    /// thread's own mask/pending set in [`Thread`] is separate and
    /// governs thread-directed delivery.
    pub signals: ThreadSignalState,
    pub actions: ActionTable,
    /// `brk` heap bounds, both fixed at `layout::HEAP_BASE` until the first
    /// `brk` call grows the heap past it. 48-bit user addresses don't fit
    /// in 32 bits, hence `AtomicUsize` rather than the CPU-register-sized
    /// `AtomicU32` used elsewhere in this struct.
    pub heap_base: AtomicUsize,
    pub heap_top: AtomicUsize,
    pub exit_status: AtomicI32,
    zombie: AtomicU8,
}

impl Process {
    pub fn new(parent: Option<&Arc<Process>>, name: &str, flags: ProcessFlags) -> Arc<Process> {
        let credentials = parent.map(|p| *p.credentials.lock()).unwrap_or_default();
        let (pgid, sid) = parent
            .map(|p| (p.pgid.load(Ordering::Relaxed), p.sid.load(Ordering::Relaxed)))
            .unwrap_or((0, 0));
        let cwd = parent.map(|p| p.cwd.lock().clone()).unwrap_or_default();
        let vas_flags = if flags.contains(ProcessFlags::KERNEL) {
            VasFlags::empty()
        } else {
            VasFlags::USERMODE
        };

        Arc::new(Process {
            pid: pid::allocate(),
            parent: Spinlock::new(parent.map(Arc::downgrade).unwrap_or_default()),
            name: Spinlock::new(String::from(name)),
            flags: Spinlock::new(flags),
            credentials: Spinlock::new(credentials),
            pgid: AtomicU32::new(pgid),
            sid: AtomicU32::new(sid),
            cwd: Spinlock::new(cwd),
            vas: AddressSpace::new(
                crate::mm::layout::USER_BASE,
                crate::mm::layout::USER_END,
                vas_flags,
            ),
            fds: Spinlock::new(parent.map(|p| p.fds.lock().fork_copy()).unwrap_or_else(FdTable::new)),
            threads: Spinlock::new(Vec::new()),
            children: Spinlock::new(Vec::new()),
            waitpid_queue: SleepQueue::new(),
            signals: ThreadSignalState::new(),
            actions: ActionTable::new(),
            heap_base: AtomicUsize::new(layout::HEAP_BASE),
            heap_top: AtomicUsize::new(layout::HEAP_BASE),
            exit_status: AtomicI32::new(0),
            zombie: AtomicU8::new(0),
        })
    }

    pub fn flags(&self) -> ProcessFlags {
        *self.flags.lock()
    }

    pub fn set_flags(&self, flags: ProcessFlags) {
        *self.flags.lock() = flags;
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().upgrade()
    }

    pub fn set_parent(&self, parent: &Arc<Process>) {
        *self.parent.lock() = Arc::downgrade(parent);
    }

    pub fn is_zombie(&self) -> bool {
        self.zombie.load(Ordering::Acquire) != 0
    }

    pub fn mark_zombie(&self, status: i32) {
        self.exit_status.store(status, Ordering::Relaxed);
        self.zombie.store(1, Ordering::Release);
    }

    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        self.threads.lock().first().cloned()
    }

    pub fn add_thread(&self, thread: Arc<Thread>) {
        self.threads.lock().push(thread);
    }

    /// `brk`: sets the heap break to `new_top` and returns the resulting
    /// break, or leaves it unchanged and returns the current one when
    /// `new_top` is zero, per the read-current-break convention.
    pub fn brk(&self, new_top: usize) -> Result<usize, Errno> {
        let base = self.heap_base.load(Ordering::Relaxed);
        let cur_top = self.heap_top.load(Ordering::Relaxed);
        if new_top == 0 {
            return Ok(cur_top);
        }
        if new_top < base {
            return Err(Errno::Inval);
        }

        let new_size = new_top - base;
        if cur_top == base {
            if new_size > 0 {
                self.vas.reserve(base, new_size, AllocKind::Brk, Prot::R | Prot::W)?;
            }
        } else {
            self.vas.resize(base, new_size)?;
        }
        self.heap_top.store(new_top, Ordering::Relaxed);
        Ok(new_top)
    }
}

/// Flat registry of every live process, consulted by the reaper; the
/// tree structure (parent/children) is the authoritative relationship
/// for `waitpid`.
pub struct Registry {
    all: Spinlock<Vec<Arc<Process>>>,
}

impl Registry {
    const fn new() -> Self {
        Registry { all: Spinlock::new(Vec::new()) }
    }

    pub fn insert(&self, proc: Arc<Process>) {
        self.all.lock().push(proc);
    }

    pub fn remove(&self, pid: u32) -> Option<Arc<Process>> {
        let mut all = self.all.lock();
        let pos = all.iter().position(|p| p.pid == pid)?;
        Some(all.remove(pos))
    }

    pub fn find(&self, pid: u32) -> Option<Arc<Process>> {
        self.all.lock().iter().find(|p| p.pid == pid).cloned()
    }

    /// Collects every live process satisfying `pred`, used by `kill`'s
    /// process-group and broadcast pid selectors.
    pub fn all_matching(&self, pred: impl Fn(&Arc<Process>) -> bool) -> Vec<Arc<Process>> {
        self.all.lock().iter().filter(|p| pred(p)).cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.all.lock().len()
    }
}

pub static REGISTRY: Registry = Registry::new();

/// `create`: the PID allocator, credential/cwd/fd inheritance, tree
/// linkage, and registry insertion in one step.
pub fn create(parent: Option<&Arc<Process>>, name: &str, flags: ProcessFlags) -> Arc<Process> {
    let proc = Process::new(parent, name, flags);
    if let Some(parent) = parent {
        parent.children.lock().push(proc.clone());
    }
    REGISTRY.insert(proc.clone());
    proc
}

/// Reparents every child of `proc` onto `init` (pid 1), as required by
/// [`exit`](crate::sched::exit).
pub fn reparent_children_to_init(proc: &Arc<Process>, init: &Arc<Process>) {
    let mut children = proc.children.lock();
    let orphans: Vec<Arc<Process>> = children.drain(..).collect();
    drop(children);
    for child in orphans {
        child.set_parent(init);
        init.children.lock().push(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_parent_credentials_and_cwd() {
        crate::mm::frame::test_init_global();
        let parent = create(None, "parent", ProcessFlags::RUNNING);
        *parent.cwd.lock() = String::from("/srv");
        parent.credentials.lock().uid = 42;

        let child = create(Some(&parent), "child", ProcessFlags::RUNNING);
        assert_eq!(*child.cwd.lock(), "/srv");
        assert_eq!(child.credentials.lock().uid, 42);
        assert_eq!(parent.children.lock().len(), 1);
    }

    #[test]
    fn brk_grows_then_shrinks_heap() {
        crate::mm::frame::test_init_global();
        let proc = create(None, "brk-test", ProcessFlags::RUNNING);
        let base = proc.heap_base.load(Ordering::Relaxed);
        assert_eq!(proc.brk(0).unwrap(), base);

        let grown = proc.brk(base + 0x4000).unwrap();
        assert_eq!(grown, base + 0x4000);
        assert_eq!(proc.vas.find_allocation_at(base).unwrap().1, 0x4000);

        let shrunk = proc.brk(base + 0x1000).unwrap();
        assert_eq!(shrunk, base + 0x1000);
        assert_eq!(proc.vas.find_allocation_at(base).unwrap().1, 0x1000);

        assert_eq!(proc.brk(base - 1).unwrap_err(), Errno::Inval);
    }

    #[test]
    fn reparent_moves_children_to_init() {
        crate::mm::frame::test_init_global();
        let init = create(None, "init", ProcessFlags::RUNNING);
        let parent = create(Some(&init), "parent", ProcessFlags::RUNNING);
        let child = create(Some(&parent), "child", ProcessFlags::RUNNING);

        reparent_children_to_init(&parent, &init);
        assert!(parent.children.lock().is_empty());
        assert_eq!(child.parent().unwrap().pid, init.pid);
        assert_eq!(init.children.lock().len(), 2);
    }
}
