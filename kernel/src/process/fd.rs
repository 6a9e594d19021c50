//! Reference-counted file-descriptor table.
//!
//! The table itself is shared (via `Arc`) between threads of the same
//! process and, when `CLONE_FILES`-style sharing is requested at
//! `fork`, between processes; callers needing copy semantics clone the
//! table's contents into a fresh one instead of sharing the `Arc`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::Errno;
use crate::ipc::unix::Endpoint;
use crate::sync::Spinlock;

/// What a descriptor slot actually names. The VFS-backed `File` variant
/// is out of scope here (the filesystem proper is a collaborator); this
/// kernel's fd table only needs to carry socket endpoints plus a generic
/// placeholder for console/file descriptors handed to it by the loader.
#[derive(Debug)]
pub enum FileLike {
    UnixSocket(Arc<Endpoint>),
    /// Opaque handle to something outside this subsystem's concern
    /// (console, regular file via the VFS collaborator), kept only so fd
    /// numbers 0/1/2 and loader-provided descriptors have a slot.
    Opaque,
}

struct Slot {
    file: Arc<FileLike>,
}

pub struct FdTable {
    slots: Spinlock<Vec<Option<Slot>>>,
}

impl FdTable {
    pub fn new() -> Arc<FdTable> {
        Arc::new(FdTable { slots: Spinlock::new(Vec::new()) })
    }

    /// Deep-copies the descriptor table for `fork` semantics where each
    /// fd is duplicated (bumping the underlying file-like's refcount)
    /// rather than shared by reference.
    pub fn fork_copy(&self) -> Arc<FdTable> {
        let slots = self.slots.lock();
        let copied = slots
            .iter()
            .map(|s| s.as_ref().map(|slot| Slot { file: slot.file.clone() }))
            .collect();
        Arc::new(FdTable { slots: Spinlock::new(copied) })
    }

    pub fn install(&self, file: FileLike) -> i32 {
        let mut slots = self.slots.lock();
        let arc = Arc::new(file);
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Slot { file: arc });
                return i as i32;
            }
        }
        slots.push(Some(Slot { file: arc }));
        (slots.len() - 1) as i32
    }

    pub fn get(&self, fd: i32) -> Result<Arc<FileLike>, Errno> {
        if fd < 0 {
            return Err(Errno::BadF);
        }
        let slots = self.slots.lock();
        slots
            .get(fd as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.file.clone())
            .ok_or(Errno::BadF)
    }

    /// `close`: returns `EBADF` on a double close, per the idempotence
    /// property this table must uphold. When this was the last descriptor
    /// (across every table sharing the underlying open file description,
    /// e.g. after `fork`) naming a UNIX socket endpoint, runs the
    /// endpoint's own close protocol so its peer is unblocked rather than
    /// left waiting on a description nobody will ever write to again.
    pub fn close(&self, fd: i32) -> Result<(), Errno> {
        if fd < 0 {
            return Err(Errno::BadF);
        }
        let taken = {
            let mut slots = self.slots.lock();
            match slots.get_mut(fd as usize) {
                Some(slot @ Some(_)) => slot.take(),
                _ => return Err(Errno::BadF),
            }
        };
        if let Some(slot) = taken {
            if Arc::strong_count(&slot.file) == 1 {
                if let FileLike::UnixSocket(endpoint) = &*slot.file {
                    crate::ipc::unix::close(endpoint);
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_reuses_lowest_free_slot() {
        let t = FdTable::new();
        let a = t.install(FileLike::Opaque);
        let b = t.install(FileLike::Opaque);
        t.close(a).unwrap();
        let c = t.install(FileLike::Opaque);
        assert_eq!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn double_close_returns_ebadf() {
        let t = FdTable::new();
        let fd = t.install(FileLike::Opaque);
        t.close(fd).unwrap();
        assert_eq!(t.close(fd).unwrap_err(), Errno::BadF);
    }

    #[test]
    fn get_on_closed_fd_fails() {
        let t = FdTable::new();
        let fd = t.install(FileLike::Opaque);
        t.close(fd).unwrap();
        assert_eq!(t.get(fd).unwrap_err(), Errno::BadF);
    }
}
