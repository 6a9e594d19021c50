//! Reclaims exited processes not yet claimed by `waitpid`, once no CPU is
//! still executing them.
//!
//! Conceptually a dedicated low-priority kernel thread sleeping on its own
//! queue until woken by `queue_for_reap`; without a real context-switch
//! collaborator to park and resume such a thread, that loop is modeled as
//! `reap_pass()` — a pass the idle loop (or a test) drives directly rather
//! than one a sleeping thread wakes into.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::process::pid;
use crate::process::process::{self, Process};
use crate::sync::Spinlock;

static REAP_LIST: Spinlock<Vec<Arc<Process>>> = Spinlock::new(Vec::new());

/// Queues `proc` for reclamation. Called by `exit` once a process has no
/// parent left to `waitpid` it (its parent already exited, or it is
/// itself `init`'s stray orphan).
pub fn queue_for_reap(proc: Arc<Process>) {
    REAP_LIST.lock().push(proc);
}

/// One reaper pass: drains every queued zombie whose thread list is
/// empty (no CPU owns it) and frees its descriptor and PID. Returns the
/// count reclaimed.
pub fn reap_pass() -> usize {
    let mut list = REAP_LIST.lock();
    let mut reclaimed = 0;
    list.retain(|proc| {
        if proc.threads.lock().is_empty() {
            process::REGISTRY.remove(proc.pid);
            pid::free(proc.pid);
            reclaimed += 1;
            false
        } else {
            true
        }
    });
    reclaimed
}

pub fn pending_count() -> usize {
    REAP_LIST.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::process::ProcessFlags;

    #[test]
    fn reap_pass_clears_threadless_zombies() {
        crate::mm::frame::test_init_global();
        let proc = process::create(None, "z", ProcessFlags::STOPPED);
        queue_for_reap(proc.clone());
        assert_eq!(reap_pass(), 1);
        assert_eq!(pending_count(), 0);
        assert!(process::REGISTRY.find(proc.pid).is_none());
    }
}
