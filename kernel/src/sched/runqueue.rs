//! Per-CPU run queue of runnable threads.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::process::thread::{Thread, ThreadState, Tid};
use crate::sync::Spinlock;

pub struct RunQueue {
    ready: Spinlock<VecDeque<Arc<Thread>>>,
    current: Spinlock<Option<Arc<Thread>>>,
    idle_ticks: core::sync::atomic::AtomicU64,
}

impl RunQueue {
    pub const fn new() -> Self {
        RunQueue {
            ready: Spinlock::new(VecDeque::new()),
            current: Spinlock::new(None),
            idle_ticks: core::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn enqueue(&self, thread: Arc<Thread>) {
        thread.set_state(ThreadState::Runnable);
        self.ready.lock().push_back(thread);
    }

    pub fn dequeue(&self) -> Option<Arc<Thread>> {
        self.ready.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.ready.lock().len()
    }

    pub fn remove(&self, tid: Tid) -> bool {
        let mut q = self.ready.lock();
        if let Some(pos) = q.iter().position(|t| t.tid == tid) {
            q.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> Option<Arc<Thread>> {
        self.current.lock().clone()
    }

    pub fn set_current(&self, thread: Option<Arc<Thread>>) {
        *self.current.lock() = thread;
    }

    pub fn note_idle_tick(&self) {
        self.idle_ticks.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    }

    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks.load(core::sync::atomic::Ordering::Relaxed)
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::process::{Process, ProcessFlags};

    fn thread() -> Arc<Thread> {
        crate::mm::frame::test_init_global();
        let proc = Process::new(None, "t", ProcessFlags::RUNNING);
        Thread::new(proc)
    }

    #[test]
    fn fifo_dequeue_order() {
        let rq = RunQueue::new();
        let a = thread();
        let b = thread();
        let a_tid = a.tid;
        rq.enqueue(a);
        rq.enqueue(b);
        assert_eq!(rq.dequeue().unwrap().tid, a_tid);
    }

    #[test]
    fn remove_drops_thread_from_queue() {
        let rq = RunQueue::new();
        let a = thread();
        let tid = a.tid;
        rq.enqueue(a);
        assert!(rq.remove(tid));
        assert!(rq.is_empty());
    }
}
