//! FIFO sleep queues.
//!
//! A sleep queue holds the ids of threads waiting for some condition. It
//! knows nothing about the scheduler or about *why* a thread is waiting;
//! [`crate::sched::sleep_enter`] is the glue that actually parks the
//! calling thread and interprets the wake reason.

use alloc::collections::VecDeque;

use crate::process::thread::Tid;
use crate::sync::Spinlock;

/// Why a sleeping thread was resumed. Mirrors the three ways
/// `sleep_enter` can return per the scheduling model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A timed sleep reached its deadline.
    Time,
    /// A signal was delivered to the sleeping thread.
    Signal,
    /// Another thread called `wake` on the queue this thread was parked in.
    Thread,
}

pub struct SleepQueue {
    waiters: Spinlock<VecDeque<Tid>>,
}

impl SleepQueue {
    pub const fn new() -> Self {
        SleepQueue {
            waiters: Spinlock::new(VecDeque::new()),
        }
    }

    /// Attaches `tid` to the tail of the queue. The caller is responsible
    /// for actually descheduling the thread afterwards.
    pub fn insert(&self, tid: Tid) {
        self.waiters.lock().push_back(tid);
    }

    /// Removes `tid` if present (used when a sleeper is woken by a means
    /// other than this queue, e.g. a signal, and must not be woken twice).
    pub fn remove(&self, tid: Tid) -> bool {
        let mut w = self.waiters.lock();
        if let Some(pos) = w.iter().position(|&t| t == tid) {
            w.remove(pos);
            true
        } else {
            false
        }
    }

    /// Pops up to `n` waiters in FIFO order. The caller marks each
    /// returned thread runnable and reinserts it into the scheduler.
    pub fn wake(&self, n: usize) -> alloc::vec::Vec<Tid> {
        let mut w = self.waiters.lock();
        let count = n.min(w.len());
        w.drain(..count).collect()
    }

    /// Non-removing look at the head of the queue, used by callers (e.g.
    /// [`crate::sync::Mutex`]) that need to know whose turn it is without
    /// committing to waking anyone yet.
    pub fn peek_front(&self) -> Option<Tid> {
        self.waiters.lock().front().copied()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SleepQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = SleepQueue::new();
        q.insert(Tid::from_raw(1));
        q.insert(Tid::from_raw(2));
        q.insert(Tid::from_raw(3));
        assert_eq!(q.wake(2), alloc::vec![Tid::from_raw(1), Tid::from_raw(2)]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.wake(10), alloc::vec![Tid::from_raw(3)]);
        assert!(q.is_empty());
    }

    #[test]
    fn remove_before_wake() {
        let q = SleepQueue::new();
        q.insert(Tid::from_raw(1));
        q.insert(Tid::from_raw(2));
        assert!(q.remove(Tid::from_raw(1)));
        assert!(!q.remove(Tid::from_raw(1)));
        assert_eq!(q.wake(10), alloc::vec![Tid::from_raw(2)]);
    }
}
