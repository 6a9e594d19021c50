//! Sleep-capable mutual exclusion.
//!
//! Fast path is a CAS of a 32-bit-ish owner word; the slow path inserts
//! the current thread into an associated [`SleepQueue`] and only
//! re-attempts the CAS once it reaches the head — an approximation of
//! true descheduling, since actually parking a thread's execution is the
//! context-switch collaborator's job (out of scope here). Once real
//! scheduling is wired up elsewhere in this crate, a waiter at the head
//! still spins rather than yielding the CPU entirely, which is why this
//! type must never be held across a long critical section on a single
//! logical CPU.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI64, Ordering};

use crate::process::thread::Tid;
use crate::sync::SleepQueue;

const NONE_OWNER: i64 = -1;

pub struct Mutex<T: ?Sized> {
    owner: AtomicI64,
    waiters: SleepQueue,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

cfg_if::cfg_if! {
    if #[cfg(test)] {
        fn current_tid() -> Tid {
            std::thread_local! {
                static TID: core::cell::Cell<Option<Tid>> = core::cell::Cell::new(None);
            }
            TID.with(|c| match c.get() {
                Some(t) => t,
                None => {
                    let t = crate::process::thread::allocate_tid();
                    c.set(Some(t));
                    t
                }
            })
        }

        fn relax() {
            std::thread::yield_now();
        }
    } else {
        fn current_tid() -> Tid {
            crate::sched::current_tid()
        }

        fn relax() {
            core::hint::spin_loop();
        }
    }
}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Mutex {
            owner: AtomicI64::new(NONE_OWNER),
            waiters: SleepQueue::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    fn try_acquire(&self, me: i64) -> bool {
        self.owner
            .compare_exchange(NONE_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        debug_assert!(
            !crate::arch::irq_guard_active(),
            "sleep-capable Mutex taken while holding a Spinlock"
        );
        let me = current_tid();
        let me_raw = me.raw() as i64;

        if self.try_acquire(me_raw) {
            return MutexGuard { mutex: self };
        }

        self.waiters.insert(me);
        loop {
            if self.waiters.peek_front() == Some(me) && self.try_acquire(me_raw) {
                self.waiters.remove(me);
                return MutexGuard { mutex: self };
            }
            relax();
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let me_raw = current_tid().raw() as i64;
        if self.try_acquire(me_raw) {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != NONE_OWNER
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.owner.store(NONE_OWNER, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    #[test]
    fn mutual_exclusion_across_threads() {
        let m = Arc::new(Mutex::new(0usize));
        let mut handles = alloc::vec::Vec::new();
        for _ in 0..8 {
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 4000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = Mutex::new(5);
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }
}
