//! Mutual exclusion and condition waiting.
//!
//! Three primitives, in order of weight: [`Spinlock`] (interrupt-safe,
//! never sleeps), [`Mutex`] (sleep-capable, backed by a [`SleepQueue`]),
//! and the sleep queue itself. The canonical lock-nesting order is
//! scheduler run-queue lock -> sleep-queue lock; the reverse is forbidden.

mod mutex;
mod sleep;
mod spinlock;

pub use mutex::Mutex;
pub use sleep::{SleepQueue, WakeReason};
pub use spinlock::{Spinlock, SpinlockGuard};
