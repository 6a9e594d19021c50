//! Thread control block.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use alloc::sync::Arc;

use crate::arch::Context;
use crate::mm::vas::AddressSpace;
use crate::signal::ThreadSignalState;
use crate::sync::Spinlock;

/// Globally unique thread id, monotonically assigned. Distinct from the
/// POSIX pid space: a process's first thread shares its numeric value
/// with the pid by convention but the two counters are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u32);

impl Tid {
    pub const fn from_raw(raw: u32) -> Self {
        Tid(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

/// Allocates the next Tid. Unlike pids, tids are never recycled: the
/// scheduler's run queues and sleep queues may outlive the thread they
/// name by one epoch, and reuse would risk a stale wake targeting a
/// newly-spawned, unrelated thread.
pub fn allocate_tid() -> Tid {
    Tid(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Running = 0,
    Runnable = 1,
    Sleeping = 2,
    Stopping = 3,
    Stopped = 4,
    Zombie = 5,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ThreadState::Running,
            1 => ThreadState::Runnable,
            2 => ThreadState::Sleeping,
            3 => ThreadState::Stopping,
            4 => ThreadState::Stopped,
            _ => ThreadState::Zombie,
        }
    }
}

/// Opaque saved FPU/SSE register area. The layout (`FXSAVE`/`XSAVE`
/// image) is an arch detail; this struct exists so the thread struct has
/// a fixed place to store it, 16-byte aligned as `fxsave`/`xrstor`
/// require.
#[repr(align(16))]
pub struct FpuState {
    pub image: [u8; 512],
}

impl Default for FpuState {
    fn default() -> Self {
        FpuState { image: [0u8; 512] }
    }
}

pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

pub struct Thread {
    pub tid: Tid,
    pub process: Arc<super::process::Process>,
    /// Saved callee-saved registers and stack pointer, valid whenever the
    /// thread is not the one currently executing.
    pub context: Spinlock<Context>,
    /// Pointer to the interrupt frame captured on the most recent trap
    /// into the kernel from user mode; null while running in the kernel
    /// with no pending trap frame (e.g. freshly spawned, not yet run).
    pub user_regs: Spinlock<usize>,
    pub kernel_stack: Spinlock<alloc::vec::Vec<u8>>,
    state: AtomicU8,
    pub signals: ThreadSignalState,
    pub fpu: Spinlock<FpuState>,
}

impl Thread {
    pub fn new(process: Arc<super::process::Process>) -> Arc<Thread> {
        let tid = allocate_tid();
        log::info!("spawn: tid={} pid={}", tid.raw(), process.pid);
        Arc::new(Thread {
            tid,
            process,
            context: Spinlock::new(Context::default()),
            user_regs: Spinlock::new(0),
            kernel_stack: Spinlock::new(alloc::vec![0u8; KERNEL_STACK_SIZE]),
            state: AtomicU8::new(ThreadState::Runnable as u8),
            signals: ThreadSignalState::new(),
            fpu: Spinlock::new(FpuState::default()),
        })
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn address_space(&self) -> Arc<AddressSpace> {
        self.process.vas.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tids_are_monotonic_and_distinct() {
        let a = allocate_tid();
        let b = allocate_tid();
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn thread_state_round_trips() {
        assert_eq!(ThreadState::from_u8(ThreadState::Sleeping as u8), ThreadState::Sleeping);
        assert_eq!(ThreadState::from_u8(ThreadState::Zombie as u8), ThreadState::Zombie);
    }
}
