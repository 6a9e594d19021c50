//! Dense bit-per-PID allocator. PID 0 is reserved (never handed out).

use alloc::vec;
use alloc::vec::Vec;

use crate::sync::Spinlock;

const BITS_PER_WORD: usize = 64;

pub struct PidBitmap {
    words: Vec<u64>,
    capacity: usize,
}

impl PidBitmap {
    pub fn new(capacity: usize) -> Self {
        let words = (capacity + BITS_PER_WORD - 1) / BITS_PER_WORD;
        let mut bm = PidBitmap {
            words: vec![0u64; words],
            capacity,
        };
        bm.mark_used(0); // PID 0 reserved
        bm
    }

    fn mark_used(&mut self, pid: usize) {
        self.words[pid / BITS_PER_WORD] |= 1 << (pid % BITS_PER_WORD);
    }

    fn mark_free(&mut self, pid: usize) {
        self.words[pid / BITS_PER_WORD] &= !(1 << (pid % BITS_PER_WORD));
    }

    fn is_used(&self, pid: usize) -> bool {
        self.words[pid / BITS_PER_WORD] & (1 << (pid % BITS_PER_WORD)) != 0
    }

    /// Returns the first clear index. Panics on exhaustion: PID space
    /// exhaustion is a fatal condition in this kernel, not a recoverable
    /// error surfaced to a caller.
    pub fn allocate(&mut self) -> u32 {
        for pid in 1..self.capacity {
            if !self.is_used(pid) {
                self.mark_used(pid);
                return pid as u32;
            }
        }
        panic!("PID space exhausted");
    }

    pub fn free(&mut self, pid: u32) {
        let pid = pid as usize;
        assert!(pid != 0, "attempted to free reserved PID 0");
        assert!(self.is_used(pid), "double free of PID {pid}");
        self.mark_free(pid);
    }
}

lazy_static::lazy_static! {
    static ref PIDS: Spinlock<PidBitmap> = Spinlock::new(PidBitmap::new(32768));
}

pub fn init() {
    // Forces the lazy_static to materialize at a known point during boot
    // rather than on first use from an arbitrary interrupt context.
    let _ = PIDS.lock();
}

pub fn allocate() -> u32 {
    PIDS.lock().allocate()
}

pub fn free(pid: u32) {
    PIDS.lock().free(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_zero_reserved() {
        let mut bm = PidBitmap::new(16);
        for _ in 1..16 {
            let p = bm.allocate();
            assert_ne!(p, 0);
        }
    }

    #[test]
    fn allocate_free_round_trip() {
        let mut bm = PidBitmap::new(16);
        let a = bm.allocate();
        let b = bm.allocate();
        assert_ne!(a, b);
        bm.free(a);
        let c = bm.allocate();
        assert_eq!(a, c, "freed pid should be reused as the first clear bit");
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut bm = PidBitmap::new(16);
        let a = bm.allocate();
        bm.free(a);
        bm.free(a);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn exhaustion_panics() {
        let mut bm = PidBitmap::new(2); // only pid 1 available (0 reserved)
        bm.allocate();
        bm.allocate();
    }
}
