//! Negative-errno return values shared by every syscall-facing subsystem.
//!
//! Kernel-internal APIs return `Result<T, Errno>`; the syscall dispatcher
//! collapses that into the signed-integer ABI described in the syscall
//! shape (negative errno, non-negative success).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    Perm = 1,
    NoEnt = 2,
    Srch = 3,
    Intr = 4,
    Io = 5,
    BadF = 9,
    Child = 10,
    Again = 11,
    NoMem = 12,
    Fault = 14,
    Inval = 22,
    Nfile = 23,
    Mfile = 24,
    AddrInUse = 98,
    AddrNotAvail = 99,
    ConnRefused = 111,
    TimedOut = 110,
    ConnReset = 104,
    OpNotSupp = 95,
    ProtoType = 91,
    WouldBlock = 11, // EAGAIN == EWOULDBLOCK on this ABI
}

pub type KResult<T> = Result<T, Errno>;

impl Errno {
    /// Syscall ABI encoding: negative errno.
    pub const fn to_raw(self) -> i64 {
        -(self as i64)
    }
}

/// Collapses a kernel result into the raw syscall return-value ABI.
pub fn encode(result: KResult<i64>) -> i64 {
    match result {
        Ok(v) => v,
        Err(e) => e.to_raw(),
    }
}
