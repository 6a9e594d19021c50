//! Syscall ABI surface shared by the subsystem operations that implement
//! it.
//!
//! The dispatch table itself — the integer-indexed function table that
//! decodes six register-passed arguments and routes to one of these
//! operations — is an external collaborator. What lives here is the
//! data shared across that boundary: the `sockaddr_un` wire layout, the
//! `mmap`/`waitpid` flag bits, and the exit-status encoding `waitpid`
//! callers decode. `mm::vas`, `process::fd`, `signal`, `sched`, and
//! `ipc::unix` own the actual operations.

use alloc::string::String;

/// `sockaddr_un`: path is NUL-padded/truncated to `PATH_MAX`, canonicalized
/// against the caller's cwd by `ipc::unix::canonicalize` before use.
pub const SOCKADDR_UN_PATH_MAX: usize = 108;

#[derive(Debug, Clone)]
pub struct SockAddrUn {
    pub path: String,
}

impl SockAddrUn {
    /// Decodes a raw NUL-padded path buffer as delivered by user space.
    pub fn from_raw(buf: &[u8]) -> Self {
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let len = len.min(SOCKADDR_UN_PATH_MAX);
        SockAddrUn { path: String::from_utf8_lossy(&buf[..len]).into_owned() }
    }
}

bitflags::bitflags! {
    /// `mmap` flags; `MAP_FIXED` without `MAP_ANONYMOUS` (file-backed
    /// mapping) is rejected upstream since the VFS is out of scope.
    pub struct MmapFlags: u32 {
        const ANONYMOUS = 1 << 0;
        const PRIVATE   = 1 << 1;
        const SHARED    = 1 << 2;
        const FIXED     = 1 << 3;
    }
}

bitflags::bitflags! {
    pub struct WaitOptions: u32 {
        const NOHANG = 1 << 0;
    }
}

/// Exit-status encoding consumed by `waitpid`'s `wstatus`: normal exit is
/// `status << 8`; death by an uncaught signal is `((128 + signum) << 8) |
/// signum`.
pub fn encode_exit(status: i32) -> i32 {
    status << 8
}

pub fn encode_signal_death(signum: u8) -> i32 {
    ((128 + signum as i32) << 8) | signum as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_un_stops_at_nul() {
        let mut buf = [0u8; SOCKADDR_UN_PATH_MAX];
        buf[..9].copy_from_slice(b"/tmp/sock");
        let addr = SockAddrUn::from_raw(&buf);
        assert_eq!(addr.path, "/tmp/sock");
    }

    #[test]
    fn exit_status_encoding_matches_waitpid_abi() {
        assert_eq!(encode_exit(0), 0);
        assert_eq!(encode_exit(1), 256);
        assert_eq!(encode_signal_death(9), (128 + 9) << 8 | 9);
    }
}
