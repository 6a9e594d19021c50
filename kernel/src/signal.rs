//! Per-thread pending/blocked signal sets and delivery on return-to-user.
//!
//! Signal numbers run `1..=NSIG`. `SIGKILL` and `SIGSTOP` can never be
//! blocked, ignored, or have a user handler installed.

use crate::arch::Context;
use crate::errno::Errno;
use crate::sync::Spinlock;

pub const NSIG: usize = 64;
pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGABRT: u32 = 6;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGSEGV: u32 = 11;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SigFlags: u32 {
        const SA_RESETHAND = 1 << 0;
        const SA_RESTART   = 1 << 1;
        const SA_NODEFER   = 1 << 2;
    }
}

/// A 64-bit bitset over signal numbers 1..=NSIG.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigSet(u64);

impl SigSet {
    pub const EMPTY: SigSet = SigSet(0);

    pub fn contains(self, sig: u32) -> bool {
        sig >= 1 && sig as usize <= NSIG && (self.0 & bit(sig)) != 0
    }

    pub fn insert(&mut self, sig: u32) {
        if sig >= 1 && sig as usize <= NSIG {
            self.0 |= bit(sig);
        }
    }

    pub fn remove(&mut self, sig: u32) {
        if sig >= 1 && sig as usize <= NSIG {
            self.0 &= !bit(sig);
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The lowest-numbered pending-and-unblocked signal, if any.
    pub fn first_unblocked(self, blocked: SigSet) -> Option<u32> {
        let deliverable = self.0 & !blocked.0;
        if deliverable == 0 {
            None
        } else {
            Some(deliverable.trailing_zeros() + 1)
        }
    }

    pub fn from_raw(bits: u64) -> Self {
        SigSet(bits)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

fn bit(sig: u32) -> u64 {
    1u64 << (sig - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Default,
    Ignore,
    User(usize),
}

impl Default for Handler {
    fn default() -> Self {
        Handler::Default
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SigAction {
    pub handler: Handler,
    pub mask: SigSet,
    pub flags: SigFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultDisposition {
    Terminate,
    TerminateWithCore,
    Ignore,
    Stop,
    Continue,
}

/// Fixed table of default dispositions, per POSIX.
pub fn default_disposition(sig: u32) -> DefaultDisposition {
    match sig {
        SIGCHLD | SIGURG_PLACEHOLDER => DefaultDisposition::Ignore,
        SIGCONT => DefaultDisposition::Continue,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultDisposition::Stop,
        SIGQUIT | SIGABRT | SIGFPE | SIGILL | SIGSEGV => DefaultDisposition::TerminateWithCore,
        _ => DefaultDisposition::Terminate,
    }
}

// Not a real POSIX signal; keeps the match above from needing a separate
// guard clause while leaving room for SIGURG if it's ever added.
const SIGURG_PLACEHOLDER: u32 = 0;

pub fn is_uncatchable(sig: u32) -> bool {
    sig == SIGKILL || sig == SIGSTOP
}

/// Per-thread signal state. `pending`/`blocked` are guarded by `siglock`
/// rather than the kernel-wide process lock, per the shared-resource
/// policy.
#[derive(Default)]
pub struct ThreadSignalState {
    pub pending: Spinlock<SigSet>,
    pub blocked: Spinlock<SigSet>,
}

impl ThreadSignalState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Per-(process, signal) disposition table.
pub struct ActionTable {
    actions: Spinlock<[SigAction; NSIG + 1]>,
}

impl ActionTable {
    pub fn new() -> Self {
        ActionTable {
            actions: Spinlock::new([SigAction::default(); NSIG + 1]),
        }
    }

    pub fn get(&self, sig: u32) -> SigAction {
        self.actions.lock()[sig as usize]
    }

    pub fn set(&self, sig: u32, action: SigAction) -> Result<(), Errno> {
        if is_uncatchable(sig) && !matches!(action.handler, Handler::Default) {
            return Err(Errno::Inval);
        }
        if sig as usize >= self.actions.lock().len() || sig == 0 {
            return Err(Errno::Inval);
        }
        self.actions.lock()[sig as usize] = action;
        Ok(())
    }

    pub fn reset_to_default(&self, sig: u32) {
        if (sig as usize) < self.actions.lock().len() {
            self.actions.lock()[sig as usize] = SigAction::default();
        }
    }
}

impl Default for ActionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of [`send`], used by the caller to decide whether to wake the
/// target thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Dropped,
}

/// `signal_send`: validates, consults the action table, and marks the
/// signal pending on the target thread. Returns whether the target should
/// now be woken (it is the caller's job to actually do so, since waking
/// requires scheduler state this module does not own).
pub fn send(actions: &ActionTable, target: &ThreadSignalState, sig: u32) -> Result<SendOutcome, Errno> {
    if sig == 0 || sig as usize > NSIG {
        return Err(Errno::Inval);
    }
    let action = actions.get(sig);
    if matches!(action.handler, Handler::Ignore) && !is_uncatchable(sig) {
        return Ok(SendOutcome::Dropped);
    }
    if !is_uncatchable(sig) && target.blocked.lock().contains(sig) {
        return Ok(SendOutcome::Dropped);
    }
    target.pending.lock().insert(sig);
    Ok(SendOutcome::Delivered)
}

/// What `signal_handle` decided to do with one pending signal. The
/// scheduler/process layer interprets this to actually terminate, stop,
/// or resume threads, since this module has no access to the process
/// tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Stop,
    WakeProcess,
    Terminate { code: i32 },
    EnterUserHandler { handler_addr: usize, sig: u32 },
}

/// `signal_handle`: consults the next pending-and-unblocked signal and
/// decides what should happen. Clears the pending bit as appropriate.
/// Does not itself touch `regs`/the trampoline; that is arch-specific and
/// performed by the caller once it receives `EnterUserHandler`.
pub fn handle_next(
    actions: &ActionTable,
    state: &ThreadSignalState,
    _regs: &Context,
) -> Option<Disposition> {
    let pending = *state.pending.lock();
    let blocked = *state.blocked.lock();
    let sig = pending.first_unblocked(blocked)?;

    let action = actions.get(sig);
    match action.handler {
        Handler::Ignore => {
            state.pending.lock().remove(sig);
            Some(Disposition::Continue)
        }
        Handler::Default => {
            state.pending.lock().remove(sig);
            match default_disposition(sig) {
                DefaultDisposition::Ignore => Some(Disposition::Continue),
                DefaultDisposition::Stop => Some(Disposition::Stop),
                DefaultDisposition::Continue => Some(Disposition::WakeProcess),
                DefaultDisposition::Terminate | DefaultDisposition::TerminateWithCore => {
                    Some(Disposition::Terminate {
                        code: ((128 + sig as i32) << 8) | sig as i32,
                    })
                }
            }
        }
        Handler::User(addr) => {
            if action.flags.contains(SigFlags::SA_RESETHAND) {
                actions.reset_to_default(sig);
            }
            state.pending.lock().remove(sig);
            Some(Disposition::EnterUserHandler {
                handler_addr: addr,
                sig,
            })
        }
    }
}

/// EINTR translation for a blocking syscall woken by [`crate::sync::WakeReason::Signal`].
pub fn eintr() -> Errno {
    Errno::Intr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigset_basic() {
        let mut s = SigSet::EMPTY;
        assert!(s.is_empty());
        s.insert(SIGTERM);
        assert!(s.contains(SIGTERM));
        assert!(!s.contains(SIGINT));
        s.remove(SIGTERM);
        assert!(!s.contains(SIGTERM));
    }

    #[test]
    fn first_unblocked_picks_lowest() {
        let mut pending = SigSet::EMPTY;
        pending.insert(SIGTERM);
        pending.insert(SIGINT);
        let blocked = SigSet::EMPTY;
        assert_eq!(pending.first_unblocked(blocked), Some(SIGINT));
    }

    #[test]
    fn blocked_signal_not_selected() {
        let mut pending = SigSet::EMPTY;
        pending.insert(SIGINT);
        pending.insert(SIGTERM);
        let mut blocked = SigSet::EMPTY;
        blocked.insert(SIGINT);
        assert_eq!(pending.first_unblocked(blocked), Some(SIGTERM));
    }

    #[test]
    fn ignored_signal_is_dropped() {
        let actions = ActionTable::new();
        actions
            .set(SIGTERM, SigAction { handler: Handler::Ignore, ..Default::default() })
            .unwrap();
        let state = ThreadSignalState::new();
        assert_eq!(send(&actions, &state, SIGTERM).unwrap(), SendOutcome::Dropped);
        assert!(state.pending.lock().is_empty());
    }

    #[test]
    fn blocked_signal_is_dropped_not_queued() {
        let actions = ActionTable::new();
        let state = ThreadSignalState::new();
        state.blocked.lock().insert(SIGTERM);
        assert_eq!(send(&actions, &state, SIGTERM).unwrap(), SendOutcome::Dropped);
        assert!(!state.pending.lock().contains(SIGTERM));
    }

    #[test]
    fn sigkill_cannot_be_blocked_or_ignored() {
        let actions = ActionTable::new();
        let state = ThreadSignalState::new();
        state.blocked.lock().insert(SIGKILL);
        assert_eq!(send(&actions, &state, SIGKILL).unwrap(), SendOutcome::Delivered);
        assert!(state.pending.lock().contains(SIGKILL));

        let err = actions
            .set(SIGKILL, SigAction { handler: Handler::Ignore, ..Default::default() })
            .unwrap_err();
        assert_eq!(err, Errno::Inval);
    }

    #[test]
    fn default_terminate_encodes_exit_status() {
        let actions = ActionTable::new();
        let state = ThreadSignalState::new();
        send(&actions, &state, SIGTERM).unwrap();
        let ctx = Context::default();
        let disp = handle_next(&actions, &state, &ctx).unwrap();
        assert_eq!(disp, Disposition::Terminate { code: (128 + 15) << 8 | 15 });
    }

    #[test]
    fn reset_hand_reverts_to_default_after_one_delivery() {
        let actions = ActionTable::new();
        actions
            .set(
                SIGTERM,
                SigAction {
                    handler: Handler::User(0x4000),
                    flags: SigFlags::SA_RESETHAND,
                    ..Default::default()
                },
            )
            .unwrap();
        let state = ThreadSignalState::new();
        send(&actions, &state, SIGTERM).unwrap();
        let ctx = Context::default();
        let disp = handle_next(&actions, &state, &ctx).unwrap();
        assert_eq!(disp, Disposition::EnterUserHandler { handler_addr: 0x4000, sig: SIGTERM });
        assert_eq!(actions.get(SIGTERM).handler, Handler::Default);
    }
}
