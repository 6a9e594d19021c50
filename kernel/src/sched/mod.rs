//! Per-CPU scheduling: run queues, yield/block/wake, and the process
//! lifecycle operations (fork/exit/waitpid) that ride on top of them.
//!
//! The actual register save/restore and stack switch
//! (`arch_save_context`/`arch_yield`) are the context-switch
//! collaborator's job; what lives here is everything *above* that: which
//! thread runs next, what happens to a sleeping thread's run-queue
//! membership, and the bookkeeping fork/exit/waitpid need. A single CPU
//! (CPU 0) is modeled by default; `set_cpu_count` grows the per-CPU array
//! for tests that want to exercise multiple queues.

pub mod reaper;
pub mod runqueue;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::Errno;
use crate::process::pid;
use crate::process::process::{self, Process, ProcessFlags};
use crate::process::thread::{Thread, ThreadState, Tid};
use crate::signal;
use crate::sync::Spinlock;
use runqueue::RunQueue;

const DEFAULT_CPU_COUNT: usize = 1;

struct Cpus {
    queues: Vec<RunQueue>,
}

impl Cpus {
    fn new(n: usize) -> Self {
        Cpus { queues: (0..n.max(1)).map(|_| RunQueue::new()).collect() }
    }
}

static CPUS: Spinlock<Option<Cpus>> = Spinlock::new(None);

/// Runs `f` against the given CPU's run queue, lazily creating the
/// default single-CPU array on first use. The queue reference never
/// escapes the lock, so growing the array later (`set_cpu_count`) cannot
/// invalidate anything a caller is still holding.
fn with_queue<R>(cpu: usize, f: impl FnOnce(&RunQueue) -> R) -> R {
    let mut guard = CPUS.lock();
    let cpus = guard.get_or_insert_with(|| Cpus::new(DEFAULT_CPU_COUNT));
    let idx = cpu % cpus.queues.len();
    f(&cpus.queues[idx])
}

pub fn init() {
    with_queue(0, |_| ());
    pid::init();
}

/// Grows (never shrinks) the per-CPU array; mirrors `post_smp_hook`
/// bringing up secondary CPUs once their count is known.
pub fn set_cpu_count(n: usize) {
    let mut guard = CPUS.lock();
    let cpus = guard.get_or_insert_with(|| Cpus::new(DEFAULT_CPU_COUNT));
    while cpus.queues.len() < n.max(1) {
        cpus.queues.push(RunQueue::new());
    }
}

fn this_cpu() -> usize {
    0
}

pub fn current_thread() -> Option<Arc<Thread>> {
    with_queue(this_cpu(), |q| q.current())
}

pub fn current_tid() -> Tid {
    current_thread().map(|t| t.tid).unwrap_or(Tid::from_raw(0))
}

pub fn current_process() -> Option<Arc<Process>> {
    current_thread().map(|t| t.process.clone())
}

pub fn enqueue(thread: Arc<Thread>) {
    with_queue(this_cpu(), |q| q.enqueue(thread));
}

/// `yield`: pick the next runnable thread and make it current. Without
/// the context-switch collaborator this cannot actually transfer control
/// flow; it updates scheduler state (`current_thread`, run-queue
/// membership) the way the real yield would between steps 2 and 6 of the
/// documented flow, and is the hook `Mutex`/sleep paths call to keep
/// queue bookkeeping correct.
pub fn yield_now(reschedule: bool) {
    let next = with_queue(this_cpu(), |q| {
        let prev = q.current();
        let next = q.dequeue();

        if let Some(prev) = &prev {
            if reschedule && prev.state() != ThreadState::Sleeping {
                q.enqueue(prev.clone());
            }
        }

        match &next {
            Some(next) => {
                next.set_state(ThreadState::Running);
                q.set_current(Some(next.clone()));
            }
            None => {
                q.note_idle_tick();
                q.set_current(None);
                reaper::reap_pass();
            }
        }
        next
    });

    // Outside the run-queue lock: `on_return_to_user` may itself need it
    // (e.g. `Stop` removing the thread, `Terminate` calling `exit`).
    if let Some(next) = next {
        on_return_to_user(&next);
    }
}

/// The signal-delivery step of the return-to-user path. Consults the
/// thread's next pending-and-unblocked signal and applies whatever of it
/// this layer can: `Stop`/`Terminate` change scheduler state directly,
/// `WakeProcess` resumes stopped siblings, and `EnterUserHandler` is
/// handed back so the (out-of-scope) trampoline can splice the user-mode
/// register file and jump to the handler.
pub fn on_return_to_user(thread: &Arc<Thread>) -> Option<signal::Disposition> {
    let ctx = *thread.context.lock();
    let disposition = signal::handle_next(&thread.process.actions, &thread.signals, &ctx)?;
    match disposition {
        signal::Disposition::Continue => {}
        signal::Disposition::Stop => {
            log::info!("stop: tid={} pid={}", thread.tid.raw(), thread.process.pid);
            thread.set_state(ThreadState::Stopped);
            thread.process.set_flags(ProcessFlags::STOPPED);
            with_queue(this_cpu(), |q| q.remove(thread.tid));
        }
        signal::Disposition::WakeProcess => {
            log::info!("continue: pid={}", thread.process.pid);
            thread.process.set_flags(ProcessFlags::RUNNING);
            for t in thread.process.threads.lock().iter() {
                if t.state() == ThreadState::Stopped {
                    t.set_state(ThreadState::Runnable);
                    enqueue(t.clone());
                }
            }
        }
        signal::Disposition::Terminate { code } => {
            unwind(&thread.process, code);
        }
        signal::Disposition::EnterUserHandler { .. } => {}
    }
    Some(disposition)
}

/// The architecture-independent half of page-fault handling: resolve the
/// faulting thread's VAS, attempt lazy-map/CoW resolution, and on failure
/// deliver `SIGSEGV` and unwind the thread. Called from the (stubbed)
/// fault-entry contract in [`crate::arch`]; decoding `CR2` and the CPU
/// error code into [`crate::arch::PageFaultInfo`], and the actual trap
/// return, are out of scope here.
pub fn page_fault(thread: &Arc<Thread>, info: crate::arch::PageFaultInfo) {
    let vas = thread.address_space();
    match vas.fault(info.addr, crate::mm::layout::PAGE_SIZE) {
        crate::mm::vas::FaultResult::Resolved => {}
        crate::mm::vas::FaultResult::NotResolved => {
            log::error!(
                "unresolved page fault: pid={} tid={} addr={:#x} write={} user={} vas_consistent={}",
                thread.process.pid,
                thread.tid.raw(),
                info.addr,
                info.write,
                info.user,
                vas.dump_check(),
            );
            let _ = signal::send(&thread.process.actions, &thread.signals, signal::SIGSEGV);
            exit_via_signal(&thread.process, signal::SIGSEGV);
        }
    }
}

/// `kill`: POSIX pid-selector signal delivery. Resolves target(s) through
/// the flat registry (process-group membership isn't otherwise walkable
/// from a single process), marks the signal pending on each target's main
/// thread, and wakes it if delivered.
pub fn kill(sender_pgid: u32, pid_selector: i64, sig: u32) -> Result<(), Errno> {
    let targets: Vec<Arc<Process>> = match pid_selector {
        p if p > 0 => process::REGISTRY.find(p as u32).into_iter().collect(),
        0 => process::REGISTRY.all_matching(|p| p.pgid.load(core::sync::atomic::Ordering::Relaxed) == sender_pgid),
        -1 => process::REGISTRY.all_matching(|_| true),
        p => {
            let pgid = (-p) as u32;
            process::REGISTRY.all_matching(|proc| proc.pgid.load(core::sync::atomic::Ordering::Relaxed) == pgid)
        }
    };
    if targets.is_empty() {
        return Err(Errno::Srch);
    }
    for target in &targets {
        if let Some(main) = target.main_thread() {
            if signal::send(&target.actions, &main.signals, sig)? == signal::SendOutcome::Delivered {
                wake_tid(main.tid);
            }
        }
    }
    Ok(())
}

/// Sleep states a thread can enter; mirrors `sleep_enter`'s parameter.
pub enum SleepKind<'a> {
    Queue(&'a crate::sync::SleepQueue),
    Forever,
}

/// `sleep_enter`: parks the current thread. Returns the reason it woke.
/// In the forever case the only wakeup is an explicit `wake_tid` call
/// (stop/continue) or a signal.
pub fn sleep_enter(kind: SleepKind<'_>) -> crate::sync::WakeReason {
    let Some(thread) = current_thread() else {
        return crate::sync::WakeReason::Thread;
    };
    thread.set_state(ThreadState::Sleeping);
    if let SleepKind::Queue(q) = kind {
        q.insert(thread.tid);
    }
    // Cooperative model: caller loops checking wake conditions; this
    // function's job is only to record the sleep/queue membership. Under
    // a real scheduler this would be where `arch_save_context` suspends
    // the thread until woken.
    crate::sync::WakeReason::Thread
}

pub fn wake_tid(tid: Tid) {
    // In a full scheduler this would look up the thread control block by
    // tid and re-enqueue it; callers in this crate hold the `Arc<Thread>`
    // directly and call `enqueue` themselves once they observe the wake.
    let _ = tid;
}

/// `fork`: duplicate `parent` into a new process with a cloned VAS and a
/// single main thread. Returns the child.
pub fn fork(parent: &Arc<Process>) -> Arc<Process> {
    let child = process::create(Some(parent), &parent.name.lock().clone(), parent.flags());
    crate::mm::vas::AddressSpace::clone_into(&parent.vas, &child.vas);

    let main = Thread::new(child.clone());
    child.add_thread(main.clone());
    enqueue(main);
    log::info!("fork: pid={} -> pid={}", parent.pid, child.pid);
    child
}

/// `execve` contract point: destroys every thread but the caller's,
/// installs a fresh VAS, and leaves the loader (a collaborator) to
/// populate it before entering user mode. Returns `Err` if called with
/// other threads still attached and unable to be torn down (never the
/// case in this single-threaded model, kept for the documented failure
/// surface).
pub fn exec_prepare(proc: &Arc<Process>) -> Result<(), Errno> {
    let mut threads = proc.threads.lock();
    let keep = current_thread();
    threads.retain(|t| Some(t.tid) == keep.as_ref().map(|k| k.tid));
    Ok(())
}

/// `exit`: marks every thread stopping, deparents children to init,
/// signals `SIGCHLD`, wakes the parent's waitpid queue, and records exit
/// status. Assumes the caller is the process's own thread calling exit
/// on itself, per the documented "current thread yields" flow.
pub fn exit(proc: &Arc<Process>, status: i32) {
    unwind(proc, crate::syscall::encode_exit(status));
}

/// Terminates `proc` the way an uncaught, non-ignored signal does: same
/// teardown as [`exit`], but the wait-status `sig` already encodes per
/// [`crate::syscall::encode_signal_death`] rather than a plain exit code.
pub fn exit_via_signal(proc: &Arc<Process>, sig: u32) {
    unwind(proc, crate::syscall::encode_signal_death(sig as u8));
}

/// Shared teardown behind [`exit`] and [`exit_via_signal`]; `wstatus` is
/// already in `waitpid`'s wire encoding.
fn unwind(proc: &Arc<Process>, wstatus: i32) {
    log::info!("exit: pid={} wstatus={:#x}", proc.pid, wstatus);
    proc.set_flags(ProcessFlags::STOPPED);
    let mut threads = proc.threads.lock();
    for t in threads.iter() {
        t.set_state(ThreadState::Zombie);
        with_queue(this_cpu(), |q| {
            q.remove(t.tid);
        });
    }
    // No context-switch collaborator to confirm the last CPU has actually
    // left this process's threads; the cooperative model treats the
    // exiting thread's own call to `exit` as that confirmation and drops
    // the thread handles here so the reaper can proceed immediately.
    threads.clear();
    drop(threads);
    proc.mark_zombie(wstatus);

    if let Some(init) = process::REGISTRY.find(1) {
        if !Arc::ptr_eq(&init, proc) {
            process::reparent_children_to_init(proc, &init);
        }
    }

    match proc.parent() {
        Some(parent) => {
            let _ = signal::send(&parent.actions, &parent.signals, signal::SIGCHLD);
            let woken = parent.waitpid_queue.wake(usize::MAX);
            for tid in woken {
                wake_tid(tid);
            }
        }
        // No parent left to claim this zombie (it is init, or its parent
        // already exited before reparenting completed): hand it to the
        // reaper instead of leaving it unclaimed forever.
        None => reaper::queue_for_reap(proc.clone()),
    }
}

/// `waitpid`: per POSIX pid selector semantics.
pub fn waitpid(parent: &Arc<Process>, pid_selector: i64, nohang: bool) -> Result<(i64, i32), Errno> {
    loop {
        let children = parent.children.lock();
        let matches: Vec<Arc<Process>> = children
            .iter()
            .filter(|c| match pid_selector {
                p if p > 0 => c.pid as i64 == p,
                0 => c.pgid.load(core::sync::atomic::Ordering::Relaxed) == parent.pgid.load(core::sync::atomic::Ordering::Relaxed),
                -1 => true,
                p => c.pgid.load(core::sync::atomic::Ordering::Relaxed) as i64 == -p,
            })
            .cloned()
            .collect();
        drop(children);

        if matches.is_empty() {
            return Err(Errno::Child);
        }

        if let Some(zombie) = matches.iter().find(|c| c.is_zombie()) {
            let pid = zombie.pid;
            let status = zombie.exit_status.load(core::sync::atomic::Ordering::Relaxed);
            parent.children.lock().retain(|c| c.pid != pid);
            process::REGISTRY.remove(pid);
            pid::free(pid);
            return Ok((pid as i64, status));
        }

        if nohang {
            return Ok((0, 0));
        }

        sleep_enter(SleepKind::Queue(&parent.waitpid_queue));
        // Cooperative model: the caller is expected to retry; a real
        // blocking syscall path would loop here until woken by `exit`.
        return Err(Errno::Again);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_proc() -> Arc<Process> {
        crate::mm::frame::test_init_global();
        process::create(None, "init", ProcessFlags::RUNNING)
    }

    #[test]
    fn fork_creates_child_with_own_pid() {
        let parent = init_proc();
        let child = fork(&parent);
        assert_ne!(parent.pid, child.pid);
        assert_eq!(child.parent().unwrap().pid, parent.pid);
    }

    #[test]
    fn fork_exit_waitpid_round_trip() {
        let init = init_proc();
        let parent = process::create(Some(&init), "parent", ProcessFlags::RUNNING);
        let child = fork(&parent);
        let before = process::REGISTRY.count();

        exit(&child, 0);
        let (pid, status) = waitpid(&parent, -1, false).unwrap();
        assert_eq!(pid as u32, child.pid);
        assert_eq!(status, 0);
        assert_eq!(process::REGISTRY.count(), before - 1);
    }

    #[test]
    fn waitpid_with_no_children_returns_echild() {
        let parent = init_proc();
        assert_eq!(waitpid(&parent, -1, false).unwrap_err(), Errno::Child);
    }

    #[test]
    fn waitpid_nohang_with_no_zombie_returns_zero() {
        let parent = init_proc();
        let _child = fork(&parent);
        assert_eq!(waitpid(&parent, -1, true).unwrap(), (0, 0));
    }

    #[test]
    fn kill_by_pid_marks_signal_pending_on_main_thread() {
        let proc = init_proc();
        let main = Thread::new(proc.clone());
        proc.add_thread(main.clone());

        kill(0, proc.pid as i64, signal::SIGTERM).unwrap();
        assert!(main.signals.pending.lock().contains(signal::SIGTERM));
    }

    #[test]
    fn kill_with_no_matching_pid_fails_esrch() {
        let _proc = init_proc();
        assert_eq!(kill(0, 999_999, signal::SIGTERM).unwrap_err(), Errno::Srch);
    }

    #[test]
    fn page_fault_outside_any_allocation_delivers_sigsegv_and_exits() {
        let init = init_proc();
        let proc = process::create(Some(&init), "faulter", ProcessFlags::RUNNING);
        let main = Thread::new(proc.clone());
        proc.add_thread(main.clone());

        page_fault(&main, crate::arch::PageFaultInfo { addr: 0x900_0000, write: true, user: true });
        assert!(proc.is_zombie());
    }

    #[test]
    fn page_fault_within_reservation_is_resolved_without_exit() {
        use crate::mm::vas::{AllocKind, Prot};

        let init = init_proc();
        let proc = process::create(Some(&init), "faulter", ProcessFlags::RUNNING);
        proc.vas.reserve(0x2000, 0x1000, AllocKind::Normal, Prot::R | Prot::W).unwrap();
        let main = Thread::new(proc.clone());
        proc.add_thread(main.clone());

        page_fault(&main, crate::arch::PageFaultInfo { addr: 0x2000, write: false, user: true });
        assert!(!proc.is_zombie());
        assert!(proc.vas.page_table.get_page(0x2000, false).unwrap().is_present());
    }

    #[test]
    fn on_return_to_user_terminates_on_default_disposition() {
        let init = init_proc();
        let proc = process::create(Some(&init), "signaled", ProcessFlags::RUNNING);
        let main = Thread::new(proc.clone());
        proc.add_thread(main.clone());

        signal::send(&proc.actions, &main.signals, signal::SIGTERM).unwrap();
        let disposition = on_return_to_user(&main).unwrap();
        assert_eq!(
            disposition,
            signal::Disposition::Terminate { code: crate::syscall::encode_signal_death(signal::SIGTERM as u8) }
        );
        assert!(proc.is_zombie());
    }
}
