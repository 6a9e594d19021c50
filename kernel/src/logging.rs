//! Kernel logging sink.
//!
//! Serial/VGA output is a device driver and therefore outside this
//! crate's scope; what it owns is the `log::Log` implementation that
//! every subsystem's `log::info!`/`log::warn!` calls resolve to, backed
//! by a bounded in-memory ring so panics and early boot messages survive
//! until a collaborator (the real console driver) drains them.

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::sync::Spinlock;

const LOG_CAPACITY: usize = 512;

struct RingSink {
    lines: Spinlock<VecDeque<String>>,
}

impl RingSink {
    const fn new() -> Self {
        RingSink { lines: Spinlock::new(VecDeque::new()) }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() >= LOG_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}

impl Log for RingSink {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.push(format!("[{}] {}", record.level(), record.args()));
    }

    fn flush(&self) {}
}

static SINK: RingSink = RingSink::new();

/// Installs the ring-backed logger as the `log` crate's global logger.
/// Idempotent: a second call only adjusts the max level.
pub fn init() {
    // `set_logger` fails if already set (e.g. a second `init_core` call in
    // a test harness); that's not a condition worth panicking over here.
    let _ = log::set_logger(&SINK);
    log::set_max_level(LevelFilter::Info);
}

/// Drains up to `n` of the most recent buffered lines, oldest first.
/// Used by a console driver collaborator to catch up, and by tests.
pub fn recent(n: usize) -> alloc::vec::Vec<String> {
    let lines = SINK.lines.lock();
    let skip = lines.len().saturating_sub(n);
    lines.iter().skip(skip).cloned().collect()
}

/// Records a panic before the handler halts the CPU. Never returns
/// control to the panicking code; `lib.rs`'s `#[panic_handler]` calls
/// this then spins on `arch::halt`.
#[cfg(not(test))]
pub fn fatal(info: &core::panic::PanicInfo) -> ! {
    SINK.push(format!("[PANIC] {info}"));
    loop {
        crate::arch::halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_sink_drops_oldest_past_capacity() {
        let sink = RingSink::new();
        for i in 0..(LOG_CAPACITY + 10) {
            sink.push(format!("line {i}"));
        }
        let lines = sink.lines.lock();
        assert_eq!(lines.len(), LOG_CAPACITY);
        assert_eq!(lines.front().unwrap(), &format!("line {}", 10));
    }

    #[test]
    fn recent_returns_newest_n_in_order() {
        for i in 0..5 {
            SINK.push(format!("m{i}"));
        }
        let tail = recent(2);
        assert!(tail.len() >= 2);
        assert_eq!(tail[tail.len() - 1], *SINK.lines.lock().back().unwrap());
    }
}
