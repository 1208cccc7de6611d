//! Structured kernel log service.
//!
//! A fixed-size, heap-free circular buffer of structured log entries
//! behind a spin mutex. The service is armed by [`log_init`], which the
//! first process entering user mode triggers; entries recorded before
//! that are dropped.

use spin::Mutex;

/// Maximum number of entries the ring holds before wrapping.
const LOG_BUFFER_CAPACITY: usize = 256;

/// Maximum stored length of a message, in bytes.
const LOG_MESSAGE_MAX_LEN: usize = 64;

/// Maximum stored length of the subsystem tag, in bytes.
const LOG_SUBSYSTEM_MAX_LEN: usize = 8;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One recorded entry.
#[derive(Clone, Copy)]
pub struct LogEntry {
    pub tsc: u64,
    pub level: LogLevel,
    subsystem: [u8; LOG_SUBSYSTEM_MAX_LEN],
    subsystem_len: u8,
    message: [u8; LOG_MESSAGE_MAX_LEN],
    message_len: u8,
}

impl LogEntry {
    pub fn subsystem(&self) -> &str {
        core::str::from_utf8(&self.subsystem[..self.subsystem_len as usize]).unwrap_or("?")
    }

    pub fn message(&self) -> &str {
        core::str::from_utf8(&self.message[..self.message_len as usize]).unwrap_or("?")
    }
}

struct LogRing {
    armed: bool,
    entries: [Option<LogEntry>; LOG_BUFFER_CAPACITY],
    next: usize,
    total: u64,
}

static LOG: Mutex<LogRing> = Mutex::new(LogRing {
    armed: false,
    entries: [None; LOG_BUFFER_CAPACITY],
    next: 0,
    total: 0,
});

/// Arm the log service. Idempotent; called on the first entry into user
/// mode.
pub fn log_init() {
    let mut ring = LOG.lock();
    if !ring.armed {
        ring.armed = true;
        drop(ring);
        klog(LogLevel::Info, "log", "log service armed");
    }
}

/// Record one entry. Silently dropped before [`log_init`] and truncated
/// to the fixed field widths.
pub fn klog(level: LogLevel, subsystem: &str, message: &str) {
    let mut ring = LOG.lock();
    if !ring.armed {
        return;
    }

    let mut entry = LogEntry {
        tsc: crate::arch::read_tsc(),
        level,
        subsystem: [0; LOG_SUBSYSTEM_MAX_LEN],
        subsystem_len: 0,
        message: [0; LOG_MESSAGE_MAX_LEN],
        message_len: 0,
    };
    let sub = subsystem.as_bytes();
    let n = sub.len().min(LOG_SUBSYSTEM_MAX_LEN);
    entry.subsystem[..n].copy_from_slice(&sub[..n]);
    entry.subsystem_len = n as u8;
    let msg = message.as_bytes();
    let n = msg.len().min(LOG_MESSAGE_MAX_LEN);
    entry.message[..n].copy_from_slice(&msg[..n]);
    entry.message_len = n as u8;

    let at = ring.next;
    ring.entries[at] = Some(entry);
    ring.next = (at + 1) % LOG_BUFFER_CAPACITY;
    ring.total += 1;
}

/// Total entries recorded since arming (including overwritten ones).
pub fn log_count() -> u64 {
    LOG.lock().total
}

/// Run `f` over the retained entries, oldest first.
pub fn log_for_each(mut f: impl FnMut(&LogEntry)) {
    let ring = LOG.lock();
    let start = ring.next;
    for i in 0..LOG_BUFFER_CAPACITY {
        if let Some(entry) = &ring.entries[(start + i) % LOG_BUFFER_CAPACITY] {
            f(entry);
        }
    }
}
