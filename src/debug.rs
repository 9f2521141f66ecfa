//! Real-time safe diagnostics.
//!
//! The audio thread must not call into `log` (a logger may lock, allocate or
//! do I/O). Instead it formats into a fixed-size entry and pushes it onto a
//! preallocated SPSC ring. The control side drains the ring and forwards each
//! entry to `log` at the recorded level.

use std::fmt;

use log::Level;
use ringbuf::{Consumer, Producer, RingBuffer};

/// Entries held by the ring before new ones are dropped.
pub const LOG_CAP: usize = 64;
const LOG_MSG_MAX: usize = 128;

#[derive(Copy, Clone)]
pub struct LogEntry {
    level: Level,
    len: u8,
    bytes: [u8; LOG_MSG_MAX],
}

impl LogEntry {
    pub fn level(&self) -> Level {
        self.level
    }

    pub fn message(&self) -> &str {
        let len = self.len as usize;
        match std::str::from_utf8(&self.bytes[..len]) {
            Ok(s) => s,
            // Truncation may have split a code point
            Err(e) => std::str::from_utf8(&self.bytes[..e.valid_up_to()]).unwrap_or(""),
        }
    }
}

struct FixedBuf {
    buf: [u8; LOG_MSG_MAX],
    len: usize,
}

impl FixedBuf {
    fn new() -> Self {
        Self {
            buf: [0; LOG_MSG_MAX],
            len: 0,
        }
    }

    fn into_entry(self, level: Level) -> LogEntry {
        LogEntry {
            level,
            len: self.len.min(LOG_MSG_MAX) as u8,
            bytes: self.buf,
        }
    }
}

impl fmt::Write for FixedBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let avail = LOG_MSG_MAX - self.len;
        if avail == 0 {
            return Ok(());
        }
        let bytes = s.as_bytes();
        let n = bytes.len().min(avail);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        Ok(())
    }
}

/// Audio-thread end of the diagnostics ring.
pub struct RtLogger {
    producer: Producer<LogEntry>,
    dropped: u64,
}

/// Control-thread end of the diagnostics ring.
pub struct LogDrain {
    consumer: Consumer<LogEntry>,
}

pub fn log_ring() -> (RtLogger, LogDrain) {
    let (producer, consumer) = RingBuffer::<LogEntry>::new(LOG_CAP).split();
    (
        RtLogger {
            producer,
            dropped: 0,
        },
        LogDrain { consumer },
    )
}

impl RtLogger {
    /// Format and enqueue; a full ring drops the entry.
    pub fn log_args(&mut self, level: Level, args: fmt::Arguments) {
        let mut buf = FixedBuf::new();
        let _ = fmt::write(&mut buf, args);
        if self.producer.push(buf.into_entry(level)).is_err() {
            self.dropped += 1;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl LogDrain {
    /// Forward every pending entry to `log`; returns how many were drained.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while let Some(entry) = self.consumer.pop() {
            log::log!(target: "voxchain::rt", entry.level(), "{}", entry.message());
            n += 1;
        }
        n
    }

    /// Drain into a caller-supplied sink instead of `log`.
    pub fn drain_with(&mut self, mut f: impl FnMut(&LogEntry)) -> usize {
        let mut n = 0;
        while let Some(entry) = self.consumer.pop() {
            f(&entry);
            n += 1;
        }
        n
    }
}

#[macro_export]
macro_rules! rt_log {
    ($logger:expr, $level:expr, $($arg:tt)*) => {
        $logger.log_args($level, format_args!($($arg)*))
    };
}
