//! Lock-free versioned snapshot cell.
//!
//! A `SnapshotCell` holds a small `Copy` record packed into `N` atomic words
//! guarded by a sequence counter (a seqlock). One side publishes whole records,
//! the other side reads them without ever blocking:
//!
//! - Parameters: the control thread publishes, the audio thread reads once per
//!   block.
//! - Telemetry: the audio thread publishes once per block, the control thread
//!   reads.
//!
//! # Design Notes
//! - Readers never spin unboundedly. After `READ_RETRIES` failed attempts
//!   `try_read()` gives up and the caller keeps its last good value.
//! - Multiple writers must be serialized by the caller (the controller holds a
//!   mutex around every publish). The audio thread is always a single writer.
//! - A record is either fully visible or not visible at all; a torn read is
//!   detected by the sequence check and discarded.

use std::sync::atomic::{fence, AtomicU32, Ordering};

/// Attempts made by `try_read()` before reporting contention.
const READ_RETRIES: usize = 8;

/// A record that can be stored as a fixed number of 32-bit words.
pub trait Packed<const N: usize>: Copy {
    fn pack(&self) -> [u32; N];
    fn unpack(words: &[u32; N]) -> Self;
}

pub struct SnapshotCell<T: Packed<N>, const N: usize> {
    seq: AtomicU32,
    words: [AtomicU32; N],
    _marker: std::marker::PhantomData<T>,
}

impl<T: Packed<N>, const N: usize> SnapshotCell<T, N> {
    pub fn new(value: T) -> Self {
        let packed = value.pack();
        Self {
            seq: AtomicU32::new(0),
            words: std::array::from_fn(|i| AtomicU32::new(packed[i])),
            _marker: std::marker::PhantomData,
        }
    }

    /// Publish a new record. Callers must not publish concurrently.
    pub fn publish(&self, value: &T) {
        let packed = value.pack();
        let seq = self.seq.load(Ordering::Relaxed);

        // Odd sequence marks a write in progress
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        for (slot, word) in self.words.iter().zip(packed.iter()) {
            slot.store(*word, Ordering::Relaxed);
        }

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Read a consistent record, or `None` if a writer kept interfering.
    #[inline]
    pub fn try_read(&self) -> Option<T> {
        for _ in 0..READ_RETRIES {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let mut packed = [0u32; N];
            for (out, slot) in packed.iter_mut().zip(self.words.iter()) {
                *out = slot.load(Ordering::Relaxed);
            }

            fence(Ordering::Acquire);
            let after = self.seq.load(Ordering::Relaxed);
            if before == after {
                return Some(T::unpack(&packed));
            }
        }
        None
    }

    /// Read, falling back to `last_good` under contention.
    #[inline]
    pub fn read_or(&self, last_good: T) -> T {
        self.try_read().unwrap_or(last_good)
    }

    /// Number of completed publishes (wrapping).
    pub fn version(&self) -> u32 {
        self.seq.load(Ordering::Acquire) / 2
    }
}

// Word helpers shared by every `Packed` implementation.

#[inline]
pub fn f32_word(v: f32) -> u32 {
    v.to_bits()
}

#[inline]
pub fn word_f32(w: u32) -> f32 {
    f32::from_bits(w)
}

#[inline]
pub fn bool_word(v: bool) -> u32 {
    v as u32
}

#[inline]
pub fn word_bool(w: u32) -> bool {
    w != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Pair {
        a: f32,
        b: f32,
    }

    impl Packed<2> for Pair {
        fn pack(&self) -> [u32; 2] {
            [f32_word(self.a), f32_word(self.b)]
        }

        fn unpack(words: &[u32; 2]) -> Self {
            Self {
                a: word_f32(words[0]),
                b: word_f32(words[1]),
            }
        }
    }

    #[test]
    fn test_publish_then_read() {
        let cell = SnapshotCell::new(Pair { a: 1.0, b: 2.0 });
        assert_eq!(cell.try_read(), Some(Pair { a: 1.0, b: 2.0 }));

        cell.publish(&Pair { a: -3.0, b: 4.5 });
        assert_eq!(cell.try_read(), Some(Pair { a: -3.0, b: 4.5 }));
        assert_eq!(cell.version(), 1);
    }

    #[test]
    fn test_concurrent_reads_never_tear() {
        // Writer always publishes a == b; any torn read would break that.
        let cell = Arc::new(SnapshotCell::new(Pair { a: 0.0, b: 0.0 }));
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let cell = Arc::clone(&cell);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for i in 0..20_000 {
                    let v = i as f32;
                    cell.publish(&Pair { a: v, b: v });
                }
                done.store(true, Ordering::Release);
            })
        };

        let mut last = Pair { a: 0.0, b: 0.0 };
        while !done.load(Ordering::Acquire) {
            last = cell.read_or(last);
            assert_eq!(last.a, last.b);
        }

        writer.join().unwrap();
        assert_eq!(cell.try_read(), Some(Pair { a: 19_999.0, b: 19_999.0 }));
    }
}
