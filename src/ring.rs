//! Lock-free SPSC ring buffer for audio samples.
//!
//! The transfer rings sit between the modem thread and the realtime backend
//! callback, so the implementation is wait-free on both ends: one atomic
//! load of the opposite index, a copy, one atomic store of your own index.
//!
//! Besides plain copy in/out, the ring exposes a vectored view of the
//! readable (or writable) region as up to two contiguous spans. The stream
//! engine resamples directly into and out of those spans whenever the first
//! span covers a whole request, skipping one full copy on the hot path.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Single-producer single-consumer ring of `f32` samples.
///
/// Capacity is rounded up to a power of two. Indices run monotonically
/// modulo twice the capacity, which lets the full capacity be used while
/// still distinguishing empty from full: `read_space() + write_space()`
/// always equals `capacity()`.
///
/// The contract is strictly SPSC: at most one thread writes
/// (`write`, `with_write_slices`, `advance_write`) and at most one thread
/// reads (`read`, `with_read_slices`, `advance_read`) at any time.
/// `reset()` is legal only while both ends are quiesced.
pub struct RingBuffer {
    data: Box<[UnsafeCell<f32>]>,
    /// Next index to read, in `[0, 2 * capacity)`.
    read_idx: AtomicUsize,
    /// Next index to write, in `[0, 2 * capacity)`.
    write_idx: AtomicUsize,
    capacity: usize,
}

// Safety: the SPSC discipline above means every cell is touched by at most
// one thread at a time; index handoff uses acquire/release ordering.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Creates a ring holding at least `min_capacity` samples.
    pub fn new(min_capacity: usize) -> Self {
        let capacity = min_capacity.max(2).next_power_of_two();
        let data = (0..capacity)
            .map(|_| UnsafeCell::new(0.0f32))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            data,
            read_idx: AtomicUsize::new(0),
            write_idx: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Total number of samples the ring can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn distance(&self, from: usize, to: usize) -> usize {
        to.wrapping_sub(from) & (2 * self.capacity - 1)
    }

    /// Number of samples available to read.
    pub fn read_space(&self) -> usize {
        let w = self.write_idx.load(Ordering::Acquire);
        let r = self.read_idx.load(Ordering::Relaxed);
        self.distance(r, w)
    }

    /// Number of samples that can be written without overwriting.
    pub fn write_space(&self) -> usize {
        let r = self.read_idx.load(Ordering::Acquire);
        let w = self.write_idx.load(Ordering::Relaxed);
        self.capacity - self.distance(r, w)
    }

    /// Copies up to `buf.len()` samples into the ring.
    ///
    /// Returns the number of samples actually written; short when the ring
    /// lacks space. Never blocks.
    pub fn write(&self, buf: &[f32]) -> usize {
        let n = buf.len().min(self.write_space());
        if n == 0 {
            return 0;
        }
        let w = self.write_idx.load(Ordering::Relaxed);
        let pos = w & (self.capacity - 1);
        let first = n.min(self.capacity - pos);
        for (i, &s) in buf[..first].iter().enumerate() {
            unsafe { *self.data[pos + i].get() = s };
        }
        for (i, &s) in buf[first..n].iter().enumerate() {
            unsafe { *self.data[i].get() = s };
        }
        self.write_idx
            .store((w + n) & (2 * self.capacity - 1), Ordering::Release);
        n
    }

    /// Copies up to `buf.len()` samples out of the ring.
    ///
    /// Returns the number of samples actually read; short when the ring
    /// lacks data. Never blocks.
    pub fn read(&self, buf: &mut [f32]) -> usize {
        let n = buf.len().min(self.read_space());
        if n == 0 {
            return 0;
        }
        let r = self.read_idx.load(Ordering::Relaxed);
        let pos = r & (self.capacity - 1);
        let first = n.min(self.capacity - pos);
        for (i, s) in buf[..first].iter_mut().enumerate() {
            *s = unsafe { *self.data[pos + i].get() };
        }
        for (i, s) in buf[first..n].iter_mut().enumerate() {
            *s = unsafe { *self.data[i].get() };
        }
        self.read_idx
            .store((r + n) & (2 * self.capacity - 1), Ordering::Release);
        n
    }

    /// Presents the readable region as up to two contiguous spans.
    ///
    /// The spans together cover exactly `read_space()` samples. The caller
    /// must follow up with [`advance_read`](Self::advance_read) for however
    /// many samples it consumed. Consumer side only.
    pub fn with_read_slices<R>(&self, f: impl FnOnce(&[f32], &[f32]) -> R) -> R {
        let n = self.read_space();
        let r = self.read_idx.load(Ordering::Relaxed);
        let pos = r & (self.capacity - 1);
        let first = n.min(self.capacity - pos);
        // Safety: [pos, pos + first) and [0, n - first) hold committed data
        // that only this (single) consumer may touch until advance_read.
        let a = unsafe {
            std::slice::from_raw_parts(self.data[pos].get() as *const f32, first)
        };
        let b = if n > first {
            unsafe { std::slice::from_raw_parts(self.data[0].get() as *const f32, n - first) }
        } else {
            &[]
        };
        f(a, b)
    }

    /// Presents the writable region as up to two contiguous spans.
    ///
    /// The spans together cover exactly `write_space()` samples. Data copied
    /// in is not visible to the reader until the caller commits it with
    /// [`advance_write`](Self::advance_write). Producer side only.
    pub fn with_write_slices<R>(&self, f: impl FnOnce(&mut [f32], &mut [f32]) -> R) -> R {
        let n = self.write_space();
        let w = self.write_idx.load(Ordering::Relaxed);
        let pos = w & (self.capacity - 1);
        let first = n.min(self.capacity - pos);
        // Safety: the vacant region is untouched by the reader, and the SPSC
        // contract admits only one producer into this method.
        let a = unsafe { std::slice::from_raw_parts_mut(self.data[pos].get(), first) };
        let b = if n > first {
            unsafe { std::slice::from_raw_parts_mut(self.data[0].get(), n - first) }
        } else {
            &mut []
        };
        f(a, b)
    }

    /// Commits `n` samples previously peeked with `with_read_slices`.
    pub fn advance_read(&self, n: usize) {
        debug_assert!(n <= self.read_space());
        let r = self.read_idx.load(Ordering::Relaxed);
        self.read_idx
            .store((r + n) & (2 * self.capacity - 1), Ordering::Release);
    }

    /// Publishes `n` samples previously filled with `with_write_slices`.
    pub fn advance_write(&self, n: usize) {
        debug_assert!(n <= self.write_space());
        let w = self.write_idx.load(Ordering::Relaxed);
        self.write_idx
            .store((w + n) & (2 * self.capacity - 1), Ordering::Release);
    }

    /// Empties the ring.
    ///
    /// Only legal while neither end is mid-operation; used when a stopped
    /// stream is torn down or re-armed.
    pub fn reset(&self) {
        self.read_idx.store(0, Ordering::Release);
        self.write_idx.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        assert_eq!(RingBuffer::new(1000).capacity(), 1024);
        assert_eq!(RingBuffer::new(4096).capacity(), 4096);
    }

    #[test]
    fn test_spaces_sum_to_capacity() {
        let rb = RingBuffer::new(64);
        assert_eq!(rb.read_space() + rb.write_space(), rb.capacity());

        rb.write(&[1.0; 10]);
        assert_eq!(rb.read_space(), 10);
        assert_eq!(rb.read_space() + rb.write_space(), rb.capacity());

        let mut out = [0.0; 4];
        rb.read(&mut out);
        assert_eq!(rb.read_space(), 6);
        assert_eq!(rb.read_space() + rb.write_space(), rb.capacity());
    }

    #[test]
    fn test_full_capacity_is_usable() {
        let rb = RingBuffer::new(8);
        let written = rb.write(&[0.5; 8]);
        assert_eq!(written, 8);
        assert_eq!(rb.write_space(), 0);
        assert_eq!(rb.read_space(), 8);
    }

    #[test]
    fn test_write_returns_short_count_when_full() {
        let rb = RingBuffer::new(8);
        assert_eq!(rb.write(&[1.0; 6]), 6);
        assert_eq!(rb.write(&[2.0; 6]), 2);

        let mut out = [0.0; 8];
        assert_eq!(rb.read(&mut out), 8);
        assert_eq!(&out[..6], &[1.0; 6]);
        assert_eq!(&out[6..], &[2.0; 2]);
    }

    #[test]
    fn test_fifo_order_across_wrap() {
        let rb = RingBuffer::new(8);
        let mut next_in = 0.0f32;
        let mut next_out = 0.0f32;

        for _ in 0..50 {
            let block: Vec<f32> = (0..5)
                .map(|_| {
                    let v = next_in;
                    next_in += 1.0;
                    v
                })
                .collect();
            assert_eq!(rb.write(&block), 5);

            let mut out = [0.0f32; 5];
            assert_eq!(rb.read(&mut out), 5);
            for &v in &out {
                assert_eq!(v, next_out);
                next_out += 1.0;
            }
        }
    }

    #[test]
    fn test_read_slices_cover_read_space() {
        let rb = RingBuffer::new(8);
        // Force a wrap: fill, drain 6, refill 4.
        rb.write(&[0.0; 8]);
        let mut sink = [0.0; 6];
        rb.read(&mut sink);
        rb.write(&[1.0, 2.0, 3.0, 4.0]);

        rb.with_read_slices(|a, b| {
            assert_eq!(a.len() + b.len(), rb.read_space());
            let joined: Vec<f32> = a.iter().chain(b.iter()).copied().collect();
            assert_eq!(&joined[2..], &[1.0, 2.0, 3.0, 4.0]);
        });
    }

    #[test]
    fn test_write_slices_then_advance_publishes() {
        let rb = RingBuffer::new(8);
        rb.with_write_slices(|a, _b| {
            a[0] = 7.0;
            a[1] = 8.0;
        });
        // Nothing visible until committed.
        assert_eq!(rb.read_space(), 0);
        rb.advance_write(2);
        assert_eq!(rb.read_space(), 2);

        let mut out = [0.0; 2];
        rb.read(&mut out);
        assert_eq!(out, [7.0, 8.0]);
    }

    #[test]
    fn test_peek_then_advance_read() {
        let rb = RingBuffer::new(8);
        rb.write(&[1.0, 2.0, 3.0]);
        let first = rb.with_read_slices(|a, _| a[0]);
        assert_eq!(first, 1.0);
        // Peeking does not consume.
        assert_eq!(rb.read_space(), 3);
        rb.advance_read(3);
        assert_eq!(rb.read_space(), 0);
    }

    #[test]
    fn test_reset_empties() {
        let rb = RingBuffer::new(16);
        rb.write(&[1.0; 10]);
        rb.reset();
        assert_eq!(rb.read_space(), 0);
        assert_eq!(rb.write_space(), 16);
    }

    #[test]
    fn test_spsc_threaded_soak() {
        const TOTAL: usize = 100_000;
        let rb = Arc::new(RingBuffer::new(256));

        let producer = {
            let rb = Arc::clone(&rb);
            std::thread::spawn(move || {
                let mut sent = 0usize;
                while sent < TOTAL {
                    let end = (sent + 17).min(TOTAL);
                    let block: Vec<f32> = (sent..end).map(|i| i as f32).collect();
                    let n = rb.write(&block);
                    sent += n;
                    if n == 0 {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut received = 0usize;
        let mut buf = [0.0f32; 31];
        while received < TOTAL {
            let n = rb.read(&mut buf);
            for &v in &buf[..n] {
                assert_eq!(v, received as f32);
                received += 1;
            }
            if n == 0 {
                std::thread::yield_now();
            }
            // Invariant must hold under concurrency.
            let rs = rb.read_space();
            assert!(rs <= rb.capacity());
        }

        producer.join().unwrap();
        assert_eq!(rb.read_space(), 0);
    }
}
