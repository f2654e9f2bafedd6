//! Lock-free single-producer single-consumer byte ring buffer.
//!
//! Provides a realtime-safe byte channel for inter-thread communication,
//! suitable for audio thread to I/O thread communication where blocking
//! is unacceptable. Unlike a typed channel, the unit of transfer is a
//! byte slice: callers write and read arbitrarily-sized chunks (audio
//! frames, wire blocks, ...) rather than one item at a time.

use core::{cell::UnsafeCell, mem::MaybeUninit};
#[cfg(not(loom))]
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

#[cfg(loom)]
use loom::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Cache-line padded wrapper to prevent false sharing.
///
/// On most modern x86/ARM CPUs, cache lines are 64 bytes.
/// Padding head and tail to separate cache lines prevents
/// false sharing between producer and consumer threads.
#[repr(align(64))]
struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    const fn new(value: T) -> Self {
        CachePadded(value)
    }
}

impl<T> core::ops::Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Internal shared state for the ring buffer.
struct RingBufferInner {
    buffer: Box<[UnsafeCell<MaybeUninit<u8>>]>,
    capacity: usize,
    mask: usize,
    head: CachePadded<AtomicUsize>, // Write position (producer)
    tail: CachePadded<AtomicUsize>, // Read position (consumer)
}

// SAFETY: RingBufferInner can be shared between threads because access
// is synchronized through atomic operations and each byte slot is only
// ever written by the producer and read by the consumer.
unsafe impl Send for RingBufferInner {}
unsafe impl Sync for RingBufferInner {}

impl RingBufferInner {
    fn new(capacity: usize) -> Self {
        // Round up to next power of 2.
        let capacity = capacity.next_power_of_two().max(1);
        let mask = capacity - 1;

        let buffer: Vec<UnsafeCell<MaybeUninit<u8>>> =
            (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            capacity,
            mask,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }
}

/// Factory for creating producer/consumer pairs.
pub struct SpscRingBuffer;

impl SpscRingBuffer {
    /// Creates a new SPSC byte ring buffer with at least `capacity` bytes
    /// of storage.
    ///
    /// The actual capacity is rounded up to the next power of 2. Returns a
    /// `(Producer, Consumer)` pair for inter-thread communication.
    ///
    /// # Examples
    ///
    /// ```
    /// use bbx_core::spsc::SpscRingBuffer;
    ///
    /// let (mut producer, mut consumer) = SpscRingBuffer::new(16);
    ///
    /// assert_eq!(producer.write(&[1, 2, 3]), 3);
    /// let mut out = [0u8; 3];
    /// assert_eq!(consumer.read(Some(&mut out), 3), 3);
    /// assert_eq!(out, [1, 2, 3]);
    /// ```
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> (Producer, Consumer) {
        let inner = Arc::new(RingBufferInner::new(capacity));
        (
            Producer {
                inner: Arc::clone(&inner),
            },
            Consumer { inner },
        )
    }
}

/// Producer handle for writing bytes into the ring buffer.
///
/// This type is `Send` but not `Clone` - only one producer should exist.
pub struct Producer {
    inner: Arc<RingBufferInner>,
}

unsafe impl Send for Producer {}

impl Producer {
    /// Returns the number of bytes that can currently be written without
    /// overwriting unread data.
    #[inline]
    pub fn write_space(&self) -> usize {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        self.inner.capacity - head.wrapping_sub(tail)
    }

    /// Writes as many bytes of `src` as fit, returning the number written.
    ///
    /// Never blocks. A write that does not fully fit is truncated to what
    /// fits rather than partially overflowing the ring.
    #[inline]
    pub fn write(&mut self, src: &[u8]) -> usize {
        let space = self.write_space();
        let n = src.len().min(space);
        if n == 0 {
            return 0;
        }

        let head = self.inner.head.load(Ordering::Relaxed);
        for (i, &byte) in src[..n].iter().enumerate() {
            let index = head.wrapping_add(i) & self.inner.mask;
            // SAFETY: index is within the writer's reserved region.
            unsafe {
                (*self.inner.buffer[index].get()).write(byte);
            }
        }

        self.inner.head.store(head.wrapping_add(n), Ordering::Release);
        n
    }

    /// Returns the ring's total capacity in bytes (rounded up to a power
    /// of two).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// Consumer handle for reading bytes out of the ring buffer.
///
/// This type is `Send` but not `Clone` - only one consumer should exist.
pub struct Consumer {
    inner: Arc<RingBufferInner>,
}

unsafe impl Send for Consumer {}

impl Consumer {
    /// Returns the number of bytes currently available to read.
    #[inline]
    pub fn read_space(&self) -> usize {
        let head = self.inner.head.load(Ordering::Acquire);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    /// Copies up to `n` unread bytes into `dst` without advancing the
    /// read position. Returns the number of bytes copied.
    #[inline]
    pub fn peek(&self, dst: &mut [u8], n: usize) -> usize {
        let available = self.read_space();
        let n = n.min(available).min(dst.len());
        if n == 0 {
            return 0;
        }

        let tail = self.inner.tail.load(Ordering::Relaxed);
        for i in 0..n {
            let index = tail.wrapping_add(i) & self.inner.mask;
            // SAFETY: index is within the reader's available region.
            dst[i] = unsafe { (*self.inner.buffer[index].get()).assume_init() };
        }
        n
    }

    /// Advances the read position by `n` bytes without copying them out.
    ///
    /// `n` is clamped to the currently available bytes.
    #[inline]
    pub fn advance(&mut self, n: usize) -> usize {
        let n = n.min(self.read_space());
        let tail = self.inner.tail.load(Ordering::Relaxed);
        self.inner.tail.store(tail.wrapping_add(n), Ordering::Release);
        n
    }

    /// Reads up to `n` bytes, copying them into `dst` when present and
    /// always advancing the read position. Passing `None` discards the
    /// bytes (useful for draining the ring without a destination buffer).
    ///
    /// Returns the number of bytes consumed.
    #[inline]
    pub fn read(&mut self, dst: Option<&mut [u8]>, n: usize) -> usize {
        match dst {
            Some(dst) => {
                let copied = self.peek(dst, n);
                self.advance(copied)
            }
            None => self.advance(n),
        }
    }

    /// Returns the ring's total capacity in bytes (rounded up to a power
    /// of two).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_basic_write_read() {
        let (mut producer, mut consumer) = SpscRingBuffer::new(4);

        assert_eq!(producer.write(&[1, 2, 3]), 3);

        let mut out = [0u8; 3];
        assert_eq!(consumer.read(Some(&mut out), 3), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(consumer.read(Some(&mut out), 3), 0);
    }

    #[test]
    fn test_empty_buffer() {
        let (_producer, consumer) = SpscRingBuffer::new(4);
        assert_eq!(consumer.read_space(), 0);
    }

    #[test]
    fn test_full_buffer_truncates_write() {
        let (mut producer, _consumer) = SpscRingBuffer::new(4);

        // Capacity is rounded to power of 2, so 4 bytes.
        assert_eq!(producer.write(&[1, 2, 3, 4]), 4);
        assert_eq!(producer.write_space(), 0);

        // Does not fit: truncated to 0 bytes written.
        assert_eq!(producer.write(&[5]), 0);
    }

    #[test]
    fn test_capacity_rounding() {
        let (producer, _consumer) = SpscRingBuffer::new(3);
        assert_eq!(producer.capacity(), 4);

        let (producer, _consumer) = SpscRingBuffer::new(5);
        assert_eq!(producer.capacity(), 8);

        let (producer, _consumer) = SpscRingBuffer::new(0);
        assert_eq!(producer.capacity(), 1);
    }

    #[test]
    fn test_wraparound() {
        let (mut producer, mut consumer) = SpscRingBuffer::new(4);

        for round in 0..10u8 {
            let chunk = [round * 10, round * 10 + 1, round * 10 + 2, round * 10 + 3];
            assert_eq!(producer.write(&chunk), 4);

            let mut out = [0u8; 4];
            assert_eq!(consumer.read(Some(&mut out), 4), 4);
            assert_eq!(out, chunk);
        }
    }

    #[test]
    fn test_space_invariant() {
        let (mut producer, mut consumer) = SpscRingBuffer::new(8);

        assert_eq!(producer.write_space() + consumer.read_space(), 8);

        producer.write(&[1, 2, 3]);
        assert_eq!(producer.write_space() + consumer.read_space(), 8);

        let mut out = [0u8; 2];
        consumer.read(Some(&mut out), 2);
        assert_eq!(producer.write_space() + consumer.read_space(), 8);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let (mut producer, mut consumer) = SpscRingBuffer::new(4);

        producer.write(&[9, 8, 7]);

        let mut out = [0u8; 3];
        assert_eq!(consumer.peek(&mut out, 3), 3);
        assert_eq!(out, [9, 8, 7]);
        // Still there: peek must not consume.
        assert_eq!(consumer.read_space(), 3);

        assert_eq!(consumer.advance(3), 3);
        assert_eq!(consumer.read_space(), 0);
    }

    #[test]
    fn test_discard_with_none_dst() {
        let (mut producer, mut consumer) = SpscRingBuffer::new(8);

        producer.write(&[1, 2, 3, 4]);
        assert_eq!(consumer.read(None, 2), 2);
        assert_eq!(consumer.read_space(), 2);

        let mut out = [0u8; 2];
        assert_eq!(consumer.read(Some(&mut out), 2), 2);
        assert_eq!(out, [3, 4]);
    }

    #[test]
    fn test_concurrent_write_read() {
        use std::thread;

        let (mut producer, mut consumer) = SpscRingBuffer::new(1024);

        let num_bytes = 100_000usize;

        let producer_thread = thread::spawn(move || {
            let mut sent = 0usize;
            while sent < num_bytes {
                let byte = (sent % 256) as u8;
                while producer.write(&[byte]) == 0 {
                    thread::yield_now();
                }
                sent += 1;
            }
        });

        let consumer_thread = thread::spawn(move || {
            let mut received = Vec::with_capacity(num_bytes);
            let mut buf = [0u8; 1];
            while received.len() < num_bytes {
                if consumer.read(Some(&mut buf), 1) == 1 {
                    received.push(buf[0]);
                } else {
                    thread::yield_now();
                }
            }
            received
        });

        producer_thread.join().unwrap();
        let received = consumer_thread.join().unwrap();

        assert_eq!(received.len(), num_bytes);
        for (i, &byte) in received.iter().enumerate() {
            assert_eq!(byte, (i % 256) as u8);
        }
    }
}

#[cfg(loom)]
mod loom_tests {
    use loom::thread;

    use super::*;

    #[test]
    fn loom_concurrent_write_read() {
        loom::model(|| {
            let (mut producer, mut consumer) = SpscRingBuffer::new(2);

            let producer_thread = thread::spawn(move || {
                let _ = producer.write(&[1]);
                let _ = producer.write(&[2]);
            });

            let consumer_thread = thread::spawn(move || {
                let mut received = Vec::new();
                let mut buf = [0u8; 1];
                for _ in 0..2 {
                    if consumer.read(Some(&mut buf), 1) == 1 {
                        received.push(buf[0]);
                    }
                }
                received
            });

            producer_thread.join().unwrap();
            let _received = consumer_thread.join().unwrap();
        });
    }

    #[test]
    fn loom_single_byte() {
        loom::model(|| {
            let (mut producer, mut consumer) = SpscRingBuffer::new(1);

            let producer_thread = thread::spawn(move || producer.write(&[42]));

            let consumer_thread = thread::spawn(move || {
                let mut buf = [0u8; 1];
                if consumer.read(Some(&mut buf), 1) == 1 { Some(buf[0]) } else { None }
            });

            let write_result = producer_thread.join().unwrap();
            let read_result = consumer_thread.join().unwrap();

            if write_result == 1 {
                assert!(read_result.is_none() || read_result == Some(42));
            }
        });
    }
}
