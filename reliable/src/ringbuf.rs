//! Single-producer single-consumer byte FIFO.
//!
//! One slot is always kept empty so that `head == tail` means empty and
//! `head + 1 == tail` (mod size) means full - usable capacity is `size - 1`.
//! All operations run inside an internal critical section, so one producer
//! thread and one consumer thread may call into the buffer concurrently.

use protocol::error::CommError;
use protocol::limits::Limits;
use std::sync::Mutex;

pub struct RingBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Inner {
    fn size(&self) -> usize {
        self.buf.len()
    }

    fn available(&self) -> usize {
        (self.head + self.size() - self.tail) % self.size()
    }

    fn free_space(&self) -> usize {
        self.size() - 1 - self.available()
    }
}

impl RingBuffer {
    /// A buffer holding up to `size - 1` bytes. Zero-sized buffers are
    /// rejected.
    pub fn new(size: usize) -> Result<RingBuffer, CommError> {
        if size == 0 {
            return Err(CommError::Invalid);
        }
        Ok(RingBuffer {
            inner: Mutex::new(Inner {
                buf: vec![0u8; size].into_boxed_slice(),
                head: 0,
                tail: 0,
            }),
        })
    }

    /// A buffer of the standard default size.
    pub fn with_default_size() -> RingBuffer {
        RingBuffer::new(Limits::STANDARD.ringbuf_size)
            .expect("the standard ring size is non-zero")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned lock means a panic inside one of these short critical
        // sections, which never leaves the indices inconsistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends one byte; `false` when full.
    pub fn put(&self, byte: u8) -> bool {
        let mut inner = self.lock();
        let next_head = (inner.head + 1) % inner.size();
        if next_head == inner.tail {
            return false;
        }
        let head = inner.head;
        inner.buf[head] = byte;
        inner.head = next_head;
        true
    }

    /// Removes and returns the oldest byte; `None` when empty.
    pub fn get(&self) -> Option<u8> {
        let mut inner = self.lock();
        if inner.head == inner.tail {
            return None;
        }
        let byte = inner.buf[inner.tail];
        inner.tail = (inner.tail + 1) % inner.size();
        Some(byte)
    }

    /// Appends as many bytes of `src` as fit, returning how many were
    /// written.
    pub fn write(&self, src: &[u8]) -> usize {
        let mut inner = self.lock();
        let to_write = src.len().min(inner.free_space());
        if to_write == 0 {
            return 0;
        }

        let size = inner.size();
        let head = inner.head;
        let until_end = size - head;
        if to_write <= until_end {
            inner.buf[head..head + to_write].copy_from_slice(&src[..to_write]);
        } else {
            inner.buf[head..].copy_from_slice(&src[..until_end]);
            inner.buf[..to_write - until_end].copy_from_slice(&src[until_end..to_write]);
        }
        inner.head = (head + to_write) % size;
        to_write
    }

    /// Removes up to `dst.len()` bytes into `dst`, returning how many were
    /// read.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut inner = self.lock();
        let to_read = Self::copy_out(&inner, dst);
        inner.tail = (inner.tail + to_read) % inner.size();
        to_read
    }

    /// Like [`RingBuffer::read`] but without consuming the bytes.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let inner = self.lock();
        Self::copy_out(&inner, dst)
    }

    fn copy_out(inner: &Inner, dst: &mut [u8]) -> usize {
        let to_read = dst.len().min(inner.available());
        if to_read == 0 {
            return 0;
        }

        let size = inner.size();
        let tail = inner.tail;
        let until_end = size - tail;
        if to_read <= until_end {
            dst[..to_read].copy_from_slice(&inner.buf[tail..tail + to_read]);
        } else {
            dst[..until_end].copy_from_slice(&inner.buf[tail..]);
            dst[until_end..to_read].copy_from_slice(&inner.buf[..to_read - until_end]);
        }
        to_read
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.head = 0;
        inner.tail = 0;
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.head == inner.tail
    }

    pub fn is_full(&self) -> bool {
        let inner = self.lock();
        (inner.head + 1) % inner.size() == inner.tail
    }

    /// Bytes currently readable.
    pub fn available(&self) -> usize {
        self.lock().available()
    }

    /// Bytes currently writable (`size - 1 - available`).
    pub fn free_space(&self) -> usize {
        self.lock().free_space()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;

    #[test]
    fn test_zero_size_is_rejected() {
        assert!(RingBuffer::new(0).is_err());
    }

    #[test]
    fn test_default_size() {
        let rb = RingBuffer::with_default_size();
        assert_eq!(rb.free_space(), Limits::STANDARD.ringbuf_size - 1);
    }

    /// Scenario: a 16-byte buffer accepts exactly 15 bytes, rejects the
    /// 16th, and hands the bytes back in order.
    #[test]
    fn test_byte_capacity_and_order() {
        let rb = RingBuffer::new(16).unwrap();
        for byte in 0..15u8 {
            assert!(rb.put(byte), "byte {byte} should fit");
        }
        assert!(rb.is_full());
        assert!(!rb.put(0xFF));

        for expected in 0..15u8 {
            assert_eq!(rb.get(), Some(expected));
        }
        assert!(rb.is_empty());
        assert_eq!(rb.get(), None);
    }

    #[rstest]
    #[case::small(2)]
    #[case::typical(64)]
    #[case::default_size(2048)]
    fn test_accounting_invariant(#[case] size: usize) {
        let rb = RingBuffer::new(size).unwrap();
        assert_eq!(rb.available() + rb.free_space(), size - 1);

        let written = rb.write(&vec![7u8; size / 2 + 1]);
        assert_eq!(rb.available(), written);
        assert_eq!(rb.available() + rb.free_space(), size - 1);
    }

    #[test]
    fn test_bulk_write_is_bounded_by_free_space() {
        let rb = RingBuffer::new(8).unwrap();
        assert_eq!(rb.write(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]), 7);
        assert_eq!(rb.write(&[11]), 0);

        let mut out = [0u8; 16];
        assert_eq!(rb.read(&mut out), 7);
        assert_eq!(&out[..7], &[1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_wrapping_write_and_read() {
        let rb = RingBuffer::new(8).unwrap();

        // shift the indices away from zero, then wrap
        assert_eq!(rb.write(&[0xAA; 5]), 5);
        let mut sink = [0u8; 5];
        assert_eq!(rb.read(&mut sink), 5);

        let data = [1, 2, 3, 4, 5, 6];
        assert_eq!(rb.write(&data), 6);

        let mut out = [0u8; 6];
        assert_eq!(rb.read(&mut out), 6);
        assert_eq!(out, data);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let rb = RingBuffer::new(16).unwrap();
        rb.write(b"abcdef");

        let mut out = [0u8; 4];
        assert_eq!(rb.peek(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(rb.available(), 6);

        let mut all = [0u8; 6];
        assert_eq!(rb.read(&mut all), 6);
        assert_eq!(&all, b"abcdef");
    }

    #[test]
    fn test_clear() {
        let rb = RingBuffer::new(16).unwrap();
        rb.write(b"data");
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.available(), 0);
        assert_eq!(rb.free_space(), 15);
    }

    /// Property: with one producer and one consumer running concurrently,
    /// bytes are neither lost nor reordered.
    #[test]
    fn test_concurrent_producer_consumer() {
        const TOTAL: usize = 64 * 1024;
        let rb = Arc::new(RingBuffer::new(64).unwrap());

        let producer = {
            let rb = rb.clone();
            std::thread::spawn(move || {
                let mut next: usize = 0;
                while next < TOTAL {
                    if rb.put(next as u8) {
                        next += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let consumer = {
            let rb = rb.clone();
            std::thread::spawn(move || {
                let mut expected: usize = 0;
                while expected < TOTAL {
                    match rb.get() {
                        Some(byte) => {
                            assert_eq!(byte, expected as u8, "byte {expected} out of order");
                            expected += 1;
                        }
                        None => std::thread::yield_now(),
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert!(rb.is_empty());
    }
}
