use anyhow::bail;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// Self-expanding byte ring buffer feeding the link session's delimiter scan.
///
/// Capacity is always a power of two so cursor arithmetic is a mask, never a
///  division. Writes never fail: when a pending write would push occupancy past
///  80% of capacity, the capacity doubles first. The single internal lock is
///  the growth guard - there is one writer (the receiver path) and one blocking
///  reader context, and neither can observe a half-grown buffer.
pub struct ByteRing {
    inner: Mutex<RingInner>,
    readable: Notify,
}

struct RingInner {
    buf: Vec<u8>,
    mask: usize,
    read_idx: usize,
    write_idx: usize,
    load: usize,
}

impl RingInner {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.write_idx] = byte;
        self.write_idx = (self.write_idx + 1) & self.mask;
        self.load += 1;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.load == 0 {
            return None;
        }
        let byte = self.buf[self.read_idx];
        self.read_idx = (self.read_idx + 1) & self.mask;
        self.load -= 1;
        Some(byte)
    }

    /// true if `additional` more bytes would fill the buffer to 80% of capacity or beyond
    fn would_exceed_threshold(&self, additional: usize) -> bool {
        (self.load + additional) * 5 >= self.capacity() * 4
    }

    /// Double the capacity, laying the content out contiguously from index zero.
    fn grow(&mut self) {
        let new_capacity = 2 * self.capacity();
        debug!("expanding receive ring from {} to {} bytes", self.capacity(), new_capacity);

        let mut new_buf = vec![0u8; new_capacity];
        for offset in 0..self.load {
            new_buf[offset] = self.buf[(self.read_idx + offset) & self.mask];
        }
        self.buf = new_buf;
        self.mask = new_capacity - 1;
        self.read_idx = 0;
        self.write_idx = self.load;
    }
}

impl ByteRing {
    /// Fails fast if the requested capacity is not a power of two.
    pub fn with_capacity(capacity: usize) -> anyhow::Result<ByteRing> {
        if capacity == 0 || !capacity.is_power_of_two() {
            bail!("ring buffer capacity must be a power of two, was {}", capacity);
        }
        Ok(ByteRing {
            inner: Mutex::new(RingInner {
                buf: vec![0u8; capacity],
                mask: capacity - 1,
                read_idx: 0,
                write_idx: 0,
                load: 0,
            }),
            readable: Notify::new(),
        })
    }

    /// Append bytes, growing as necessary. Never fails - unbounded growth is the
    ///  safety valve for unbounded backlog.
    pub async fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().await;
        while inner.would_exceed_threshold(bytes.len()) {
            inner.grow();
        }
        for &byte in bytes {
            inner.push(byte);
        }
        drop(inner);

        if !bytes.is_empty() {
            self.readable.notify_waiters();
        }
    }

    /// Take the next byte, suspending until one is available.
    pub async fn read_one(&self) -> u8 {
        loop {
            let readable = self.readable.notified();
            if let Some(byte) = self.inner.lock().await.pop() {
                return byte;
            }
            readable.await;
        }
    }

    /// Consume bytes up to and including the next `delimiter`, suspending until
    ///  one is buffered. With `skip_leading_match` set, a delimiter in the very
    ///  first position is consumed but not treated as terminal - the case of a
    ///  stray delimiter opening a new frame.
    pub async fn read_until(&self, delimiter: u8, skip_leading_match: bool) -> Vec<u8> {
        let mut span = Vec::new();
        loop {
            let byte = self.read_one().await;
            span.push(byte);
            if byte == delimiter && !(skip_leading_match && span.len() == 1) {
                return span;
            }
        }
    }

    /// Discard all buffered content and reset the cursors.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.read_idx = 0;
        inner.write_idx = 0;
        inner.load = 0;
    }

    pub async fn load(&self) -> usize {
        self.inner.lock().await.load
    }

    pub async fn capacity(&self) -> usize {
        self.inner.lock().await.capacity()
    }
}
