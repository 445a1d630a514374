//! Fixed-size packet buffer pool.
//!
//! All buffers are allocated once at construction. `acquire` moves a
//! buffer out of the idle list and `release` moves it back, so a buffer
//! has exactly one owner at any time (I/O source, in-flight relay, or
//! the idle list) and is never reallocated. Exhaustion is a recoverable
//! error value, never a panic: callers drop the frame and log.

use parking_lot::Mutex;
use thiserror::Error;

/// Returned by [`PacketPool::acquire`] when the idle list is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("packet pool exhausted")]
pub struct PoolExhausted;

/// A fixed-capacity frame buffer drawn from a [`PacketPool`].
#[derive(Debug)]
pub struct PacketBuffer {
    data: Vec<u8>,
    len: usize,
}

impl PacketBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The valid frame bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole backing storage, for reads directly into the buffer.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Records how many bytes of the storage hold valid frame data.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.len = len.min(self.data.len());
    }

    /// Copies a frame into the buffer; returns `false` if it does not fit.
    pub fn fill(&mut self, frame: &[u8]) -> bool {
        if frame.len() > self.data.len() {
            return false;
        }
        self.data[..frame.len()].copy_from_slice(frame);
        self.len = frame.len();
        true
    }

    fn clear(&mut self) {
        self.len = 0;
    }
}

/// Bounded arena of [`PacketBuffer`]s with acquire/release semantics.
pub struct PacketPool {
    idle: Mutex<Vec<PacketBuffer>>,
    capacity: usize,
    buffer_size: usize,
}

impl PacketPool {
    /// Allocates `capacity` buffers of `buffer_size` bytes each, up front.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let idle = (0..capacity)
            .map(|_| PacketBuffer::with_capacity(buffer_size))
            .collect();
        Self {
            idle: Mutex::new(idle),
            capacity,
            buffer_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently in the idle list.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Moves a buffer out of the idle list, if any remains.
    pub fn acquire(&self) -> Result<PacketBuffer, PoolExhausted> {
        self.idle.lock().pop().ok_or(PoolExhausted)
    }

    /// Clears a buffer and returns it to the idle list.
    pub fn release(&self, mut buffer: PacketBuffer) {
        buffer.clear();
        self.idle.lock().push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_acquire_past_capacity_is_exhausted() {
        let pool = PacketPool::new(256, 64);
        let mut held = Vec::new();
        for _ in 0..256 {
            held.push(pool.acquire().unwrap());
        }
        assert_eq!(pool.acquire().unwrap_err(), PoolExhausted);
    }

    #[test]
    fn test_release_makes_buffer_reusable() {
        let pool = PacketPool::new(1, 64);
        let mut buf = pool.acquire().unwrap();
        assert!(buf.fill(&[1, 2, 3]));
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
        assert!(pool.acquire().is_err());

        pool.release(buf);
        let buf = pool.acquire().unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_conservation_across_acquire_release() {
        let pool = PacketPool::new(8, 32);
        let mut in_flight = Vec::new();
        for round in 0..4 {
            for _ in 0..(round + 2) {
                if let Ok(b) = pool.acquire() {
                    in_flight.push(b);
                }
            }
            assert_eq!(pool.idle_count() + in_flight.len(), 8);
            for b in in_flight.drain(..) {
                pool.release(b);
            }
            assert_eq!(pool.idle_count(), 8);
        }
    }

    #[test]
    fn test_fill_rejects_oversized_frame() {
        let pool = PacketPool::new(1, 4);
        let mut buf = pool.acquire().unwrap();
        assert!(!buf.fill(&[0; 8]));
        assert!(buf.is_empty());
    }
}
