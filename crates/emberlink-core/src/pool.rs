//! Fixed pool of small message buffers.
//!
//! Alarm payloads are tiny (a v2 alarm tops out at 19 bytes) but sessions
//! retain them across Trickle retransmissions, so the engine keeps its own
//! pool of small fixed-size buffers instead of leaning on transport-sized
//! packet buffers. Exhaustion is a hard drop: callers treat `None` from
//! [`MsgBufferPool::acquire`] as out-of-memory.

use arrayvec::ArrayVec;

use crate::config::MAX_INCOMING_ALARM_SIZE;

/// Upper bound on the configurable session pool, fixing the buffer pool's
/// compile-time capacity at `MAX_POOL_SESSIONS + 1`.
pub const MAX_POOL_SESSIONS: usize = 16;

const POOL_CAPACITY: usize = MAX_POOL_SESSIONS + 1;

/// One pooled message buffer, capped at the incoming-alarm size limit.
#[derive(Debug, Clone)]
pub struct MsgBuffer {
    data: [u8; MAX_INCOMING_ALARM_SIZE],
    len: usize,
}

impl MsgBuffer {
    fn new() -> Self {
        Self {
            data: [0u8; MAX_INCOMING_ALARM_SIZE],
            len: 0,
        }
    }

    /// Stored payload bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Writable backing storage; pair with [`MsgBuffer::set_len`].
    #[inline]
    pub fn as_mut_storage(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Sets the payload length after an in-place write.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the buffer capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= MAX_INCOMING_ALARM_SIZE);
        self.len = len;
    }

    /// Replaces the payload with a copy of `bytes`.
    ///
    /// Returns `false` (leaving the buffer unchanged) when `bytes` exceeds
    /// capacity.
    pub fn fill_from(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > MAX_INCOMING_ALARM_SIZE {
            return false;
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        true
    }

    /// Clears the payload for reuse.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Fixed-size pool of message buffers, pre-populated at construction.
#[derive(Debug)]
pub struct MsgBufferPool {
    free: ArrayVec<MsgBuffer, POOL_CAPACITY>,
}

impl MsgBufferPool {
    /// Pool holding `count` buffers, clamped to the compile-time cap.
    pub fn new(count: usize) -> Self {
        let mut free = ArrayVec::new();
        for _ in 0..count.min(POOL_CAPACITY) {
            free.push(MsgBuffer::new());
        }
        Self { free }
    }

    /// Takes a buffer from the pool. `None` means the pool is exhausted
    /// and the caller must drop its work.
    #[inline]
    pub fn acquire(&mut self) -> Option<MsgBuffer> {
        self.free.pop()
    }

    /// Returns a buffer to the pool.
    #[inline]
    pub fn release(&mut self, mut buffer: MsgBuffer) {
        buffer.clear();
        let _ = self.free.try_push(buffer);
    }

    /// Buffers currently available.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = MsgBufferPool::new(2);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        pool.release(a);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn test_fill_from_respects_cap() {
        let mut buffer = MsgBuffer::new();
        assert!(buffer.fill_from(&[1, 2, 3]));
        assert_eq!(buffer.as_slice(), &[1, 2, 3]);
        assert!(!buffer.fill_from(&[0u8; MAX_INCOMING_ALARM_SIZE + 1]));
        // unchanged after the rejected write
        assert_eq!(buffer.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_release_clears() {
        let mut pool = MsgBufferPool::new(1);
        let mut buffer = pool.acquire().unwrap();
        buffer.fill_from(&[9, 9]);
        pool.release(buffer);
        let buffer = pool.acquire().unwrap();
        assert!(buffer.as_slice().is_empty());
    }
}
