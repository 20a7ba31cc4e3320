//! Circular byte buffer backing one event ring.
//!
//! Bytes are appended at the tail and reclaimed from the head on whole
//! element boundaries. Capacity is fixed at construction; the buffer never
//! reallocates. Records may wrap across the physical end of the region —
//! all addressing below is in logical offsets from the head, and the
//! physical split is invisible to the TLV layer.
//!
//! Rollback works by cursor snapshot: a [`RingCheckpoint`] captures head
//! and length, and restoring it discards everything appended since. Bytes
//! past the tail are never read, so restore is byte-identical for the live
//! region.

use crate::error::LogError;
use crate::tlv::{TlvSink, TlvSource};

/// Cursor snapshot for rollback of partial writes.
#[derive(Debug, Clone, Copy)]
pub struct RingCheckpoint {
    head: usize,
    len: usize,
}

/// Fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct CircularTlvBuffer {
    data: Box<[u8]>,
    head: usize,
    len: usize,
}

impl CircularTlvBuffer {
    /// Allocates a buffer of `capacity` bytes. All allocation happens here;
    /// steady-state operation never touches the heap.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be > 0");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    /// Total byte capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently in use.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no bytes are stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes available for appending.
    #[inline]
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Captures the current cursor state.
    pub fn checkpoint(&self) -> RingCheckpoint {
        RingCheckpoint {
            head: self.head,
            len: self.len,
        }
    }

    /// Restores a previously captured cursor state.
    ///
    /// Only valid when the head has not moved since the checkpoint, i.e.
    /// within a single write attempt.
    pub fn restore(&mut self, checkpoint: RingCheckpoint) {
        debug_assert_eq!(self.head, checkpoint.head);
        self.head = checkpoint.head;
        self.len = checkpoint.len;
    }

    #[inline]
    fn physical(&self, logical: usize) -> usize {
        let cap = self.capacity();
        let mut p = self.head + logical;
        if p >= cap {
            p -= cap;
        }
        p
    }

    /// Appends bytes at the tail.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), LogError> {
        if bytes.len() > self.free() {
            return Err(LogError::NoMemory);
        }
        let cap = self.capacity();
        let mut at = self.physical(self.len);
        for &b in bytes {
            self.data[at] = b;
            at += 1;
            if at == cap {
                at = 0;
            }
        }
        self.len += bytes.len();
        Ok(())
    }

    /// Overwrites bytes at a logical offset within the live region.
    pub fn patch(&mut self, logical: usize, bytes: &[u8]) {
        debug_assert!(logical + bytes.len() <= self.len);
        let cap = self.capacity();
        let mut at = self.physical(logical);
        for &b in bytes {
            self.data[at] = b;
            at += 1;
            if at == cap {
                at = 0;
            }
        }
    }

    /// Copies bytes from a logical offset within the live region.
    pub fn read_at(&self, logical: usize, out: &mut [u8]) -> Result<(), LogError> {
        if logical + out.len() > self.len {
            return Err(LogError::MalformedRecord);
        }
        let cap = self.capacity();
        let mut at = self.physical(logical);
        for slot in out.iter_mut() {
            *slot = self.data[at];
            at += 1;
            if at == cap {
                at = 0;
            }
        }
        Ok(())
    }

    /// Reclaims `n` bytes from the head.
    pub fn advance_head(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.head = self.physical(n);
        self.len -= n;
    }
}

/// [`TlvSink`] appending into a ring.
///
/// Positions are relative to the sink's creation point, so a writer built
/// on a partially full ring patches the right bytes.
#[derive(Debug)]
pub struct RingSink<'a> {
    ring: &'a mut CircularTlvBuffer,
    base: usize,
    written: usize,
}

impl<'a> RingSink<'a> {
    /// Creates a sink appending at the ring's current tail.
    pub fn new(ring: &'a mut CircularTlvBuffer) -> Self {
        let base = ring.len();
        Self {
            ring,
            base,
            written: 0,
        }
    }
}

impl TlvSink for RingSink<'_> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LogError> {
        self.ring.push(bytes)?;
        self.written += bytes.len();
        Ok(())
    }

    fn patch(&mut self, position: usize, bytes: &[u8]) {
        self.ring.patch(self.base + position, bytes);
    }

    fn position(&self) -> usize {
        self.written
    }
}

/// [`TlvSource`] reading a ring's live region from the head.
#[derive(Debug, Clone, Copy)]
pub struct RingSource<'a> {
    ring: &'a CircularTlvBuffer,
}

impl<'a> RingSource<'a> {
    /// Wraps a ring for reading.
    pub fn new(ring: &'a CircularTlvBuffer) -> Self {
        Self { ring }
    }
}

impl TlvSource for RingSource<'_> {
    fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), LogError> {
        self.ring.read_at(offset, out)
    }

    fn len(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::{TlvReader, TlvWriter};

    #[test]
    fn test_push_and_read() {
        let mut ring = CircularTlvBuffer::new(16);
        ring.push(&[1, 2, 3, 4]).unwrap();
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.free(), 12);

        let mut out = [0u8; 4];
        ring.read_at(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_wraparound() {
        let mut ring = CircularTlvBuffer::new(8);
        ring.push(&[1, 2, 3, 4, 5, 6]).unwrap();
        ring.advance_head(4);
        // tail now wraps past the physical end
        ring.push(&[7, 8, 9, 10]).unwrap();
        assert_eq!(ring.len(), 6);

        let mut out = [0u8; 6];
        ring.read_at(0, &mut out).unwrap();
        assert_eq!(out, [5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_push_full() {
        let mut ring = CircularTlvBuffer::new(4);
        ring.push(&[1, 2, 3]).unwrap();
        assert_eq!(ring.push(&[4, 5]), Err(LogError::NoMemory));
        // original contents untouched
        let mut out = [0u8; 3];
        ring.read_at(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_checkpoint_restore() {
        let mut ring = CircularTlvBuffer::new(16);
        ring.push(&[1, 2]).unwrap();
        let cp = ring.checkpoint();
        ring.push(&[3, 4, 5]).unwrap();
        ring.restore(cp);
        assert_eq!(ring.len(), 2);
        let mut out = [0u8; 2];
        ring.read_at(0, &mut out).unwrap();
        assert_eq!(out, [1, 2]);
    }

    #[test]
    fn test_tlv_element_across_wrap() {
        let mut ring = CircularTlvBuffer::new(16);
        // burn and reclaim bytes so the next element wraps
        ring.push(&[0u8; 12]).unwrap();
        ring.advance_head(12);

        let mut writer = TlvWriter::new(RingSink::new(&mut ring));
        writer.put_u64(Some(5), 0x0102_0304_0506_0708).unwrap();

        let source = RingSource::new(&ring);
        let mut reader = TlvReader::new(&source);
        let e = reader.next_element().unwrap().unwrap();
        assert_eq!(e.tag, Some(5));
        assert_eq!(reader.read_uint(&e).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_patch_through_sink() {
        let mut ring = CircularTlvBuffer::new(32);
        let mut writer = TlvWriter::new(RingSink::new(&mut ring));
        let h = writer.begin_struct(None).unwrap();
        writer.put_u16(Some(1), 7).unwrap();
        writer.end_container(h).unwrap();

        let source = RingSource::new(&ring);
        let mut reader = TlvReader::new(&source);
        let outer = reader.next_element().unwrap().unwrap();
        assert_eq!(outer.payload_len, 4); // control + tag + u16
    }
}
