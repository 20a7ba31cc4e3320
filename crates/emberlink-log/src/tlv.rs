//! Minimal tag-length-value codec for event records.
//!
//! Event records are anonymous structures of context-tagged primitives.
//! The encoding is deliberately small: a control byte (element kind plus a
//! tagged-flag), an optional one-byte context tag, and a fixed-width
//! little-endian payload for integers or a `u16` length prefix for
//! structures, arrays, and byte strings.
//!
//! ```text
//! element := control [tag] payload
//! control := kind | 0x80 (tagged)
//! payload := intN (LE)  |  len:u16 (LE) bytes[len]
//! ```
//!
//! The writer is generic over a [`TlvSink`] so the same code serializes into
//! a circular ring and into a flat extraction buffer. Structure lengths are
//! back-patched on `end_struct`, which requires sinks to support random
//! access to already-written bytes.

use crate::error::LogError;

/// Element kind codes (low 7 bits of the control byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementKind {
    /// Unsigned integer, 1 byte.
    U8 = 0x01,
    /// Unsigned integer, 2 bytes.
    U16 = 0x02,
    /// Unsigned integer, 4 bytes.
    U32 = 0x03,
    /// Unsigned integer, 8 bytes.
    U64 = 0x04,
    /// Signed integer, 4 bytes, two's complement.
    I32 = 0x05,
    /// Signed integer, 8 bytes, two's complement.
    I64 = 0x06,
    /// Structure: length-prefixed sequence of elements.
    Struct = 0x07,
    /// Array: length-prefixed sequence of anonymous elements.
    Array = 0x08,
    /// Opaque byte string.
    Bytes = 0x09,
}

const TAGGED: u8 = 0x80;

impl ElementKind {
    fn from_control(control: u8) -> Option<Self> {
        match control & !TAGGED {
            0x01 => Some(Self::U8),
            0x02 => Some(Self::U16),
            0x03 => Some(Self::U32),
            0x04 => Some(Self::U64),
            0x05 => Some(Self::I32),
            0x06 => Some(Self::I64),
            0x07 => Some(Self::Struct),
            0x08 => Some(Self::Array),
            0x09 => Some(Self::Bytes),
            _ => None,
        }
    }

    /// Fixed payload width for integer kinds, `None` for length-prefixed
    /// kinds.
    fn fixed_width(self) -> Option<usize> {
        match self {
            Self::U8 => Some(1),
            Self::U16 => Some(2),
            Self::U32 | Self::I32 => Some(4),
            Self::U64 | Self::I64 => Some(8),
            Self::Struct | Self::Array | Self::Bytes => None,
        }
    }
}

// Sinks

/// Byte sink for the TLV writer.
///
/// `patch` must accept any position previously covered by `write`; it is
/// used to back-fill structure lengths.
pub trait TlvSink {
    /// Append bytes. Fails with [`LogError::NoMemory`] when the sink is out
    /// of space; the caller is responsible for rolling back to a checkpoint.
    fn write(&mut self, bytes: &[u8]) -> Result<(), LogError>;

    /// Overwrite previously written bytes at `position` (relative to the
    /// first byte this sink ever accepted).
    fn patch(&mut self, position: usize, bytes: &[u8]);

    /// Number of bytes accepted so far.
    fn position(&self) -> usize;
}

/// A [`TlvSink`] over a flat byte slice, used for event extraction.
#[derive(Debug)]
pub struct SliceSink<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceSink<'a> {
    /// Creates a sink writing from the start of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Rolls the sink back to an earlier position.
    pub fn truncate(&mut self, position: usize) {
        debug_assert!(position <= self.pos);
        self.pos = position;
    }
}

impl TlvSink for SliceSink<'_> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LogError> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(LogError::NoMemory);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn patch(&mut self, position: usize, bytes: &[u8]) {
        self.buf[position..position + bytes.len()].copy_from_slice(bytes);
    }

    fn position(&self) -> usize {
        self.pos
    }
}

// Sources

/// Byte source for the TLV reader, addressed by logical offset.
pub trait TlvSource {
    /// Copies `out.len()` bytes starting at logical offset `offset`.
    fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), LogError>;

    /// Total number of readable bytes.
    fn len(&self) -> usize;

    /// True when the source holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TlvSource for &[u8] {
    fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), LogError> {
        let end = offset + out.len();
        if end > self.len() {
            return Err(LogError::MalformedRecord);
        }
        out.copy_from_slice(&self[offset..end]);
        Ok(())
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

// Writer

/// Handle returned by `begin_struct`/`begin_array`, consumed by the
/// matching `end_*` call.
#[derive(Debug)]
#[must_use]
pub struct ContainerHandle {
    len_position: usize,
}

/// TLV writer over a generic sink.
#[derive(Debug)]
pub struct TlvWriter<S> {
    sink: S,
}

impl<S: TlvSink> TlvWriter<S> {
    /// Wraps a sink.
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// Current write position, usable as a rollback checkpoint by sinks
    /// that support truncation.
    pub fn position(&self) -> usize {
        self.sink.position()
    }

    /// Consumes the writer, returning the sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Mutable access to the underlying sink.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    fn control(&mut self, kind: ElementKind, tag: Option<u8>) -> Result<(), LogError> {
        match tag {
            Some(t) => self.sink.write(&[kind as u8 | TAGGED, t]),
            None => self.sink.write(&[kind as u8]),
        }
    }

    /// Writes an unsigned 8-bit element.
    pub fn put_u8(&mut self, tag: Option<u8>, value: u8) -> Result<(), LogError> {
        self.control(ElementKind::U8, tag)?;
        self.sink.write(&[value])
    }

    /// Writes an unsigned 16-bit element.
    pub fn put_u16(&mut self, tag: Option<u8>, value: u16) -> Result<(), LogError> {
        self.control(ElementKind::U16, tag)?;
        self.sink.write(&value.to_le_bytes())
    }

    /// Writes an unsigned 32-bit element.
    pub fn put_u32(&mut self, tag: Option<u8>, value: u32) -> Result<(), LogError> {
        self.control(ElementKind::U32, tag)?;
        self.sink.write(&value.to_le_bytes())
    }

    /// Writes an unsigned 64-bit element.
    pub fn put_u64(&mut self, tag: Option<u8>, value: u64) -> Result<(), LogError> {
        self.control(ElementKind::U64, tag)?;
        self.sink.write(&value.to_le_bytes())
    }

    /// Writes a signed 32-bit element.
    pub fn put_i32(&mut self, tag: Option<u8>, value: i32) -> Result<(), LogError> {
        self.control(ElementKind::I32, tag)?;
        self.sink.write(&value.to_le_bytes())
    }

    /// Writes a signed 64-bit element.
    pub fn put_i64(&mut self, tag: Option<u8>, value: i64) -> Result<(), LogError> {
        self.control(ElementKind::I64, tag)?;
        self.sink.write(&value.to_le_bytes())
    }

    /// Writes an opaque byte-string element.
    pub fn put_bytes(&mut self, tag: Option<u8>, value: &[u8]) -> Result<(), LogError> {
        if value.len() > usize::from(u16::MAX) {
            return Err(LogError::InvalidArgument);
        }
        self.control(ElementKind::Bytes, tag)?;
        self.sink.write(&(value.len() as u16).to_le_bytes())?;
        self.sink.write(value)
    }

    /// Opens a structure element. The length is back-patched by
    /// [`TlvWriter::end_container`].
    pub fn begin_struct(&mut self, tag: Option<u8>) -> Result<ContainerHandle, LogError> {
        self.begin_container(ElementKind::Struct, tag)
    }

    /// Opens an array element.
    pub fn begin_array(&mut self, tag: Option<u8>) -> Result<ContainerHandle, LogError> {
        self.begin_container(ElementKind::Array, tag)
    }

    fn begin_container(
        &mut self,
        kind: ElementKind,
        tag: Option<u8>,
    ) -> Result<ContainerHandle, LogError> {
        self.control(kind, tag)?;
        let len_position = self.sink.position();
        self.sink.write(&[0u8, 0u8])?;
        Ok(ContainerHandle { len_position })
    }

    /// Closes a structure or array, back-patching its length.
    pub fn end_container(&mut self, handle: ContainerHandle) -> Result<(), LogError> {
        let body = self.sink.position() - handle.len_position - 2;
        if body > usize::from(u16::MAX) {
            return Err(LogError::InvalidArgument);
        }
        self.sink.patch(handle.len_position, &(body as u16).to_le_bytes());
        Ok(())
    }

    /// Copies a whole element verbatim from a source.
    pub fn copy_element<R: TlvSource>(
        &mut self,
        source: &R,
        element: &Element,
    ) -> Result<(), LogError> {
        let mut chunk = [0u8; 32];
        let mut copied = 0;
        while copied < element.total_len {
            let n = chunk.len().min(element.total_len - copied);
            source.read_at(element.start + copied, &mut chunk[..n])?;
            self.sink.write(&chunk[..n])?;
            copied += n;
        }
        Ok(())
    }
}

// Reader

/// A decoded element boundary: offsets into the source, not the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    /// Element kind.
    pub kind: ElementKind,
    /// Context tag, if the element carries one.
    pub tag: Option<u8>,
    /// Offset of the control byte.
    pub start: usize,
    /// Offset of the first payload byte.
    pub payload: usize,
    /// Payload length in bytes.
    pub payload_len: usize,
    /// Total encoded length, header included.
    pub total_len: usize,
}

/// TLV reader over a generic source.
///
/// The reader walks elements between `pos` and `limit`; entering a
/// container yields a sub-reader bounded to the container body.
#[derive(Debug, Clone)]
pub struct TlvReader<'a, R> {
    source: &'a R,
    pos: usize,
    limit: usize,
}

impl<'a, R: TlvSource> TlvReader<'a, R> {
    /// Creates a reader over the whole source.
    pub fn new(source: &'a R) -> Self {
        let limit = source.len();
        Self { source, pos: 0, limit }
    }

    /// Creates a reader over `[pos, limit)`.
    pub fn bounded(source: &'a R, pos: usize, limit: usize) -> Self {
        Self { source, pos, limit }
    }

    /// Current read offset.
    pub fn offset(&self) -> usize {
        self.pos
    }

    fn byte_at(&self, off: usize) -> Result<u8, LogError> {
        let mut b = [0u8];
        self.source.read_at(off, &mut b)?;
        Ok(b[0])
    }

    /// Decodes the element at the current offset and advances past it.
    ///
    /// Returns `Ok(None)` at the end of the bounded region.
    pub fn next_element(&mut self) -> Result<Option<Element>, LogError> {
        if self.pos >= self.limit {
            return Ok(None);
        }
        let element = self.decode_at(self.pos)?;
        if element.start + element.total_len > self.limit {
            return Err(LogError::MalformedRecord);
        }
        self.pos = element.start + element.total_len;
        Ok(Some(element))
    }

    fn decode_at(&self, start: usize) -> Result<Element, LogError> {
        let control = self.byte_at(start)?;
        let kind = ElementKind::from_control(control).ok_or(LogError::MalformedRecord)?;
        let tagged = control & TAGGED != 0;
        let mut header = 1;
        let tag = if tagged {
            let t = self.byte_at(start + 1)?;
            header += 1;
            Some(t)
        } else {
            None
        };
        let (payload, payload_len) = match kind.fixed_width() {
            Some(w) => (start + header, w),
            None => {
                let mut len = [0u8; 2];
                self.source.read_at(start + header, &mut len)?;
                header += 2;
                (start + header, usize::from(u16::from_le_bytes(len)))
            }
        };
        Ok(Element {
            kind,
            tag,
            start,
            payload,
            payload_len,
            total_len: header + payload_len,
        })
    }

    /// Reads an unsigned integer element of any width.
    pub fn read_uint(&self, element: &Element) -> Result<u64, LogError> {
        let mut buf = [0u8; 8];
        match element.kind {
            ElementKind::U8 | ElementKind::U16 | ElementKind::U32 | ElementKind::U64 => {
                self.source
                    .read_at(element.payload, &mut buf[..element.payload_len])?;
                Ok(u64::from_le_bytes(buf))
            }
            _ => Err(LogError::MalformedRecord),
        }
    }

    /// Reads a signed integer element.
    pub fn read_int(&self, element: &Element) -> Result<i64, LogError> {
        let mut buf = [0u8; 8];
        match element.kind {
            ElementKind::I32 => {
                self.source.read_at(element.payload, &mut buf[..4])?;
                let mut b4 = [0u8; 4];
                b4.copy_from_slice(&buf[..4]);
                Ok(i64::from(i32::from_le_bytes(b4)))
            }
            ElementKind::I64 => {
                self.source.read_at(element.payload, &mut buf)?;
                Ok(i64::from_le_bytes(buf))
            }
            _ => Err(LogError::MalformedRecord),
        }
    }

    /// Returns a sub-reader over a container's body.
    pub fn enter_container(&self, element: &Element) -> Result<TlvReader<'a, R>, LogError> {
        match element.kind {
            ElementKind::Struct | ElementKind::Array => Ok(TlvReader::bounded(
                self.source,
                element.payload,
                element.payload + element.payload_len,
            )),
            _ => Err(LogError::MalformedRecord),
        }
    }

    /// Copies the payload of a byte-string element into `out`, returning
    /// the number of bytes copied.
    pub fn read_bytes(&self, element: &Element, out: &mut [u8]) -> Result<usize, LogError> {
        if element.kind != ElementKind::Bytes {
            return Err(LogError::MalformedRecord);
        }
        let n = element.payload_len.min(out.len());
        self.source.read_at(element.payload, &mut out[..n])?;
        Ok(n)
    }
}
