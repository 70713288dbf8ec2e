use super::error::BufferError;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Backing bytes of one half. Either allocated here or borrowed from the
/// driver, which keeps the memory valid until its buffers are disposed.
///
/// Bytes are accessed as relaxed atomics, so concurrent handles never race.
/// Ordering between periods comes from the ring buffer lock or from the
/// driver's half-buffer protocol.
#[derive(Debug)]
enum HalfRegion {
    Owned(Box<[AtomicU8]>),
    Borrowed { ptr: NonNull<AtomicU8>, len: usize },
}

// Borrowed bytes are only touched through `AtomicU8`, and `from_raw` requires
// them to stay valid while any handle exists.
unsafe impl Send for HalfRegion {}
unsafe impl Sync for HalfRegion {}

impl HalfRegion {
    fn bytes(&self) -> &[AtomicU8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Borrowed { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
        }
    }
}

/// Shared handle to a window of one half-buffer region.
#[derive(Debug, Clone)]
pub struct HalfBuffer {
    region: Arc<HalfRegion>,
    start: usize,
    len: usize,
}

impl HalfBuffer {
    pub fn zeroed(len: usize) -> Self {
        let bytes: Box<[AtomicU8]> = (0..len).map(|_| AtomicU8::new(0)).collect();
        Self {
            region: Arc::new(HalfRegion::Owned(bytes)),
            start: 0,
            len,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let half = Self::zeroed(bytes.len());
        half.write_at(0, bytes);
        half
    }

    /// Wraps driver memory without taking ownership.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// any clone of the returned handle is used, and must only be written
    /// outside Rust by the driver.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            region: Arc::new(HalfRegion::Borrowed {
                ptr: ptr.cast::<AtomicU8>(),
                len,
            }),
            start: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A sub-window sharing the same storage. The range is clamped to this
    /// window.
    pub fn window(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.len);
        let start = range.start.min(end);
        Self {
            region: self.region.clone(),
            start: self.start + start,
            len: end - start,
        }
    }

    pub fn shares_storage(&self, other: &HalfBuffer) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    fn bytes(&self) -> &[AtomicU8] {
        &self.region.bytes()[self.start..self.start + self.len]
    }

    /// Copies up to `dst.len()` bytes starting at `offset`. Returns the count.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let src = self.bytes().get(offset..).unwrap_or_default();
        let count = dst.len().min(src.len());
        for (out, byte) in dst[..count].iter_mut().zip(src) {
            *out = byte.load(Ordering::Relaxed);
        }
        count
    }

    pub fn write_at(&self, offset: usize, src: &[u8]) -> usize {
        let dst = self.bytes().get(offset..).unwrap_or_default();
        let count = src.len().min(dst.len());
        for (byte, value) in dst.iter().zip(&src[..count]) {
            byte.store(*value, Ordering::Relaxed);
        }
        count
    }

    pub fn get(&self, offset: usize) -> Option<u8> {
        self.bytes()
            .get(offset)
            .map(|byte| byte.load(Ordering::Relaxed))
    }

    pub fn put(&self, offset: usize, value: u8) -> bool {
        match self.bytes().get(offset) {
            Some(byte) => {
                byte.store(value, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn fill(&self, value: u8) {
        for byte in self.bytes() {
            byte.store(value, Ordering::Relaxed);
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0_u8; self.len];
        self.read_at(0, &mut out);
        out
    }
}

/// Two separate half-buffers addressed as one byte range `[0, capacity)`.
///
/// Positions `< first_limit` live in the first half, the rest in the second.
/// Position, limit and the read-only flag belong to this view only; clones and
/// slices share the bytes.
#[derive(Debug, Clone)]
pub struct DoubleHalfBuffer {
    first: HalfBuffer,
    second: HalfBuffer,
    first_limit: usize,
    capacity: usize,
    limit: usize,
    position: usize,
    read_only: bool,
}

impl DoubleHalfBuffer {
    pub fn new(first: HalfBuffer, second: HalfBuffer) -> Self {
        let first_limit = first.len();
        let capacity = first_limit + second.len();
        Self {
            first,
            second,
            first_limit,
            capacity,
            limit: capacity,
            position: 0,
            read_only: false,
        }
    }

    /// Allocates two zeroed halves of `half_len` bytes each.
    pub fn allocate(half_len: usize) -> Self {
        Self::new(HalfBuffer::zeroed(half_len), HalfBuffer::zeroed(half_len))
    }

    pub fn as_read_only(&self) -> Self {
        let mut view = self.clone();
        view.read_only = true;
        view
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn first_limit(&self) -> usize {
        self.first_limit
    }

    pub fn halves(&self) -> (&HalfBuffer, &HalfBuffer) {
        (&self.first, &self.second)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the position, clamped to the limit.
    pub fn set_position(&mut self, position: usize) -> &mut Self {
        self.position = position.min(self.limit);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Moves the limit, clamped to the capacity. The position follows if it
    /// would be past the new limit.
    pub fn set_limit(&mut self, limit: usize) -> &mut Self {
        self.limit = limit.min(self.capacity);
        self.position = self.position.min(self.limit);
        self
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    pub fn clear(&mut self) -> &mut Self {
        self.position = 0;
        self.limit = self.capacity;
        self
    }

    pub fn flip(&mut self) -> &mut Self {
        self.limit = self.position;
        self.position = 0;
        self
    }

    pub fn rewind(&mut self) -> &mut Self {
        self.position = 0;
        self
    }

    fn locate(&self, index: usize) -> (&HalfBuffer, usize) {
        if index < self.first_limit {
            (&self.first, index)
        } else {
            (&self.second, index - self.first_limit)
        }
    }

    pub fn get_at(&self, index: usize) -> Result<u8, BufferError> {
        if index >= self.limit {
            return Err(BufferError::Underflow);
        }
        let (half, offset) = self.locate(index);
        half.get(offset).ok_or(BufferError::Underflow)
    }

    pub fn get(&mut self) -> Result<u8, BufferError> {
        let value = self.get_at(self.position)?;
        self.position += 1;
        Ok(value)
    }

    pub fn put_at(&mut self, index: usize, value: u8) -> Result<&mut Self, BufferError> {
        if self.read_only {
            return Err(BufferError::ReadOnly);
        }
        if index >= self.limit {
            return Err(BufferError::Overflow);
        }
        let (half, offset) = self.locate(index);
        if !half.put(offset, value) {
            return Err(BufferError::Overflow);
        }
        Ok(self)
    }

    pub fn put(&mut self, value: u8) -> Result<&mut Self, BufferError> {
        let position = self.position;
        self.put_at(position, value)?;
        self.position += 1;
        Ok(self)
    }

    /// Fills `dst` from the current position, failing without moving if fewer
    /// than `dst.len()` bytes remain.
    pub fn get_bytes(&mut self, dst: &mut [u8]) -> Result<&mut Self, BufferError> {
        if dst.len() > self.remaining() {
            return Err(BufferError::Underflow);
        }
        self.take(dst);
        Ok(self)
    }

    pub fn put_bytes(&mut self, src: &[u8]) -> Result<&mut Self, BufferError> {
        if self.read_only {
            return Err(BufferError::ReadOnly);
        }
        if src.len() > self.remaining() {
            return Err(BufferError::Overflow);
        }
        self.give(src);
        Ok(self)
    }

    /// Copies `min(dst.len(), remaining)` bytes out and advances.
    pub(crate) fn take(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.remaining());
        let start = self.position;
        let split = self.first_limit.clamp(start, start + count) - start;
        self.first.read_at(start, &mut dst[..split]);
        self.second
            .read_at((start + split).saturating_sub(self.first_limit), &mut dst[split..count]);
        self.position += count;
        count
    }

    /// Copies `min(src.len(), remaining)` bytes in and advances. Ignores the
    /// read-only flag.
    pub(crate) fn give(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.remaining());
        let start = self.position;
        let split = self.first_limit.clamp(start, start + count) - start;
        self.first.write_at(start, &src[..split]);
        self.second
            .write_at((start + split).saturating_sub(self.first_limit), &src[split..count]);
        self.position += count;
        count
    }

    /// Zeroes `[0, capacity)` without moving the position.
    pub(crate) fn zero(&self) {
        self.first.fill(0);
        self.second.fill(0);
    }

    /// A new buffer over `[position, limit)` of this one, sharing storage.
    pub fn slice(&self) -> Self {
        let (start, end) = (self.position, self.limit);
        let first = self
            .first
            .window(start.min(self.first_limit)..end.min(self.first_limit));
        let second = self.second.window(
            start.saturating_sub(self.first_limit)..end.saturating_sub(self.first_limit),
        );
        let mut slice = Self::new(first, second);
        slice.read_only = self.read_only;
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(half: usize) -> DoubleHalfBuffer {
        let first: Vec<u8> = (0..half as u8).collect();
        let second: Vec<u8> = (half as u8..2 * half as u8).collect();
        DoubleHalfBuffer::new(HalfBuffer::from_bytes(&first), HalfBuffer::from_bytes(&second))
    }

    #[test]
    fn absolute_access_routes_to_the_right_half() {
        let mut buf = numbered(4);
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.get_at(3), Ok(3));
        assert_eq!(buf.get_at(4), Ok(4));
        buf.put_at(5, 99).unwrap();
        assert_eq!(buf.halves().1.get(1), Some(99));
        assert_eq!(buf.halves().0.to_vec(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn access_past_limit_fails() {
        let mut buf = numbered(4);
        buf.set_limit(6);
        assert_eq!(buf.get_at(6), Err(BufferError::Underflow));
        assert_eq!(buf.put_at(6, 1).err(), Some(BufferError::Overflow));
        buf.set_position(6);
        assert_eq!(buf.get(), Err(BufferError::Underflow));
    }

    #[test]
    fn bulk_transfer_spans_the_boundary() {
        let mut buf = numbered(4);
        buf.set_position(2);
        let mut out = [0_u8; 4];
        buf.get_bytes(&mut out).unwrap();
        assert_eq!(out, [2, 3, 4, 5]);
        assert_eq!(buf.position(), 6);

        buf.set_position(3);
        buf.put_bytes(&[30, 40]).unwrap();
        assert_eq!(buf.get_at(3), Ok(30));
        assert_eq!(buf.get_at(4), Ok(40));
    }

    #[test]
    fn bulk_transfer_beyond_remaining_does_not_move() {
        let mut buf = numbered(4);
        buf.set_position(6);
        let mut out = [0_u8; 3];
        assert_eq!(buf.get_bytes(&mut out).err(), Some(BufferError::Underflow));
        assert_eq!(buf.put_bytes(&[1, 2, 3]).err(), Some(BufferError::Overflow));
        assert_eq!(buf.position(), 6);
    }

    #[test]
    fn read_only_view_rejects_puts_but_shares_bytes() {
        let mut buf = numbered(4);
        let mut view = buf.as_read_only();
        assert_eq!(view.put(1).err(), Some(BufferError::ReadOnly));
        assert_eq!(view.put_bytes(&[1]).err(), Some(BufferError::ReadOnly));
        buf.put_at(0, 42).unwrap();
        assert_eq!(view.get_at(0), Ok(42));
        assert!(!buf.is_read_only());
    }

    #[test]
    fn slice_covers_position_to_limit() {
        let mut buf = numbered(4);
        buf.set_position(2).set_limit(7);
        let mut slice = buf.slice();
        assert_eq!(slice.capacity(), 5);
        assert_eq!(slice.first_limit(), 2);
        let mut out = [0_u8; 5];
        slice.get_bytes(&mut out).unwrap();
        assert_eq!(out, [2, 3, 4, 5, 6]);

        slice.put_at(0, 77).unwrap();
        assert_eq!(buf.get_at(2), Ok(77));
    }

    #[test]
    fn slice_within_second_half() {
        let mut buf = numbered(4);
        buf.set_position(5);
        let slice = buf.slice();
        assert_eq!(slice.first_limit(), 0);
        assert_eq!(slice.get_at(0), Ok(5));
        assert_eq!(slice.capacity(), 3);
        assert!(buf.as_read_only().slice().is_read_only());
    }

    #[test]
    fn flip_and_clear_move_limit() {
        let mut buf = numbered(4);
        buf.set_position(3).flip();
        assert_eq!((buf.position(), buf.limit()), (0, 3));
        buf.set_position(5);
        assert_eq!(buf.position(), 3);
        buf.clear();
        assert_eq!((buf.position(), buf.limit()), (0, 8));
        assert!(buf.has_remaining());
    }

    #[test]
    fn windows_share_storage_with_their_half() {
        let half = HalfBuffer::from_bytes(&[1, 2, 3, 4]);
        let tail = half.window(2..10);
        assert_eq!(tail.to_vec(), vec![3, 4]);
        assert!(tail.shares_storage(&half));
        assert!(!half.shares_storage(&HalfBuffer::from_bytes(&[1, 2, 3, 4])));

        tail.put(0, 30);
        assert_eq!(half.get(2), Some(30));
        assert!(!tail.put(2, 0));
        assert_eq!(tail.get(2), None);
    }

    #[test]
    fn clones_write_from_several_threads() {
        let half = HalfBuffer::zeroed(64);
        let writers: Vec<_> = (1..=4_u8)
            .map(|value| {
                let half = half.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        half.fill(value);
                        half.write_at(0, &[value; 32]);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert!(half.to_vec().iter().all(|b| (1..=4).contains(b)));
    }
}
