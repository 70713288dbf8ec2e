use super::error::BufferError;
use super::half_buffer::DoubleHalfBuffer;
use crate::mutex::{lock, wait_timeout};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

const DEFAULT_POLL: Duration = Duration::from_millis(1000);

struct RingState {
    read_view: DoubleHalfBuffer,
    write_view: DoubleHalfBuffer,
    // Tells "cursors equal" apart: set means full, clear means empty.
    write_ahead: bool,
    open: bool,
}

impl RingState {
    fn read_pos(&self) -> usize {
        self.read_view.position()
    }

    fn write_pos(&self) -> usize {
        self.write_view.position()
    }

    fn read_available(&self, capacity: usize) -> usize {
        if !self.open {
            return 0;
        }
        let (read, write) = (self.read_pos(), self.write_pos());
        if read < write {
            write - read
        } else if read > write || self.write_ahead {
            capacity - read + write
        } else {
            0
        }
    }

    fn write_available(&self, capacity: usize) -> usize {
        let (read, write) = (self.read_pos(), self.write_pos());
        if write < read {
            read - write
        } else if write > read || !self.write_ahead {
            capacity - write + read
        } else {
            0
        }
    }

    fn copy_out(&mut self, dst: &mut [u8]) {
        let mut done = 0;
        while done < dst.len() {
            done += self.read_view.take(&mut dst[done..]);
            if !self.read_view.has_remaining() {
                self.read_view.rewind();
            }
        }
    }

    fn copy_in(&mut self, src: &[u8]) {
        let mut done = 0;
        while done < src.len() {
            done += self.write_view.give(&src[done..]);
            if !self.write_view.has_remaining() {
                self.write_view.rewind();
            }
        }
    }
}

/// Circular buffer over one [`DoubleHalfBuffer`] with independent read and
/// write cursors.
///
/// Every transfer length is truncated to a multiple of the granularity. The
/// overwrite variants never block and resynchronize the opposing cursor when
/// they run over it; they are meant for the driver callback. Plain `write`
/// blocks until space frees up or the buffer is closed.
pub struct DoubleHalfRingBuffer {
    state: Mutex<RingState>,
    space: Condvar,
    data: Condvar,
    capacity: usize,
    granularity: usize,
    poll: Duration,
}

impl std::fmt::Debug for DoubleHalfRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (read, write, write_ahead) = self.positions();
        f.debug_struct("DoubleHalfRingBuffer")
            .field("capacity", &self.capacity)
            .field("granularity", &self.granularity)
            .field("read", &read)
            .field("write", &write)
            .field("write_ahead", &write_ahead)
            .field("open", &self.is_open())
            .finish()
    }
}

impl DoubleHalfRingBuffer {
    /// Builds a closed ring over `[position, limit)` of `buffer`.
    pub fn new(buffer: DoubleHalfBuffer, granularity: usize) -> Result<Self, BufferError> {
        let storage = buffer.slice();
        let capacity = storage.capacity();
        if granularity == 0 || capacity == 0 || capacity % granularity != 0 {
            return Err(BufferError::Granularity {
                capacity,
                granularity,
            });
        }
        Ok(Self {
            state: Mutex::new(RingState {
                read_view: storage.as_read_only(),
                write_view: storage,
                write_ahead: false,
                open: false,
            }),
            space: Condvar::new(),
            data: Condvar::new(),
            capacity,
            granularity,
            poll: DEFAULT_POLL,
        })
    }

    /// How long a blocked writer sleeps before re-checking its condition.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    fn align(&self, len: usize) -> usize {
        len - len % self.granularity
    }

    pub fn open(&self) {
        lock(&self.state).open = true;
    }

    /// Closes the ring and wakes every blocked reader and writer.
    pub fn close(&self) {
        lock(&self.state).open = false;
        self.space.notify_all();
        self.data.notify_all();
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    pub fn read_available(&self) -> usize {
        lock(&self.state).read_available(self.capacity)
    }

    pub fn write_available(&self) -> usize {
        lock(&self.state).write_available(self.capacity)
    }

    /// `(read cursor, write cursor, write_ahead)`.
    pub fn positions(&self) -> (usize, usize, bool) {
        let state = lock(&self.state);
        (state.read_pos(), state.write_pos(), state.write_ahead)
    }

    pub fn set_positions(&self, read: usize, write: usize, write_ahead: bool) {
        let mut state = lock(&self.state);
        state.read_view.set_position(read % self.capacity);
        state.write_view.set_position(write % self.capacity);
        state.write_ahead = write_ahead;
        drop(state);
        self.space.notify_all();
        self.data.notify_all();
    }

    /// Resets both cursors, leaving the ring empty.
    pub fn flush(&self) {
        let mut state = lock(&self.state);
        state.read_view.rewind();
        state.write_view.rewind();
        state.write_ahead = false;
        drop(state);
        self.space.notify_all();
    }

    pub fn rewind(&self) {
        self.flush();
    }

    /// Flushes and zeroes the storage so stale bytes never reach an overwrite
    /// reader.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.write_view.zero();
        state.read_view.rewind();
        state.write_view.rewind();
        state.write_ahead = false;
        drop(state);
        self.space.notify_all();
    }

    fn read_locked(&self, state: &mut RingState, dst: &mut [u8], overwrite: bool) -> usize {
        if !state.open {
            return 0;
        }
        let len = self.align(dst.len());
        let len = if overwrite {
            len.min(self.capacity)
        } else {
            len.min(state.read_available(self.capacity))
        };
        if len == 0 {
            return 0;
        }
        let before = state.read_pos();
        let write = state.write_pos();
        state.copy_out(&mut dst[..len]);
        let after = state.read_pos();
        if overwrite {
            let crossed = (before < write && before + len > write)
                || (before > write && before + len >= self.capacity + write);
            if len == self.capacity
                || after == write
                || crossed
                || (before == write && !state.write_ahead)
            {
                state.write_view.set_position(after);
                state.write_ahead = false;
            }
        } else if after == write {
            state.write_ahead = false;
        }
        len
    }

    /// Reads at most `read_available()` bytes. Never blocks.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let count = self.read_locked(&mut lock(&self.state), dst, false);
        if count > 0 {
            self.space.notify_all();
        }
        count
    }

    /// Reads `min(len, capacity)` bytes whatever is available. If the read
    /// reaches or crosses the write cursor, the ring becomes empty.
    pub fn read_overwrite(&self, dst: &mut [u8]) -> usize {
        let count = self.read_locked(&mut lock(&self.state), dst, true);
        if count > 0 {
            self.space.notify_all();
        }
        count
    }

    /// Overwrite read that zeroes every byte of `dst` past the data that was
    /// actually available. Returns the count of fresh bytes.
    pub fn read_overwrite_padded(&self, dst: &mut [u8]) -> usize {
        let mut state = lock(&self.state);
        let fresh = state.read_available(self.capacity);
        let count = self.read_locked(&mut state, dst, true);
        drop(state);
        let fresh = fresh.min(count);
        dst[fresh..].fill(0);
        if count > 0 {
            self.space.notify_all();
        }
        fresh
    }

    fn write_inner(&self, src: &[u8], overwrite: bool, block: bool) -> usize {
        let len = self.align(src.len());
        let mut written = 0;
        let mut state = lock(&self.state);
        while written < len && state.open {
            let available = state.write_available(self.capacity);
            if !overwrite && available == 0 {
                if !block {
                    break;
                }
                state = wait_timeout(&self.space, state, self.poll);
                continue;
            }
            let read = state.read_pos();
            let write = state.write_pos();
            let chunk = if overwrite {
                (len - written).min(self.capacity)
            } else {
                (len - written).min(available)
            };
            state.copy_in(&src[written..written + chunk]);
            if overwrite {
                let crossed = (write < read && write + chunk > read)
                    || (write > read && write + chunk >= self.capacity + read);
                if chunk == self.capacity || crossed || (write == read && state.write_ahead) {
                    let position = state.write_pos();
                    state.read_view.set_position(position);
                }
            }
            state.write_ahead = true;
            written += chunk;
            self.data.notify_all();
        }
        if written < len && !state.open {
            // Closed mid-transfer: queue what fits and return.
            let chunk = (len - written).min(state.write_available(self.capacity));
            if chunk > 0 {
                state.copy_in(&src[written..written + chunk]);
                state.write_ahead = true;
                written += chunk;
            }
        }
        written
    }

    /// Writes all of `src` (truncated to the granularity), blocking while the
    /// ring is full. Returns early with the partial count once the ring is
    /// closed.
    pub fn write(&self, src: &[u8]) -> usize {
        self.write_inner(src, false, true)
    }

    /// Writes what fits right now without blocking.
    pub fn try_write(&self, src: &[u8]) -> usize {
        self.write_inner(src, false, false)
    }

    /// Writes unconditionally. Unread data that gets overwritten is dropped by
    /// moving the read cursor to the new write position.
    pub fn write_overwrite(&self, src: &[u8]) -> usize {
        self.write_inner(src, true, false)
    }

    /// Waits up to `timeout` for at least `min` bytes of space. Returns the
    /// space available when it stops waiting.
    pub fn wait_for_space(&self, min: usize, timeout: Duration) -> usize {
        let mut state = lock(&self.state);
        if state.open && state.write_available(self.capacity) < min {
            state = wait_timeout(&self.space, state, timeout);
        }
        state.write_available(self.capacity)
    }

    /// Waits up to `timeout` for at least `min` readable bytes.
    pub fn wait_for_data(&self, min: usize, timeout: Duration) -> usize {
        let mut state = lock(&self.state);
        if state.open && state.read_available(self.capacity) < min {
            state = wait_timeout(&self.data, state, timeout);
        }
        state.read_available(self.capacity)
    }

    /// Wakes every waiter without changing state.
    pub fn wake(&self) {
        self.space.notify_all();
        self.data.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ring(half: usize, granularity: usize) -> DoubleHalfRingBuffer {
        let ring = DoubleHalfRingBuffer::new(DoubleHalfBuffer::allocate(half), granularity)
            .unwrap()
            .with_poll_interval(Duration::from_millis(5));
        ring.open();
        ring
    }

    fn bytes(range: std::ops::RangeInclusive<u8>) -> Vec<u8> {
        range.collect()
    }

    #[test]
    fn capacity_must_be_a_multiple_of_granularity() {
        let err = DoubleHalfRingBuffer::new(DoubleHalfBuffer::allocate(5), 4).unwrap_err();
        assert_eq!(
            err,
            BufferError::Granularity {
                capacity: 10,
                granularity: 4
            }
        );
        assert!(DoubleHalfRingBuffer::new(DoubleHalfBuffer::allocate(4), 0).is_err());
    }

    #[test]
    fn partial_fill_then_partial_read() {
        let ring = ring(8, 4);
        assert_eq!(ring.write(&bytes(1..=8)), 8);
        assert_eq!(ring.read_available(), 8);
        assert_eq!(ring.write_available(), 8);

        let mut out = [0_u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(ring.read_available(), 4);
    }

    #[test]
    fn round_trip_across_wraps() {
        let ring = ring(8, 4);
        let mut expected = Vec::new();
        let mut received = Vec::new();
        let mut next = 0_u8;
        for step in 0..12 {
            let len = 4 * (1 + step % 3);
            let chunk: Vec<u8> = (0..len)
                .map(|_| {
                    next = next.wrapping_add(1);
                    next
                })
                .collect();
            assert_eq!(ring.write(&chunk), len);
            expected.extend_from_slice(&chunk);
            assert_eq!(ring.read_available() + ring.write_available(), 16);
            let mut out = vec![0_u8; len];
            assert_eq!(ring.read(&mut out), len);
            received.extend_from_slice(&out);
            assert_eq!(ring.read_available() + ring.write_available(), 16);
        }
        assert_eq!(received, expected);
    }

    #[test]
    fn full_ring_is_distinguished_from_empty() {
        let ring = ring(8, 4);
        assert_eq!(ring.write(&bytes(1..=16)), 16);
        let (read, write, write_ahead) = ring.positions();
        assert_eq!((read, write, write_ahead), (0, 0, true));
        assert_eq!(ring.read_available(), 16);
        assert_eq!(ring.write_available(), 0);

        let mut out = [0_u8; 16];
        assert_eq!(ring.read(&mut out), 16);
        assert_eq!(out.to_vec(), bytes(1..=16));
        assert_eq!(ring.read_available(), 0);
        assert_eq!(ring.write_available(), 16);
    }

    #[test]
    fn lengths_are_truncated_to_granularity() {
        let ring = ring(8, 4);
        assert_eq!(ring.write(&bytes(1..=7)), 4);
        assert_eq!(ring.read_available(), 4);
        let mut out = [0_u8; 6];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        assert_eq!(ring.write_overwrite(&[9; 3]), 0);
        assert_eq!(ring.read_overwrite(&mut [0; 3]), 0);
    }

    #[test]
    fn plain_read_never_exceeds_available() {
        let ring = ring(8, 4);
        ring.write(&bytes(1..=4));
        let mut out = [0_u8; 12];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(ring.read(&mut out), 0);
    }

    #[test]
    fn flush_empties_the_ring() {
        let ring = ring(8, 4);
        ring.write(&bytes(1..=12));
        ring.read(&mut [0; 4]);
        ring.flush();
        assert_eq!(ring.read_available(), 0);
        assert_eq!(ring.write_available(), 16);
        assert_eq!(ring.positions(), (0, 0, false));
    }

    #[test]
    fn overwrite_read_of_capacity_always_succeeds() {
        let ring = ring(8, 4);
        ring.write(&bytes(1..=4));
        let mut out = [0_u8; 16];
        assert_eq!(ring.read_overwrite(&mut out), 16);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        assert_eq!(ring.read_available(), 0);
        assert_eq!(ring.write_available(), 16);

        ring.write(&bytes(1..=16));
        assert_eq!(ring.read_overwrite(&mut out), 16);
        assert_eq!(ring.read_available(), 0);
    }

    #[test]
    fn overwrite_read_past_writer_resyncs_it() {
        let ring = ring(8, 4);
        ring.write(&bytes(1..=4));
        let mut out = [0_u8; 8];
        assert_eq!(ring.read_overwrite(&mut out), 8);
        assert_eq!(ring.positions(), (8, 8, false));
        assert_eq!(ring.read_available(), 0);

        ring.write(&bytes(1..=8));
        assert_eq!(ring.read_overwrite(&mut [0; 4]), 4);
        assert_eq!(ring.read_available(), 4);
    }

    #[test]
    fn overwrite_write_drops_the_oldest_data() {
        let ring = ring(8, 4);
        ring.write(&bytes(1..=12));
        assert_eq!(ring.write_overwrite(&bytes(13..=20)), 8);
        assert_eq!(ring.read_available(), 16);
        let mut out = [0_u8; 16];
        assert_eq!(ring.read(&mut out), 16);
        assert_eq!(out.to_vec(), bytes(5..=20));
    }

    #[test]
    fn overwrite_write_larger_than_capacity_keeps_the_tail() {
        let ring = ring(4, 4);
        assert_eq!(ring.write_overwrite(&bytes(1..=12)), 12);
        let mut out = [0_u8; 8];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(out.to_vec(), bytes(5..=12));
    }

    #[test]
    fn padded_read_zeroes_underrun() {
        let ring = ring(8, 4);
        ring.write(&[7; 4]);
        let mut out = [1_u8; 8];
        assert_eq!(ring.read_overwrite_padded(&mut out), 4);
        assert_eq!(out, [7, 7, 7, 7, 0, 0, 0, 0]);
        assert_eq!(ring.read_available(), 0);
    }

    #[test]
    fn closed_ring_reads_nothing() {
        let ring = ring(8, 4);
        ring.write(&bytes(1..=8));
        ring.close();
        assert_eq!(ring.read(&mut [0; 8]), 0);
        assert_eq!(ring.read_available(), 0);
        ring.open();
        assert_eq!(ring.read_available(), 8);
    }

    #[test]
    fn blocked_write_returns_on_close() {
        let ring = Arc::new(ring(8, 4));
        let writer = {
            let ring = ring.clone();
            thread::spawn(move || ring.write(&bytes(1..=20)))
        };
        while ring.write_available() > 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        ring.close();
        assert_eq!(writer.join().unwrap(), 16);

        ring.open();
        let blocked = {
            let ring = ring.clone();
            thread::spawn(move || ring.write(&[0; 4]))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!blocked.is_finished());
        ring.close();
        assert_eq!(blocked.join().unwrap(), 0);
    }

    #[test]
    fn blocked_write_resumes_when_reader_frees_space() {
        let ring = Arc::new(ring(8, 4));
        ring.write(&bytes(1..=16));
        let writer = {
            let ring = ring.clone();
            thread::spawn(move || ring.write(&bytes(17..=24)))
        };
        let mut out = [0_u8; 8];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(writer.join().unwrap(), 8);
        let mut rest = [0_u8; 16];
        assert_eq!(ring.read(&mut rest), 16);
        assert_eq!(rest.to_vec(), bytes(9..=24));
    }

    #[test]
    fn try_write_does_not_block() {
        let ring = ring(8, 4);
        assert_eq!(ring.try_write(&bytes(1..=20)), 16);
        assert_eq!(ring.try_write(&bytes(1..=4)), 0);
    }

    #[test]
    fn write_to_closed_ring_is_best_effort() {
        let ring = ring(8, 4);
        ring.write(&bytes(1..=12));
        ring.close();
        assert_eq!(ring.write(&bytes(1..=8)), 4);
        assert_eq!(ring.write_available(), 0);
    }

    #[test]
    fn set_positions_restores_state() {
        let ring = ring(8, 4);
        ring.set_positions(12, 4, false);
        assert_eq!(ring.read_available(), 8);
        assert_eq!(ring.write_available(), 8);
        ring.set_positions(4, 4, true);
        assert_eq!(ring.read_available(), 16);
    }

    #[test]
    fn clear_zeroes_storage() {
        let ring = ring(4, 4);
        ring.write(&[9; 8]);
        ring.clear();
        let mut out = [1_u8; 8];
        assert_eq!(ring.read_overwrite(&mut out), 8);
        assert_eq!(out, [0; 8]);
    }

    #[test]
    fn wait_for_data_times_out() {
        let ring = ring(4, 4);
        assert_eq!(ring.wait_for_data(4, Duration::from_millis(5)), 0);
        ring.write(&[1; 4]);
        assert_eq!(ring.wait_for_data(4, Duration::from_millis(5)), 4);
    }
}
