use super::error::DriverError;
use super::events::EventHub;
use super::format::AudioFormat;
use super::half_buffer::DoubleHalfBuffer;
use super::mixer::{Mixer, MixerShared, Status};
use super::ring_buffer::DoubleHalfRingBuffer;
use super::transport::ChannelInfo;
use crate::message::{EventSource, LineEvent, LineEventKind};
use crate::mutex::lock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Hardware to application (a target line).
    Input,
    /// Application to hardware (a source line).
    Output,
}

impl Direction {
    pub fn is_input(self) -> bool {
        self == Direction::Input
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineInfo {
    pub direction: Direction,
    pub channel: ChannelInfo,
    pub formats: Vec<AudioFormat>,
    pub min_buffer_bytes: usize,
    pub max_buffer_bytes: usize,
}

impl LineInfo {
    /// Same hardware channel in the same direction.
    pub fn matches(&self, other: &LineInfo) -> bool {
        self.direction == other.direction
            && self.channel.channel == other.channel.channel
            && self.channel.is_input == other.channel.is_input
    }

    pub fn is_format_supported(&self, format: &AudioFormat) -> bool {
        self.formats.iter().any(|supported| supported.matches(format))
    }

    fn default_format(&self) -> AudioFormat {
        self.formats
            .first()
            .copied()
            .unwrap_or_else(|| AudioFormat::new(None, self.channel.sample_type, 1))
    }
}

struct LineState {
    open: bool,
    started: bool,
    flush_epoch: u64,
    format: AudioFormat,
    buffer_bytes: Option<usize>,
    rings: Vec<Arc<DoubleHalfRingBuffer>>,
}

struct LineShared {
    mixer: Weak<MixerShared>,
    driver: String,
    info: LineInfo,
    state: Mutex<LineState>,
    events: EventHub,
}

/// Snapshot taken at the start of a transfer.
struct Transfer {
    format: AudioFormat,
    rings: Vec<Arc<DoubleHalfRingBuffer>>,
    epoch: u64,
}

/// A blocking byte stream over one or more adjacent hardware channels.
///
/// Output lines deinterleave written frames into one ring per channel; input
/// lines interleave them back on read. The rings are drained and filled by
/// the driver's buffer switches.
#[derive(Clone)]
pub struct Line {
    shared: Arc<LineShared>,
}

impl std::fmt::Debug for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Line")
            .field("driver", &self.shared.driver)
            .field("direction", &self.shared.info.direction)
            .field("channel", &self.shared.info.channel.channel)
            .field("open", &state.open)
            .field("started", &state.started)
            .finish()
    }
}

impl Line {
    pub(crate) fn new(mixer: &Mixer, info: LineInfo) -> Self {
        let format = info.default_format();
        Self {
            shared: Arc::new(LineShared {
                mixer: Arc::downgrade(&mixer.shared),
                driver: mixer.name().to_string(),
                state: Mutex::new(LineState {
                    open: false,
                    started: false,
                    flush_epoch: 0,
                    format,
                    buffer_bytes: None,
                    rings: Vec::new(),
                }),
                info,
                events: EventHub::default(),
            }),
        }
    }

    pub fn same(&self, other: &Line) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn belongs_to(&self, mixer: &Mixer) -> bool {
        std::ptr::eq(self.shared.mixer.as_ptr(), Arc::as_ptr(&mixer.shared))
    }

    pub(crate) fn describe(&self) -> String {
        format!(
            "{} {:?} channel {} ({})",
            self.shared.driver,
            self.direction(),
            self.channel(),
            self.shared.info.channel.name
        )
    }

    fn mixer(&self) -> Result<Mixer, DriverError> {
        self.shared
            .mixer
            .upgrade()
            .map(Mixer::from_shared)
            .ok_or(DriverError::MixerGone)
    }

    pub fn info(&self) -> &LineInfo {
        &self.shared.info
    }

    pub fn direction(&self) -> Direction {
        self.shared.info.direction
    }

    /// First hardware channel of the line.
    pub fn channel(&self) -> usize {
        self.shared.info.channel.channel
    }

    pub fn format(&self) -> AudioFormat {
        lock(&self.shared.state).format
    }

    pub fn subscribe(&self) -> UnboundedReceiver<LineEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, kind: LineEventKind) {
        let frame_position = self.frame_position() as i64;
        self.shared.events.emit(LineEvent {
            kind,
            source: EventSource::Line {
                driver: self.shared.driver.clone(),
                direction: self.direction(),
                channel: self.channel(),
            },
            frame_position,
        });
    }

    /// Opens with `format`, or the first supported format, at the driver's
    /// default buffer size.
    pub fn open(&self, format: Option<AudioFormat>) -> Result<(), DriverError> {
        let format = format.unwrap_or_else(|| self.shared.info.default_format());
        self.open_inner(format, None)
    }

    /// Opens with a total buffer of `buffer_bytes`, split over both halves.
    pub fn open_with(&self, format: AudioFormat, buffer_bytes: usize) -> Result<(), DriverError> {
        if format.frame_size == 0 || buffer_bytes % format.frame_size != 0 {
            return Err(DriverError::PartialFrame(buffer_bytes));
        }
        self.open_inner(format, Some(buffer_bytes))
    }

    fn open_inner(&self, format: AudioFormat, buffer_bytes: Option<usize>) -> Result<(), DriverError> {
        if format.channels == 0 || format.sample_type != self.shared.info.channel.sample_type {
            return Err(DriverError::UnsupportedFormat(format.to_string()));
        }
        {
            let mut state = lock(&self.shared.state);
            if state.open {
                return Ok(());
            }
            state.format = format;
            state.buffer_bytes = buffer_bytes;
        }
        self.mixer()?.open_line(self)
    }

    /// Stops and closes the line together with its synchronization group.
    pub fn close(&self) {
        match self.mixer() {
            Ok(mixer) => mixer.close_line(self),
            Err(_) => self.closed(),
        }
    }

    /// Starts the driver, opening the line first if needed.
    pub fn start(&self) -> Result<(), DriverError> {
        self.mixer()?.start_line(self)
    }

    pub fn stop(&self) -> Result<(), DriverError> {
        self.mixer()?.stop_line(self)
    }

    pub fn is_open(&self) -> bool {
        lock(&self.shared.state).open
    }

    pub fn is_active(&self) -> bool {
        let state = lock(&self.shared.state);
        state.open && state.started
    }

    pub fn is_running(&self) -> bool {
        self.is_active()
            && self
                .mixer()
                .is_ok_and(|mixer| mixer.status() == Status::Running)
    }

    /// Total ring capacity of the open line in bytes.
    pub fn buffer_size(&self) -> usize {
        let state = lock(&self.shared.state);
        state.rings.iter().map(|ring| ring.capacity()).sum()
    }

    /// Bytes that can be written (output) or read (input) without blocking.
    pub fn available(&self) -> usize {
        let Some(transfer) = self.transfer() else {
            return 0;
        };
        let sample_bytes = transfer.format.sample_bytes();
        let direction = self.direction();
        let frames = transfer
            .rings
            .iter()
            .map(|ring| {
                let bytes = match direction {
                    Direction::Output => ring.write_available(),
                    Direction::Input => ring.read_available(),
                };
                bytes / sample_bytes
            })
            .min()
            .unwrap_or(0);
        frames * transfer.format.frame_size
    }

    pub fn frame_position(&self) -> u64 {
        self.mixer().map_or(0, |mixer| mixer.frame_position())
    }

    pub fn microsecond_position(&self) -> u64 {
        self.mixer().map_or(0, |mixer| mixer.microsecond_position())
    }

    fn transfer(&self) -> Option<Transfer> {
        let state = lock(&self.shared.state);
        state.open.then(|| Transfer {
            format: state.format,
            rings: state.rings.clone(),
            epoch: state.flush_epoch,
        })
    }

    fn still_current(&self, epoch: u64) -> bool {
        let state = lock(&self.shared.state);
        state.open && state.flush_epoch == epoch
    }

    fn may_block(&self, epoch: u64) -> bool {
        let state = lock(&self.shared.state);
        state.open && state.started && state.flush_epoch == epoch
    }

    fn check_frames(&self, len: usize) -> Result<(), DriverError> {
        let frame_size = self.format().frame_size;
        if frame_size == 0 || len % frame_size != 0 {
            return Err(DriverError::PartialFrame(len));
        }
        Ok(())
    }

    /// Queues `bytes` for playback. While the line runs this blocks until
    /// everything is queued; otherwise it queues what fits. Returns early
    /// with the partial count on stop, flush or close.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, DriverError> {
        if self.direction() != Direction::Output {
            return Err(DriverError::WrongDirection("write"));
        }
        self.check_frames(bytes.len())?;
        let Some(transfer) = self.transfer() else {
            return Ok(0);
        };
        let frame_size = transfer.format.frame_size;
        let sample_bytes = transfer.format.sample_bytes();
        let poll = self.poll();
        let mut lane = Vec::new();
        let mut done = 0;
        while done < bytes.len() && self.still_current(transfer.epoch) {
            let (tightest, space) = least(&transfer.rings, |ring| ring.write_available());
            let frames = (space / sample_bytes).min((bytes.len() - done) / frame_size);
            if frames == 0 {
                if !self.may_block(transfer.epoch) {
                    break;
                }
                if let Some(ring) = tightest {
                    ring.wait_for_space(sample_bytes, poll);
                }
                continue;
            }
            let chunk = &bytes[done..done + frames * frame_size];
            for (index, ring) in transfer.rings.iter().enumerate() {
                deinterleave(chunk, frame_size, sample_bytes, index, &mut lane);
                ring.try_write(&lane);
            }
            done += chunk.len();
        }
        trace!("{}: wrote {done} of {} bytes", self.describe(), bytes.len());
        Ok(done)
    }

    /// Fills `dst` with captured frames. While the line runs this blocks
    /// until `dst` is full; otherwise it returns what is buffered.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, DriverError> {
        if self.direction() != Direction::Input {
            return Err(DriverError::WrongDirection("read"));
        }
        self.check_frames(dst.len())?;
        let Some(transfer) = self.transfer() else {
            return Ok(0);
        };
        let frame_size = transfer.format.frame_size;
        let sample_bytes = transfer.format.sample_bytes();
        let poll = self.poll();
        let mut lane = Vec::new();
        let mut done = 0;
        while done < dst.len() && self.still_current(transfer.epoch) {
            let (emptiest, data) = least(&transfer.rings, |ring| ring.read_available());
            let frames = (data / sample_bytes).min((dst.len() - done) / frame_size);
            if frames == 0 {
                if !self.may_block(transfer.epoch) {
                    break;
                }
                if let Some(ring) = emptiest {
                    ring.wait_for_data(sample_bytes, poll);
                }
                continue;
            }
            let chunk = &mut dst[done..done + frames * frame_size];
            for (index, ring) in transfer.rings.iter().enumerate() {
                lane.resize(frames * sample_bytes, 0);
                let got = ring.read(&mut lane);
                lane[got..].fill(0);
                interleave(&lane, frame_size, sample_bytes, index, chunk);
            }
            done += chunk.len();
        }
        Ok(done)
    }

    /// Blocks until the driver has consumed everything queued, or the line
    /// stops. Input lines return immediately.
    pub fn drain(&self) -> Result<(), DriverError> {
        if self.direction() == Direction::Input {
            return Ok(());
        }
        let Some(transfer) = self.transfer() else {
            return Ok(());
        };
        let poll = self.poll();
        while let (Some(ring), pending) = most(&transfer.rings, |ring| ring.read_available()) {
            if pending == 0 || !self.may_block(transfer.epoch) {
                break;
            }
            ring.wait_for_space(ring.capacity(), poll);
        }
        Ok(())
    }

    /// Discards buffered data and releases blocked readers and writers.
    pub fn flush(&self) {
        let rings = {
            let mut state = lock(&self.shared.state);
            state.flush_epoch += 1;
            state.rings.clone()
        };
        for ring in &rings {
            ring.clear();
            ring.wake();
        }
        debug!("flushed {}", self.describe());
    }

    fn poll(&self) -> Duration {
        self.mixer()
            .map(|mixer| mixer.registry().options.poll_interval())
            .unwrap_or(Duration::from_millis(10))
    }

    /// Half-buffer frames asked for by `open_with`.
    pub(crate) fn requested_half_frames(&self) -> Option<usize> {
        let state = lock(&self.shared.state);
        let frame_size = state.format.frame_size;
        state
            .buffer_bytes
            .filter(|_| frame_size > 0)
            .map(|bytes| (bytes / frame_size / 2).max(1))
    }

    /// One ring per channel, each holding two halves of `frames` samples.
    pub(crate) fn build_rings(
        &self,
        frames: usize,
        poll: Duration,
    ) -> Result<Vec<Arc<DoubleHalfRingBuffer>>, DriverError> {
        let format = self.format();
        let sample_bytes = format.sample_bytes();
        (0..format.channels)
            .map(|_| {
                let storage = DoubleHalfBuffer::allocate(frames * sample_bytes);
                let ring = DoubleHalfRingBuffer::new(storage, sample_bytes)?;
                Ok(Arc::new(ring.with_poll_interval(poll)))
            })
            .collect()
    }

    pub(crate) fn opened(&self, rings: Vec<Arc<DoubleHalfRingBuffer>>) {
        for ring in &rings {
            ring.open();
        }
        {
            let mut state = lock(&self.shared.state);
            state.rings = rings;
            state.open = true;
            state.started = false;
        }
        debug!("opened {} as {}", self.describe(), self.format());
        self.emit(LineEventKind::Open);
    }

    pub(crate) fn closed(&self) {
        let (rings, was_started) = {
            let mut state = lock(&self.shared.state);
            if !state.open {
                return;
            }
            state.open = false;
            state.flush_epoch += 1;
            let was_started = std::mem::replace(&mut state.started, false);
            (std::mem::take(&mut state.rings), was_started)
        };
        for ring in &rings {
            ring.close();
        }
        if was_started {
            self.emit(LineEventKind::Stop);
        }
        debug!("closed {}", self.describe());
        self.emit(LineEventKind::Close);
    }

    pub(crate) fn set_started(&self, started: bool) {
        {
            let mut state = lock(&self.shared.state);
            if !state.open || state.started == started {
                return;
            }
            state.started = started;
        }
        let kind = if started {
            LineEventKind::Start
        } else {
            for ring in lock(&self.shared.state).rings.iter() {
                ring.wake();
            }
            LineEventKind::Stop
        };
        self.emit(kind);
    }
}

fn least<'a>(
    rings: &'a [Arc<DoubleHalfRingBuffer>],
    measure: impl Fn(&DoubleHalfRingBuffer) -> usize,
) -> (Option<&'a Arc<DoubleHalfRingBuffer>>, usize) {
    rings
        .iter()
        .map(|ring| (ring, measure(ring)))
        .min_by_key(|(_, amount)| *amount)
        .map_or((None, 0), |(ring, amount)| (Some(ring), amount))
}

fn most<'a>(
    rings: &'a [Arc<DoubleHalfRingBuffer>],
    measure: impl Fn(&DoubleHalfRingBuffer) -> usize,
) -> (Option<&'a Arc<DoubleHalfRingBuffer>>, usize) {
    rings
        .iter()
        .map(|ring| (ring, measure(ring)))
        .max_by_key(|(_, amount)| *amount)
        .map_or((None, 0), |(ring, amount)| (Some(ring), amount))
}

/// Copies channel `index` of every frame in `frames` into `lane`.
fn deinterleave(frames: &[u8], frame_size: usize, sample_bytes: usize, index: usize, lane: &mut Vec<u8>) {
    let offset = index * sample_bytes;
    lane.clear();
    for frame in frames.chunks_exact(frame_size) {
        lane.extend_from_slice(&frame[offset..offset + sample_bytes]);
    }
}

fn interleave(lane: &[u8], frame_size: usize, sample_bytes: usize, index: usize, frames: &mut [u8]) {
    let offset = index * sample_bytes;
    for (frame, sample) in frames
        .chunks_exact_mut(frame_size)
        .zip(lane.chunks_exact(sample_bytes))
    {
        frame[offset..offset + sample_bytes].copy_from_slice(sample);
    }
}
