use super::half_buffer::HalfBuffer;
use super::line::{Direction, Line};
use super::mixer::{Mixer, MixerShared};
use super::registry::{RegistryShared, Ticket};
use super::ring_buffer::DoubleHalfRingBuffer;
use super::transport::{DriverCallbacks, MessageSelector, TimeInfo, host_time_nanos};
use std::sync::{Arc, Weak};

/// Running time and sample counters, advanced only from periods the driver
/// marked valid.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct PositionClock {
    last_time: Option<u64>,
    last_sample: Option<u64>,
    nanos_since_open: Option<u64>,
    samples_since_open: Option<u64>,
}

impl PositionClock {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn observe(&mut self, time: &TimeInfo, now: u64) {
        if time.system_time_valid() {
            self.nanos_since_open = Some(advance(self.nanos_since_open, self.last_time, now));
            self.last_time = Some(now);
        }
        if time.sample_position_valid() {
            let position = time.sample_position;
            self.samples_since_open =
                Some(advance(self.samples_since_open, self.last_sample, position));
            self.last_sample = Some(position);
        }
    }

    pub(crate) fn microseconds(&self, now: u64) -> u64 {
        match (self.nanos_since_open, self.last_time) {
            (None, _) => 0,
            (Some(total), Some(last)) => (total + now.saturating_sub(last)) / 1_000,
            (Some(total), None) => total / 1_000,
        }
    }

    /// Frames since open, extrapolated from the last period at `rate`.
    pub(crate) fn frames(&self, now: u64, rate: f64) -> u64 {
        match (self.samples_since_open, self.last_time) {
            (None, _) => 0,
            (Some(samples), Some(last)) => {
                let elapsed = now.saturating_sub(last) as f64;
                samples + (elapsed * rate / 1e9) as u64
            }
            (Some(samples), None) => samples,
        }
    }
}

fn advance(total: Option<u64>, last: Option<u64>, now: u64) -> u64 {
    match (total, last) {
        (None, _) => 0,
        (Some(total), Some(last)) => total + now.saturating_sub(last),
        (Some(total), None) => total,
    }
}

impl Direction {
    /// Moves one period between a hardware half and a channel ring without
    /// blocking. Output underruns reach the hardware as silence.
    pub(crate) fn service(self, half: &HalfBuffer, ring: &DoubleHalfRingBuffer, scratch: &mut Vec<u8>) {
        scratch.resize(half.len(), 0);
        match self {
            Direction::Input => {
                half.read_at(0, scratch);
                ring.write_overwrite(scratch);
            }
            Direction::Output => {
                ring.read_overwrite_padded(scratch);
                half.write_at(0, scratch);
            }
        }
    }
}

pub(crate) struct ChannelRoute {
    pub(crate) direction: Direction,
    pub(crate) ring: Arc<DoubleHalfRingBuffer>,
    pub(crate) halves: [HalfBuffer; 2],
}

/// The one buffer configuration the driver is prepared with.
pub(crate) struct ActiveLayout {
    pub(crate) lines: Vec<Line>,
    pub(crate) routes: Vec<ChannelRoute>,
    pub(crate) ticket: Ticket,
    pub(crate) buffer_frames: usize,
    pub(crate) sample_rate: f64,
    pub(crate) clock: PositionClock,
    pub(crate) switches: u64,
    scratch: Vec<u8>,
}

impl ActiveLayout {
    pub(crate) fn new(
        lines: Vec<Line>,
        routes: Vec<ChannelRoute>,
        ticket: Ticket,
        buffer_frames: usize,
        sample_rate: f64,
    ) -> Self {
        let widest = routes
            .iter()
            .flat_map(|r| r.halves.iter().map(HalfBuffer::len))
            .max()
            .unwrap_or(0);
        Self {
            lines,
            routes,
            ticket,
            buffer_frames,
            sample_rate,
            clock: PositionClock::default(),
            switches: 0,
            scratch: Vec::with_capacity(widest),
        }
    }

    /// Services `index`'s half on every route. `prefill` only fills outputs
    /// and leaves the counters alone.
    pub(crate) fn switch(&mut self, index: usize, time: Option<&TimeInfo>, prefill: bool) {
        let index = index & 1;
        for route in &self.routes {
            if prefill && route.direction == Direction::Input {
                continue;
            }
            route
                .direction
                .service(&route.halves[index], &route.ring, &mut self.scratch);
        }
        if prefill {
            return;
        }
        if let Some(time) = time {
            self.clock.observe(time, host_time_nanos());
        }
        self.switches += 1;
    }

    pub(crate) fn contains(&self, line: &Line) -> bool {
        self.lines.iter().any(|l| l.same(line))
    }
}

/// Routes driver callbacks to the mixer that created the buffers.
pub(crate) struct CallbackBridge {
    mixer: Weak<MixerShared>,
    registry: Weak<RegistryShared>,
}

impl CallbackBridge {
    pub(crate) fn new(mixer: &Arc<MixerShared>, registry: &Arc<RegistryShared>) -> Self {
        Self {
            mixer: Arc::downgrade(mixer),
            registry: Arc::downgrade(registry),
        }
    }
}

impl DriverCallbacks for CallbackBridge {
    fn buffer_switch(&self, index: usize, time: Option<&TimeInfo>, _direct_process: bool) {
        if let Some(shared) = self.mixer.upgrade() {
            Mixer::from_shared(shared).buffer_switch(index, time, false);
        }
    }

    fn sample_rate_did_change(&self, rate: f64) {
        if let Some(registry) = self.registry.upgrade() {
            registry.sample_rate_changed(rate);
        }
    }

    fn asio_message(&self, selector: MessageSelector, value: i64) -> i64 {
        self.registry
            .upgrade()
            .map(|registry| registry.asio_message(selector, value))
            .unwrap_or(0)
    }
}
