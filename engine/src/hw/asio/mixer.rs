use super::dispatch::{ActiveLayout, CallbackBridge, ChannelRoute};
use super::error::{AsioError, DriverError};
use super::events::EventHub;
use super::format::{AudioFormat, POSSIBLE_RATES};
use super::line::{Direction, Line, LineInfo};
use super::registry::{MixerInfo, RegistryShared, Ticket};
use super::transport::{
    BufferRequest, BufferSizes, ChannelInfo, ClockSource, DriverInfo, TimeInfo, Transport,
    host_time_nanos,
};
use crate::hw::latency;
use crate::message::{EventSource, LineEvent, LineEventKind};
use crate::mutex::lock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    Unloaded = 0,
    Loaded = 1,
    Initialized = 2,
    Prepared = 3,
    Running = 4,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Loaded,
            2 => Self::Initialized,
            3 => Self::Prepared,
            4 => Self::Running,
            _ => Self::Unloaded,
        }
    }
}

#[derive(Default)]
struct LineCatalog {
    outputs: Option<Vec<Line>>,
    inputs: Option<Vec<Line>>,
    synchronized: Vec<Line>,
}

pub(crate) struct MixerShared {
    name: String,
    registry: Arc<RegistryShared>,
    status: AtomicU8,
    driver_info: Mutex<Option<DriverInfo>>,
    layout: Mutex<Option<ActiveLayout>>,
    catalog: Mutex<LineCatalog>,
    open_ticket: Mutex<Option<Ticket>>,
    events: EventHub,
}

/// One ASIO driver, addressed by name. Handles are cheap to clone and all
/// refer to the same pooled state.
#[derive(Clone)]
pub struct Mixer {
    pub(crate) shared: Arc<MixerShared>,
}

impl std::fmt::Debug for Mixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mixer")
            .field("name", &self.shared.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Mixer {
    pub(crate) fn new(name: &str, registry: Arc<RegistryShared>) -> Self {
        Self {
            shared: Arc::new(MixerShared {
                name: name.to_string(),
                registry,
                status: AtomicU8::new(Status::Unloaded as u8),
                driver_info: Mutex::new(None),
                layout: Mutex::new(None),
                catalog: Mutex::new(LineCatalog::default()),
                open_ticket: Mutex::new(None),
                events: EventHub::default(),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<MixerShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn registry(&self) -> &Arc<RegistryShared> {
        &self.shared.registry
    }

    pub fn same(&self, other: &Mixer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.shared.status.load(Ordering::Acquire))
    }

    pub fn driver_info(&self) -> Option<DriverInfo> {
        lock(&self.shared.driver_info).clone()
    }

    pub fn info(&self) -> MixerInfo {
        MixerInfo::for_driver(
            self.name(),
            self.driver_info().map(|info| info.driver_version),
        )
    }

    pub fn subscribe(&self) -> UnboundedReceiver<LineEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) fn set_driver_info(&self, info: Option<DriverInfo>) {
        *lock(&self.shared.driver_info) = info;
    }

    /// Only called with the registry lifecycle lock held.
    pub(crate) fn set_status(&self, status: Status) {
        let old = Status::from_u8(self.shared.status.swap(status as u8, Ordering::AcqRel));
        if old == status {
            return;
        }
        debug!("{}: {:?} -> {:?}", self.name(), old, status);
        let crossed = |level: Status| (old < level) != (status < level);
        let kind = if crossed(Status::Running) {
            Some(if status == Status::Running {
                LineEventKind::Start
            } else {
                LineEventKind::Stop
            })
        } else if crossed(Status::Initialized) {
            Some(if status >= Status::Initialized {
                LineEventKind::Open
            } else {
                LineEventKind::Close
            })
        } else {
            None
        };
        if let Some(kind) = kind {
            self.shared.events.emit(LineEvent {
                kind,
                source: EventSource::Mixer {
                    driver: self.name().to_string(),
                },
                frame_position: self.frame_position() as i64,
            });
        }
    }

    /// Claims the driver, loading and initializing it if needed.
    pub fn init(&self) -> Result<Ticket, DriverError> {
        self.registry().init(self)
    }

    /// Releases a claim taken with [`Mixer::init`]. The last claim unloads the
    /// driver.
    pub fn exit(&self, ticket: Ticket) {
        self.registry().exit(self, ticket);
    }

    /// Keeps the driver initialized until [`Mixer::close`].
    pub fn open(&self) -> Result<(), DriverError> {
        if lock(&self.shared.open_ticket).is_some() {
            return Ok(());
        }
        let ticket = self.init()?;
        let previous = lock(&self.shared.open_ticket).replace(ticket);
        if let Some(previous) = previous {
            self.exit(previous);
        }
        Ok(())
    }

    /// Closes every open line, releasing blocked readers and writers, then
    /// gives back the claim taken by [`Mixer::open`].
    pub fn close(&self) {
        let active = lock(&self.shared.layout)
            .as_ref()
            .and_then(|layout| layout.lines.first().cloned());
        if let Some(line) = active {
            self.close_line(&line);
        }
        let ticket = lock(&self.shared.open_ticket).take();
        if let Some(ticket) = ticket {
            self.exit(ticket);
        }
    }

    pub fn is_open(&self) -> bool {
        self.status() >= Status::Initialized
    }

    pub(crate) fn forget_claims(&self) {
        lock(&self.shared.open_ticket).take();
    }

    fn with_driver<T>(
        &self,
        operation: &'static str,
        query: impl FnOnce(&dyn Transport) -> Result<T, AsioError>,
    ) -> Result<T, DriverError> {
        let ticket = self.init()?;
        let result = query(self.registry().transport.as_ref())
            .map_err(|e| self.registry().record_asio(operation, e));
        self.exit(ticket);
        result
    }

    pub fn sample_rate(&self) -> Result<f64, DriverError> {
        self.with_driver("get sample rate", |t| t.sample_rate())
    }

    pub fn set_sample_rate(&self, rate: f64) -> Result<(), DriverError> {
        self.with_driver("set sample rate", |t| t.set_sample_rate(rate))
    }

    pub fn can_sample_rate(&self, rate: f64) -> Result<bool, DriverError> {
        self.with_driver("can sample rate", |t| t.can_sample_rate(rate))
    }

    pub fn buffer_sizes(&self) -> Result<BufferSizes, DriverError> {
        self.with_driver("get buffer size", |t| t.buffer_sizes())
    }

    pub fn preferred_buffer_size(&self) -> Result<usize, DriverError> {
        Ok(self.buffer_sizes()?.preferred)
    }

    /// `(input, output)` in frames.
    pub fn latencies(&self) -> Result<(usize, usize), DriverError> {
        self.with_driver("get latencies", |t| t.latencies())
    }

    pub fn input_channel_count(&self) -> Result<usize, DriverError> {
        Ok(self.with_driver("get channels", |t| t.channels())?.0)
    }

    pub fn output_channel_count(&self) -> Result<usize, DriverError> {
        Ok(self.with_driver("get channels", |t| t.channels())?.1)
    }

    pub fn channel_info(&self, channel: usize, is_input: bool) -> Result<ChannelInfo, DriverError> {
        self.with_driver("get channel info", |t| t.channel_info(channel, is_input))
    }

    pub fn clock_sources(&self) -> Result<Vec<ClockSource>, DriverError> {
        self.with_driver("get clock sources", |t| t.clock_sources())
    }

    pub fn set_clock_source(&self, index: i32) -> Result<(), DriverError> {
        self.with_driver("set clock source", |t| t.set_clock_source(index))
    }

    pub fn driver_version(&self) -> Result<i32, DriverError> {
        if let Some(info) = self.driver_info() {
            return Ok(info.driver_version);
        }
        let ticket = self.init()?;
        let version = self.driver_info().map(|info| info.driver_version);
        self.exit(ticket);
        Ok(version.unwrap_or(0))
    }

    pub fn show_control_panel(&self) -> JoinHandle<Result<(), DriverError>> {
        let mixer = self.clone();
        std::thread::spawn(move || mixer.with_driver("control panel", |t| t.control_panel()))
    }

    pub fn latency_ranges(&self) -> ((usize, usize), (usize, usize)) {
        let frames = lock(&self.shared.layout)
            .as_ref()
            .map(|layout| layout.buffer_frames);
        let frames = match frames {
            Some(frames) => frames,
            None => self.preferred_buffer_size().unwrap_or(0),
        };
        let (input, output) = self.latencies().unwrap_or((0, 0));
        latency::latency_ranges(frames, input, output)
    }

    /// Hardware frames per half of the prepared layout.
    pub fn buffer_frames(&self) -> Option<usize> {
        lock(&self.shared.layout)
            .as_ref()
            .map(|layout| layout.buffer_frames)
    }

    /// Buffer switches serviced since the layout was prepared.
    pub fn switch_count(&self) -> u64 {
        lock(&self.shared.layout)
            .as_ref()
            .map_or(0, |layout| layout.switches)
    }

    pub fn frame_position(&self) -> u64 {
        lock(&self.shared.layout).as_ref().map_or(0, |layout| {
            layout.clock.frames(host_time_nanos(), layout.sample_rate)
        })
    }

    pub fn microsecond_position(&self) -> u64 {
        lock(&self.shared.layout)
            .as_ref()
            .map_or(0, |layout| layout.clock.microseconds(host_time_nanos()))
    }

    fn line_infos(&self, direction: Direction) -> Result<Vec<LineInfo>, DriverError> {
        self.with_driver("get channel info", |t| {
            let (inputs, outputs) = t.channels()?;
            let count = match direction {
                Direction::Input => inputs,
                Direction::Output => outputs,
            };
            let sizes = t.buffer_sizes()?;
            let supported: Vec<f64> = POSSIBLE_RATES
                .iter()
                .copied()
                .filter(|rate| t.can_sample_rate(*rate).unwrap_or(false))
                .collect();
            let mut infos = Vec::with_capacity(count);
            for index in 0..count {
                let channel = t.channel_info(index, direction.is_input())?;
                let formats = channel_formats(&channel, count - index, &supported);
                let sample_bytes = channel.sample_type.container_bytes();
                infos.push(LineInfo {
                    direction,
                    min_buffer_bytes: sizes.min * sample_bytes,
                    max_buffer_bytes: 2 * sizes.max * sample_bytes * (count - index),
                    channel,
                    formats,
                });
            }
            Ok(infos)
        })
    }

    fn lines(&self, direction: Direction) -> Result<Vec<Line>, DriverError> {
        {
            let catalog = lock(&self.shared.catalog);
            let cached = match direction {
                Direction::Input => &catalog.inputs,
                Direction::Output => &catalog.outputs,
            };
            if let Some(lines) = cached {
                return Ok(lines.clone());
            }
        }
        let lines: Vec<Line> = self
            .line_infos(direction)?
            .into_iter()
            .map(|info| Line::new(self, info))
            .collect();
        let mut catalog = lock(&self.shared.catalog);
        let slot = match direction {
            Direction::Input => &mut catalog.inputs,
            Direction::Output => &mut catalog.outputs,
        };
        Ok(slot.get_or_insert(lines).clone())
    }

    /// Output lines, one per hardware output channel.
    pub fn source_lines(&self) -> Result<Vec<Line>, DriverError> {
        self.lines(Direction::Output)
    }

    /// Input lines, one per hardware input channel.
    pub fn target_lines(&self) -> Result<Vec<Line>, DriverError> {
        self.lines(Direction::Input)
    }

    pub fn source_line_infos(&self) -> Result<Vec<LineInfo>, DriverError> {
        Ok(self
            .source_lines()?
            .iter()
            .map(|line| line.info().clone())
            .collect())
    }

    pub fn target_line_infos(&self) -> Result<Vec<LineInfo>, DriverError> {
        Ok(self
            .target_lines()?
            .iter()
            .map(|line| line.info().clone())
            .collect())
    }

    pub fn is_line_supported(&self, info: &LineInfo) -> bool {
        self.line(info).is_ok()
    }

    pub fn line(&self, info: &LineInfo) -> Result<Line, DriverError> {
        self.lines(info.direction)?
            .into_iter()
            .find(|line| line.info().matches(info))
            .ok_or_else(|| {
                DriverError::LineUnavailable(format!(
                    "{:?} channel {}",
                    info.direction, info.channel.channel
                ))
            })
    }

    pub fn output_line(&self, channel: usize) -> Result<Line, DriverError> {
        self.line_at(Direction::Output, channel)
    }

    pub fn input_line(&self, channel: usize) -> Result<Line, DriverError> {
        self.line_at(Direction::Input, channel)
    }

    fn line_at(&self, direction: Direction, channel: usize) -> Result<Line, DriverError> {
        self.lines(direction)?
            .into_iter()
            .nth(channel)
            .ok_or_else(|| DriverError::LineUnavailable(format!("{direction:?} channel {channel}")))
    }

    /// Lines opened and started together. Fails if any of them is open.
    pub fn synchronize(&self, lines: &[Line]) -> Result<(), DriverError> {
        if let Some(open) = lines.iter().find(|line| line.is_open()) {
            return Err(DriverError::UnsupportedFormat(format!(
                "cannot synchronize open line {}",
                open.describe()
            )));
        }
        if let Some(foreign) = lines.iter().find(|line| !line.belongs_to(self)) {
            return Err(DriverError::LineUnavailable(foreign.describe()));
        }
        lock(&self.shared.catalog).synchronized = lines.to_vec();
        Ok(())
    }

    pub fn unsynchronize(&self, lines: &[Line]) {
        lock(&self.shared.catalog)
            .synchronized
            .retain(|line| !lines.iter().any(|l| l.same(line)));
    }

    fn sync_group(&self, line: &Line) -> Vec<Line> {
        let catalog = lock(&self.shared.catalog);
        if catalog.synchronized.iter().any(|l| l.same(line)) {
            catalog.synchronized.clone()
        } else {
            vec![line.clone()]
        }
    }

    fn fit_frames(&self, transport: &dyn Transport, half_frames: Option<usize>) -> Result<usize, DriverError> {
        let options = &self.registry().options;
        let sizes = transport
            .buffer_sizes()
            .map_err(|e| self.registry().record_asio("get buffer size", e))?;
        let requested = half_frames
            .or(options.default_buffer_frames)
            .unwrap_or(sizes.preferred);
        if options.full_check {
            return Ok(sizes.fit(requested));
        }
        let step = options.fallback_granularity.max(1);
        Ok((requested - requested % step).max(step))
    }

    /// Opens `line` together with its synchronization group.
    pub(crate) fn open_line(&self, line: &Line) -> Result<(), DriverError> {
        if line.is_open() {
            return Ok(());
        }
        if self.status() >= Status::Prepared {
            return Err(DriverError::AlreadyActive);
        }
        let group = self.sync_group(line);
        if self.registry().options.full_check {
            for member in &group {
                let format = member.format();
                if !member.info().is_format_supported(&format) {
                    return Err(DriverError::UnsupportedFormat(format.to_string()));
                }
            }
        }
        let ticket = self.init()?;
        if let Err(err) = self.prepare_group(line, &group, ticket) {
            self.exit(ticket);
            return Err(err);
        }
        Ok(())
    }

    fn prepare_group(&self, line: &Line, group: &[Line], ticket: Ticket) -> Result<(), DriverError> {
        let registry = self.registry().clone();
        let transport = registry.transport.clone();
        let frames = self.fit_frames(transport.as_ref(), line.requested_half_frames())?;
        let sample_rate = transport
            .sample_rate()
            .unwrap_or(registry.options.fallback_sample_rate);
        let requests: Vec<BufferRequest> = group
            .iter()
            .flat_map(|member| {
                let first = member.info().channel.channel;
                (0..member.format().channels).map(move |offset| BufferRequest {
                    is_input: member.direction().is_input(),
                    channel: first + offset,
                })
            })
            .collect();
        let callbacks = Arc::new(CallbackBridge::new(&self.shared, &registry));
        let poll = registry.options.poll_interval();
        registry.prepare(self, &requests, frames, callbacks, |halves| {
            let mut halves = halves.into_iter();
            let mut routes = Vec::with_capacity(requests.len());
            let mut opened = Vec::with_capacity(group.len());
            for member in group {
                let rings = member.build_rings(frames, poll)?;
                for ring in &rings {
                    let pair = halves
                        .next()
                        .ok_or(DriverError::asio("create buffers", AsioError::InvalidParameter))?;
                    routes.push(ChannelRoute {
                        direction: member.direction(),
                        ring: ring.clone(),
                        halves: pair,
                    });
                }
                opened.push((member, rings));
            }
            *lock(&self.shared.layout) = Some(ActiveLayout::new(
                group.to_vec(),
                routes,
                ticket,
                frames,
                sample_rate,
            ));
            for (member, rings) in opened {
                member.opened(rings);
            }
            Ok(())
        })
    }

    pub(crate) fn start_line(&self, line: &Line) -> Result<(), DriverError> {
        if !line.is_open() {
            self.open_line(line)?;
        }
        let lines = {
            let mut layout = lock(&self.shared.layout);
            let Some(layout) = layout.as_mut() else {
                return Err(DriverError::InvalidState {
                    required: Status::Prepared,
                    actual: self.status(),
                });
            };
            if !layout.contains(line) {
                return Err(DriverError::AlreadyActive);
            }
            if self.status() < Status::Running {
                layout.clock.reset();
                layout.switch(1, None, true);
            }
            layout.lines.clone()
        };
        self.registry().start(self)?;
        for member in &lines {
            member.set_started(true);
        }
        Ok(())
    }

    pub(crate) fn stop_line(&self, line: &Line) -> Result<(), DriverError> {
        let lines = match lock(&self.shared.layout).as_ref() {
            Some(layout) if layout.contains(line) => layout.lines.clone(),
            _ => return Ok(()),
        };
        self.registry().stop(self)?;
        for member in &lines {
            member.set_started(false);
        }
        Ok(())
    }

    pub(crate) fn close_line(&self, line: &Line) {
        let ticket = match lock(&self.shared.layout).as_ref() {
            Some(layout) if layout.contains(line) => Some(layout.ticket),
            _ => None,
        };
        let Some(ticket) = ticket else {
            line.closed();
            return;
        };
        if let Err(e) = self.registry().unprepare(self) {
            warn!("closing {} left the driver in {:?}: {e}", line.describe(), self.status());
        }
        self.exit(ticket);
    }

    /// Closes every line of the active layout and drops it.
    pub(crate) fn teardown_layout(&self) {
        let layout = lock(&self.shared.layout).take();
        if let Some(layout) = layout {
            for line in &layout.lines {
                line.closed();
            }
        }
    }

    pub(crate) fn buffer_switch(&self, index: usize, time: Option<&TimeInfo>, prefill: bool) {
        if !prefill && self.status() < Status::Running {
            error!(
                "{}: buffer switch while {:?}, ignoring",
                self.name(),
                self.status()
            );
            return;
        }
        if let Some(layout) = lock(&self.shared.layout).as_mut() {
            layout.switch(index, time, prefill);
        }
    }
}

crate::impl_hw_device_for_driver!(Mixer);

/// Formats a line starting at `channel` can be opened with: one channel up to
/// every channel that remains, at each supported rate.
fn channel_formats(channel: &ChannelInfo, max_channels: usize, supported: &[f64]) -> Vec<AudioFormat> {
    let rates: Vec<Option<f64>> = if supported.len() == POSSIBLE_RATES.len() {
        vec![None]
    } else {
        supported.iter().copied().map(Some).collect()
    };
    let mut formats = Vec::with_capacity(rates.len() * max_channels);
    for rate in rates {
        for channels in 1..=max_channels {
            formats.push(AudioFormat::new(rate, channel.sample_type, channels));
        }
    }
    formats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::asio::format::SampleType;

    fn channel() -> ChannelInfo {
        ChannelInfo {
            channel: 0,
            is_input: false,
            is_active: false,
            group: 0,
            sample_type: SampleType::Int16Lsb,
            name: "Out 1".to_string(),
        }
    }

    #[test]
    fn status_ladder_is_ordered() {
        assert!(Status::Unloaded < Status::Loaded);
        assert!(Status::Initialized < Status::Prepared);
        assert!(Status::Prepared < Status::Running);
        assert_eq!(Status::from_u8(Status::Prepared as u8), Status::Prepared);
    }

    #[test]
    fn every_rate_collapses_to_unspecified() {
        let formats = channel_formats(&channel(), 2, &POSSIBLE_RATES);
        assert_eq!(formats.len(), 2);
        assert!(formats.iter().all(|f| f.sample_rate.is_none()));
        assert_eq!(formats[1].channels, 2);
        assert_eq!(formats[1].frame_size, 4);
    }

    #[test]
    fn partial_rate_support_lists_each_rate() {
        let formats = channel_formats(&channel(), 3, &[44_100.0, 48_000.0]);
        assert_eq!(formats.len(), 6);
        assert_eq!(formats[0].sample_rate, Some(44_100.0));
        assert_eq!(formats[5].sample_rate, Some(48_000.0));
        assert_eq!(formats[5].channels, 3);
    }
}
