use super::error::AsioError;
use super::format::SampleType;
use super::half_buffer::HalfBuffer;
use super::transport::{
    BufferRequest, BufferSizes, ChannelInfo, ClockSource, DriverCallbacks, DriverInfo,
    MessageSelector, TIME_SAMPLE_POSITION_VALID, TIME_SAMPLE_RATE_VALID, TIME_SPEED_VALID,
    TIME_SYSTEM_VALID, TimeInfo, Transport, host_time_nanos,
};
use crate::mutex::lock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Description of one simulated driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedDevice {
    pub name: String,
    pub driver_version: i32,
    pub inputs: usize,
    pub outputs: usize,
    pub sample_type: SampleType,
    pub sample_rate: f64,
    pub supported_rates: Vec<f64>,
    pub buffer_sizes: BufferSizes,
    pub input_latency: usize,
    pub output_latency: usize,
    /// Feed each output channel back into the input channel of the same
    /// number.
    pub loopback: bool,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self {
            name: "Drumbox Simulator".to_string(),
            driver_version: 1,
            inputs: 2,
            outputs: 2,
            sample_type: SampleType::Int32Lsb,
            sample_rate: 44_100.0,
            supported_rates: vec![44_100.0, 48_000.0, 96_000.0],
            buffer_sizes: BufferSizes {
                min: 64,
                max: 2048,
                preferred: 512,
                granularity: -1,
            },
            input_latency: 0,
            output_latency: 0,
            loopback: true,
        }
    }
}

impl SimulatedDevice {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Clocking {
    /// Buffer switches happen only through [`SimulatedTransport::tick`].
    #[default]
    Manual,
    /// A worker thread switches once per period while running.
    Realtime,
}

/// Operations that can be told to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Init,
    Exit,
    Start,
    Stop,
    CreateBuffers,
    DisposeBuffers,
    SetSampleRate,
}

struct Prepared {
    requests: Vec<BufferRequest>,
    frames: usize,
    halves: Vec<[HalfBuffer; 2]>,
    callbacks: Arc<dyn DriverCallbacks>,
}

#[derive(Default)]
struct SimState {
    loaded: Option<usize>,
    initialized: bool,
    running: bool,
    sample_rate: f64,
    prepared: Option<Prepared>,
    next_index: usize,
    sample_position: u64,
    failures: HashMap<SimOp, AsioError>,
    calls: HashMap<SimOp, usize>,
    worker: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl SimState {
    fn enter(&mut self, op: SimOp) -> Result<(), AsioError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn take_worker(&mut self) -> Option<(Arc<AtomicBool>, JoinHandle<()>)> {
        let worker = self.worker.take();
        if let Some((stop, _)) = &worker {
            stop.store(true, Ordering::Release);
        }
        worker
    }
}

/// In-process ASIO host. Drives the callbacks from [`SimulatedTransport::tick`]
/// or from its own thread, and exposes the hardware halves for inspection.
#[derive(Clone)]
pub struct SimulatedTransport {
    devices: Arc<Vec<SimulatedDevice>>,
    clocking: Clocking,
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimulatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedTransport")
            .field("devices", &self.devices.len())
            .field("clocking", &self.clocking)
            .field("loaded", &self.loaded_driver())
            .finish()
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(vec![SimulatedDevice::default()])
    }
}

impl SimulatedTransport {
    pub fn new(devices: Vec<SimulatedDevice>) -> Self {
        Self {
            devices: Arc::new(devices),
            clocking: Clocking::Manual,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    pub fn with_clocking(mut self, clocking: Clocking) -> Self {
        self.clocking = clocking;
        self
    }

    fn device(&self, state: &SimState) -> Result<&SimulatedDevice, AsioError> {
        state
            .loaded
            .and_then(|index| self.devices.get(index))
            .ok_or(AsioError::NotPresent)
    }

    fn initialized(&self, state: &SimState) -> Result<&SimulatedDevice, AsioError> {
        if !state.initialized {
            return Err(AsioError::NotPresent);
        }
        self.device(state)
    }

    /// Makes the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: SimOp, err: AsioError) {
        lock(&self.state).failures.insert(op, err);
    }

    /// How often `op` has been called.
    pub fn calls(&self, op: SimOp) -> usize {
        lock(&self.state).calls.get(&op).copied().unwrap_or(0)
    }

    pub fn loaded_driver(&self) -> Option<String> {
        let state = lock(&self.state);
        self.device(&state).ok().map(|device| device.name.clone())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn buffer_frames(&self) -> Option<usize> {
        lock(&self.state).prepared.as_ref().map(|p| p.frames)
    }

    /// Performs one buffer switch. Returns false when the driver is not
    /// running.
    pub fn tick(&self) -> bool {
        let (callbacks, index, time) = {
            let mut state = lock(&self.state);
            let loopback = self.device(&state).is_ok_and(|device| device.loopback);
            let rate = state.sample_rate;
            let position = state.sample_position;
            let index = state.next_index;
            let Some(prepared) = state.prepared.as_ref().filter(|_| state.running) else {
                return false;
            };
            if loopback {
                feed_back(prepared, index);
            }
            let callbacks = prepared.callbacks.clone();
            let frames = prepared.frames as u64;
            state.next_index ^= 1;
            state.sample_position += frames;
            let time = TimeInfo {
                speed: 1.0,
                system_time_nanos: host_time_nanos(),
                sample_position: position,
                sample_rate: rate,
                flags: TIME_SYSTEM_VALID
                    | TIME_SAMPLE_POSITION_VALID
                    | TIME_SAMPLE_RATE_VALID
                    | TIME_SPEED_VALID,
            };
            (callbacks, index, time)
        };
        callbacks.buffer_switch(index, Some(&time), false);
        true
    }

    /// Sends a host message the way a driver would.
    pub fn post_message(&self, selector: MessageSelector, value: i64) -> i64 {
        let callbacks = lock(&self.state)
            .prepared
            .as_ref()
            .map(|p| p.callbacks.clone());
        callbacks.map_or(0, |callbacks| callbacks.asio_message(selector, value))
    }

    fn half(&self, is_input: bool, channel: usize, index: usize) -> Option<HalfBuffer> {
        let state = lock(&self.state);
        let prepared = state.prepared.as_ref()?;
        prepared
            .requests
            .iter()
            .position(|r| r.is_input == is_input && r.channel == channel)
            .map(|slot| prepared.halves[slot][index & 1].clone())
    }

    /// Bytes currently in the given output half.
    pub fn output_half(&self, channel: usize, index: usize) -> Option<Vec<u8>> {
        self.half(false, channel, index).map(|half| half.to_vec())
    }

    /// Overwrites the given input half, as if the hardware had captured
    /// `bytes`.
    pub fn set_input_half(&self, channel: usize, index: usize, bytes: &[u8]) -> bool {
        self.half(true, channel, index)
            .is_some_and(|half| half.write_at(0, bytes) > 0)
    }

    fn spawn_worker(&self, state: &mut SimState) {
        let Some(frames) = state.prepared.as_ref().map(|p| p.frames) else {
            return;
        };
        let rate = if state.sample_rate > 0.0 {
            state.sample_rate
        } else {
            44_100.0
        };
        let period = Duration::from_secs_f64(frames as f64 / rate);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let transport = self.clone();
        let spawned = std::thread::Builder::new()
            .name("asio-sim".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    std::thread::sleep(period);
                    if !transport.tick() {
                        break;
                    }
                }
            });
        match spawned {
            Ok(handle) => state.worker = Some((stop, handle)),
            Err(e) => warn!("failed to spawn simulated clock: {e}"),
        }
    }

    fn join(worker: Option<(Arc<AtomicBool>, JoinHandle<()>)>) {
        if let Some((_, handle)) = worker
            && handle.thread().id() != std::thread::current().id()
            && handle.join().is_err()
        {
            warn!("simulated clock thread panicked");
        }
    }
}

/// Copies each output half into the input half of the same channel number.
fn feed_back(prepared: &Prepared, index: usize) {
    for (slot, request) in prepared.requests.iter().enumerate() {
        if request.is_input {
            continue;
        }
        let target = prepared
            .requests
            .iter()
            .position(|r| r.is_input && r.channel == request.channel);
        if let Some(target) = target {
            let bytes = prepared.halves[slot][index].to_vec();
            prepared.halves[target][index].write_at(0, &bytes);
        }
    }
}

impl Transport for SimulatedTransport {
    fn driver_names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name.clone()).collect()
    }

    fn load_driver(&self, name: &str) -> bool {
        let Some(index) = self.devices.iter().position(|d| d.name == name) else {
            return false;
        };
        let worker = {
            let mut state = lock(&self.state);
            let worker = state.take_worker();
            *state = SimState {
                loaded: Some(index),
                sample_rate: self.devices[index].sample_rate,
                failures: std::mem::take(&mut state.failures),
                calls: std::mem::take(&mut state.calls),
                ..SimState::default()
            };
            worker
        };
        Self::join(worker);
        debug!("simulated driver {name} loaded");
        true
    }

    fn remove_current_driver(&self) {
        let worker = {
            let mut state = lock(&self.state);
            let worker = state.take_worker();
            state.loaded = None;
            state.initialized = false;
            state.running = false;
            state.prepared = None;
            worker
        };
        Self::join(worker);
    }

    fn init(&self) -> Result<DriverInfo, AsioError> {
        let mut state = lock(&self.state);
        state.enter(SimOp::Init)?;
        let device = self.device(&state)?.clone();
        state.initialized = true;
        Ok(DriverInfo {
            asio_version: 2,
            driver_version: device.driver_version,
            name: device.name,
            error_message: String::new(),
        })
    }

    fn exit(&self) -> Result<(), AsioError> {
        let worker = {
            let mut state = lock(&self.state);
            state.enter(SimOp::Exit)?;
            state.initialized = false;
            state.running = false;
            state.prepared = None;
            state.take_worker()
        };
        Self::join(worker);
        Ok(())
    }

    fn start(&self) -> Result<(), AsioError> {
        let mut state = lock(&self.state);
        state.enter(SimOp::Start)?;
        self.initialized(&state)?;
        if state.prepared.is_none() {
            return Err(AsioError::InvalidMode);
        }
        if state.running {
            return Ok(());
        }
        state.running = true;
        state.next_index = 0;
        if self.clocking == Clocking::Realtime {
            self.spawn_worker(&mut state);
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), AsioError> {
        let worker = {
            let mut state = lock(&self.state);
            state.enter(SimOp::Stop)?;
            state.running = false;
            state.take_worker()
        };
        Self::join(worker);
        Ok(())
    }

    fn channels(&self) -> Result<(usize, usize), AsioError> {
        let state = lock(&self.state);
        let device = self.initialized(&state)?;
        Ok((device.inputs, device.outputs))
    }

    fn latencies(&self) -> Result<(usize, usize), AsioError> {
        let state = lock(&self.state);
        let device = self.initialized(&state)?;
        Ok((device.input_latency, device.output_latency))
    }

    fn buffer_sizes(&self) -> Result<BufferSizes, AsioError> {
        let state = lock(&self.state);
        Ok(self.initialized(&state)?.buffer_sizes)
    }

    fn can_sample_rate(&self, rate: f64) -> Result<bool, AsioError> {
        let state = lock(&self.state);
        let device = self.initialized(&state)?;
        Ok(device
            .supported_rates
            .iter()
            .any(|r| (r - rate).abs() < f64::EPSILON))
    }

    fn sample_rate(&self) -> Result<f64, AsioError> {
        let state = lock(&self.state);
        self.initialized(&state)?;
        Ok(state.sample_rate)
    }

    fn set_sample_rate(&self, rate: f64) -> Result<(), AsioError> {
        let callbacks = {
            let mut state = lock(&self.state);
            state.enter(SimOp::SetSampleRate)?;
            let device = self.initialized(&state)?;
            if !device
                .supported_rates
                .iter()
                .any(|r| (r - rate).abs() < f64::EPSILON)
            {
                return Err(AsioError::NoClock);
            }
            if (state.sample_rate - rate).abs() < f64::EPSILON {
                return Ok(());
            }
            state.sample_rate = rate;
            state.prepared.as_ref().map(|p| p.callbacks.clone())
        };
        if let Some(callbacks) = callbacks {
            callbacks.sample_rate_did_change(rate);
        }
        Ok(())
    }

    fn clock_sources(&self) -> Result<Vec<ClockSource>, AsioError> {
        let state = lock(&self.state);
        self.initialized(&state)?;
        Ok(vec![ClockSource {
            index: 0,
            associated_channel: -1,
            associated_group: -1,
            is_current: true,
            name: "Internal".to_string(),
        }])
    }

    fn set_clock_source(&self, index: i32) -> Result<(), AsioError> {
        let state = lock(&self.state);
        self.initialized(&state)?;
        if index == 0 {
            Ok(())
        } else {
            Err(AsioError::InvalidParameter)
        }
    }

    fn channel_info(&self, channel: usize, is_input: bool) -> Result<ChannelInfo, AsioError> {
        let state = lock(&self.state);
        let device = self.initialized(&state)?;
        let count = if is_input {
            device.inputs
        } else {
            device.outputs
        };
        if channel >= count {
            return Err(AsioError::InvalidParameter);
        }
        let is_active = state
            .prepared
            .as_ref()
            .is_some_and(|p| p.requests.contains(&BufferRequest { is_input, channel }));
        Ok(ChannelInfo {
            channel,
            is_input,
            is_active,
            group: 0,
            sample_type: device.sample_type,
            name: format!("{} {}", if is_input { "In" } else { "Out" }, channel + 1),
        })
    }

    fn create_buffers(
        &self,
        requests: &[BufferRequest],
        buffer_frames: usize,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> Result<Vec<[HalfBuffer; 2]>, AsioError> {
        let mut state = lock(&self.state);
        state.enter(SimOp::CreateBuffers)?;
        let device = self.initialized(&state)?;
        if state.prepared.is_some() {
            return Err(AsioError::InvalidMode);
        }
        let sizes = device.buffer_sizes;
        if requests.is_empty() || buffer_frames < sizes.min || buffer_frames > sizes.max {
            return Err(AsioError::InvalidMode);
        }
        for request in requests {
            let count = if request.is_input {
                device.inputs
            } else {
                device.outputs
            };
            if request.channel >= count {
                return Err(AsioError::InvalidParameter);
            }
        }
        let half_len = buffer_frames * device.sample_type.container_bytes();
        let halves: Vec<[HalfBuffer; 2]> = requests
            .iter()
            .map(|_| [HalfBuffer::zeroed(half_len), HalfBuffer::zeroed(half_len)])
            .collect();
        state.prepared = Some(Prepared {
            requests: requests.to_vec(),
            frames: buffer_frames,
            halves: halves.clone(),
            callbacks,
        });
        Ok(halves)
    }

    fn dispose_buffers(&self) -> Result<(), AsioError> {
        let worker = {
            let mut state = lock(&self.state);
            state.enter(SimOp::DisposeBuffers)?;
            if state.prepared.take().is_none() {
                return Err(AsioError::InvalidMode);
            }
            state.running = false;
            state.take_worker()
        };
        Self::join(worker);
        Ok(())
    }

    fn control_panel(&self) -> Result<(), AsioError> {
        let state = lock(&self.state);
        self.initialized(&state)?;
        Ok(())
    }
}
