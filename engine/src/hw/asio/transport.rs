use super::error::AsioError;
use super::format::SampleType;
use super::half_buffer::HalfBuffer;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub asio_version: i32,
    pub driver_version: i32,
    pub name: String,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel: usize,
    pub is_input: bool,
    pub is_active: bool,
    pub group: i32,
    pub sample_type: SampleType,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSource {
    pub index: i32,
    pub associated_channel: i32,
    pub associated_group: i32,
    pub is_current: bool,
    pub name: String,
}

/// One hardware channel to allocate double buffers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRequest {
    pub is_input: bool,
    pub channel: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSizes {
    pub min: usize,
    pub max: usize,
    pub preferred: usize,
    /// 0 when only `preferred` is possible, -1 for powers of two, otherwise
    /// the step between allowed sizes.
    pub granularity: i32,
}

impl BufferSizes {
    /// Clamps `frames` into `[min, max]` and rounds it down to an allowed
    /// size.
    pub fn fit(&self, frames: usize) -> usize {
        let (min, max) = (self.min.min(self.max), self.min.max(self.max));
        let clamped = frames.clamp(min, max);
        let fitted = match self.granularity {
            0 => self.preferred,
            -1 => {
                let mut size = 1;
                while size * 2 <= clamped {
                    size *= 2;
                }
                size
            }
            step if step > 0 => clamped - clamped % step as usize,
            _ => clamped,
        };
        fitted.clamp(min, max)
    }
}

pub const TIME_SYSTEM_VALID: u32 = 1;
pub const TIME_SAMPLE_POSITION_VALID: u32 = 1 << 1;
pub const TIME_SAMPLE_RATE_VALID: u32 = 1 << 2;
pub const TIME_SPEED_VALID: u32 = 1 << 3;
pub const TIME_SAMPLE_RATE_CHANGED: u32 = 1 << 4;
pub const TIME_CLOCK_SOURCE_CHANGED: u32 = 1 << 5;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeInfo {
    pub speed: f64,
    pub system_time_nanos: u64,
    pub sample_position: u64,
    pub sample_rate: f64,
    pub flags: u32,
}

impl TimeInfo {
    pub fn system_time_valid(&self) -> bool {
        self.flags & TIME_SYSTEM_VALID != 0
    }

    pub fn sample_position_valid(&self) -> bool {
        self.flags & TIME_SAMPLE_POSITION_VALID != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageSelector {
    SelectorSupported,
    EngineVersion,
    ResetRequest,
    BufferSizeChange,
    ResyncRequest,
    LatenciesChanged,
    SupportsTimeInfo,
    SupportsTimeCode,
    Other(i32),
}

impl MessageSelector {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::SelectorSupported,
            2 => Self::EngineVersion,
            3 => Self::ResetRequest,
            4 => Self::BufferSizeChange,
            5 => Self::ResyncRequest,
            6 => Self::LatenciesChanged,
            7 => Self::SupportsTimeInfo,
            8 => Self::SupportsTimeCode,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::SelectorSupported => 1,
            Self::EngineVersion => 2,
            Self::ResetRequest => 3,
            Self::BufferSizeChange => 4,
            Self::ResyncRequest => 5,
            Self::LatenciesChanged => 6,
            Self::SupportsTimeInfo => 7,
            Self::SupportsTimeCode => 8,
            Self::Other(code) => code,
        }
    }
}

/// Entry points the driver calls back into. `buffer_switch` runs on the
/// driver's real-time thread and must not block.
pub trait DriverCallbacks: Send + Sync {
    fn buffer_switch(&self, index: usize, time: Option<&TimeInfo>, direct_process: bool);
    fn sample_rate_did_change(&self, rate: f64);
    fn asio_message(&self, selector: MessageSelector, value: i64) -> i64;
}

/// The narrow native surface of one process-wide ASIO host.
///
/// At most one driver is loaded at a time. Every query other than the driver
/// list and `load_driver` requires a loaded and initialized driver.
pub trait Transport: Send + Sync {
    fn driver_names(&self) -> Vec<String>;
    fn load_driver(&self, name: &str) -> bool;
    fn remove_current_driver(&self);

    fn init(&self) -> Result<DriverInfo, AsioError>;
    fn exit(&self) -> Result<(), AsioError>;
    fn start(&self) -> Result<(), AsioError>;
    fn stop(&self) -> Result<(), AsioError>;

    /// `(inputs, outputs)`.
    fn channels(&self) -> Result<(usize, usize), AsioError>;
    /// `(input, output)` in frames.
    fn latencies(&self) -> Result<(usize, usize), AsioError>;
    fn buffer_sizes(&self) -> Result<BufferSizes, AsioError>;
    fn can_sample_rate(&self, rate: f64) -> Result<bool, AsioError>;
    fn sample_rate(&self) -> Result<f64, AsioError>;
    fn set_sample_rate(&self, rate: f64) -> Result<(), AsioError>;
    fn clock_sources(&self) -> Result<Vec<ClockSource>, AsioError>;
    fn set_clock_source(&self, index: i32) -> Result<(), AsioError>;
    fn channel_info(&self, channel: usize, is_input: bool) -> Result<ChannelInfo, AsioError>;

    /// Allocates one pair of halves per request, in request order.
    fn create_buffers(
        &self,
        requests: &[BufferRequest],
        buffer_frames: usize,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> Result<Vec<[HalfBuffer; 2]>, AsioError>;
    fn dispose_buffers(&self) -> Result<(), AsioError>;
    fn control_panel(&self) -> Result<(), AsioError>;
}

pub fn host_time_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
