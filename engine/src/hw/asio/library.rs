use super::error::{ASE_NO_CLOCK, AsioError, DriverError};
use super::format::SampleType;
use super::half_buffer::HalfBuffer;
use super::transport::{
    BufferRequest, BufferSizes, ChannelInfo, ClockSource, DriverCallbacks, DriverInfo,
    MessageSelector, TIME_SAMPLE_POSITION_VALID, TIME_SYSTEM_VALID, TimeInfo, Transport,
};
use crate::hw::config::{ASIO_LIBRARY_ENV, env_path};
use crate::mutex::lock;
use libloading::Library;
use std::ffi::{CString, c_char, c_long, c_void};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

const HOST_LIBRARY: &str = "drumbox_asio_host";

#[repr(C)]
#[allow(dead_code)]
struct RawDriverInfo {
    asio_version: c_long,
    driver_version: c_long,
    name: [c_char; 32],
    error_message: [c_char; 124],
    sys_ref: *mut c_void,
}

#[repr(C)]
struct RawChannelInfo {
    channel: c_long,
    is_input: c_long,
    is_active: c_long,
    channel_group: c_long,
    sample_type: c_long,
    name: [c_char; 32],
}

#[repr(C)]
struct RawBufferInfo {
    is_input: c_long,
    channel_num: c_long,
    buffers: [*mut c_void; 2],
}

#[repr(C)]
struct RawClockSource {
    index: c_long,
    associated_channel: c_long,
    associated_group: c_long,
    is_current_source: c_long,
    name: [c_char; 32],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RawSamples {
    hi: u32,
    lo: u32,
}

impl RawSamples {
    fn value(self) -> u64 {
        (u64::from(self.hi) << 32) | u64::from(self.lo)
    }
}

#[repr(C)]
#[allow(dead_code)]
struct RawTimeInfo {
    speed: f64,
    system_time: RawSamples,
    sample_position: RawSamples,
    sample_rate: f64,
    flags: u32,
    reserved: [c_char; 12],
}

#[repr(C)]
#[allow(dead_code)]
struct RawTimeCode {
    speed: f64,
    time_code_samples: RawSamples,
    flags: u32,
    future: [c_char; 64],
}

#[repr(C)]
#[allow(dead_code)]
struct RawTime {
    reserved: [c_long; 4],
    time_info: RawTimeInfo,
    time_code: RawTimeCode,
}

#[repr(C)]
struct RawCallbacks {
    buffer_switch: extern "C" fn(c_long, c_long),
    sample_rate_did_change: extern "C" fn(f64),
    asio_message: extern "C" fn(c_long, c_long, *mut c_void, *mut f64) -> c_long,
    buffer_switch_time_info: extern "C" fn(*mut RawTime, c_long, c_long) -> *mut RawTime,
}

static CALLBACK_TABLE: RawCallbacks = RawCallbacks {
    buffer_switch: on_buffer_switch,
    sample_rate_did_change: on_sample_rate_did_change,
    asio_message: on_asio_message,
    buffer_switch_time_info: on_buffer_switch_time_info,
};

type NoArgs = unsafe extern "C" fn() -> c_long;
type LongPair = unsafe extern "C" fn(*mut c_long, *mut c_long) -> c_long;
type GetBufferSize = unsafe extern "C" fn(*mut c_long, *mut c_long, *mut c_long, *mut c_long) -> c_long;
type RateArg = unsafe extern "C" fn(f64) -> c_long;
type RateOut = unsafe extern "C" fn(*mut f64) -> c_long;
type SamplePosition = unsafe extern "C" fn(*mut RawSamples, *mut RawSamples) -> c_long;

/// Entry points of the host shim, resolved once at load time.
struct HostApi {
    driver_count: unsafe extern "C" fn() -> c_long,
    driver_name: unsafe extern "C" fn(c_long, *mut c_char, c_long) -> c_long,
    load_driver: unsafe extern "C" fn(*const c_char) -> c_long,
    remove_current_driver: unsafe extern "C" fn(),
    init: unsafe extern "C" fn(*mut RawDriverInfo) -> c_long,
    exit: NoArgs,
    start: NoArgs,
    stop: NoArgs,
    get_channels: LongPair,
    get_latencies: LongPair,
    get_buffer_size: GetBufferSize,
    can_sample_rate: RateArg,
    get_sample_rate: RateOut,
    set_sample_rate: RateArg,
    get_clock_sources: unsafe extern "C" fn(*mut RawClockSource, *mut c_long) -> c_long,
    set_clock_source: unsafe extern "C" fn(c_long) -> c_long,
    get_channel_info: unsafe extern "C" fn(*mut RawChannelInfo) -> c_long,
    create_buffers: unsafe extern "C" fn(*mut RawBufferInfo, c_long, c_long, *const RawCallbacks) -> c_long,
    dispose_buffers: NoArgs,
    control_panel: NoArgs,
    get_sample_position: SamplePosition,
    // Keeps every pointer above valid.
    _library: Library,
}

impl HostApi {
    fn load(path: &Path) -> Result<Self, libloading::Error> {
        let library = unsafe { Library::new(path)? };
        unsafe {
            Ok(Self {
                driver_count: *library.get(b"drumbox_asio_driver_count\0")?,
                driver_name: *library.get(b"drumbox_asio_driver_name\0")?,
                load_driver: *library.get(b"drumbox_asio_load_driver\0")?,
                remove_current_driver: *library.get(b"drumbox_asio_remove_current_driver\0")?,
                init: *library.get(b"ASIOInit\0")?,
                exit: *library.get(b"ASIOExit\0")?,
                start: *library.get(b"ASIOStart\0")?,
                stop: *library.get(b"ASIOStop\0")?,
                get_channels: *library.get(b"ASIOGetChannels\0")?,
                get_latencies: *library.get(b"ASIOGetLatencies\0")?,
                get_buffer_size: *library.get(b"ASIOGetBufferSize\0")?,
                can_sample_rate: *library.get(b"ASIOCanSampleRate\0")?,
                get_sample_rate: *library.get(b"ASIOGetSampleRate\0")?,
                set_sample_rate: *library.get(b"ASIOSetSampleRate\0")?,
                get_clock_sources: *library.get(b"ASIOGetClockSources\0")?,
                set_clock_source: *library.get(b"ASIOSetClockSource\0")?,
                get_channel_info: *library.get(b"ASIOGetChannelInfo\0")?,
                create_buffers: *library.get(b"ASIOCreateBuffers\0")?,
                dispose_buffers: *library.get(b"ASIODisposeBuffers\0")?,
                control_panel: *library.get(b"ASIOControlPanel\0")?,
                get_sample_position: *library.get(b"ASIOGetSamplePosition\0")?,
                _library: library,
            })
        }
    }
}

/// Where driver callbacks go. The driver calls plain C functions without a
/// context pointer, so there is exactly one target per process.
struct CallbackTarget {
    callbacks: Arc<dyn DriverCallbacks>,
    api: Arc<HostApi>,
}

static TARGET: Mutex<Option<CallbackTarget>> = Mutex::new(None);

fn target() -> Option<(Arc<dyn DriverCallbacks>, Arc<HostApi>)> {
    lock(&TARGET)
        .as_ref()
        .map(|t| (t.callbacks.clone(), t.api.clone()))
}

extern "C" fn on_buffer_switch(index: c_long, direct_process: c_long) {
    let Some((callbacks, api)) = target() else {
        return;
    };
    let mut position = RawSamples::default();
    let mut stamp = RawSamples::default();
    let code = unsafe { (api.get_sample_position)(&mut position, &mut stamp) };
    let time = AsioError::check(code as i32).ok().map(|()| TimeInfo {
        speed: 1.0,
        system_time_nanos: stamp.value(),
        sample_position: position.value(),
        sample_rate: 0.0,
        flags: TIME_SYSTEM_VALID | TIME_SAMPLE_POSITION_VALID,
    });
    callbacks.buffer_switch(index as usize, time.as_ref(), direct_process != 0);
}

extern "C" fn on_buffer_switch_time_info(
    params: *mut RawTime,
    index: c_long,
    direct_process: c_long,
) -> *mut RawTime {
    let Some((callbacks, _)) = target() else {
        return std::ptr::null_mut();
    };
    let time = unsafe { params.as_ref() }.map(|raw| {
        let info = &raw.time_info;
        TimeInfo {
            speed: info.speed,
            system_time_nanos: info.system_time.value(),
            sample_position: info.sample_position.value(),
            sample_rate: info.sample_rate,
            flags: info.flags,
        }
    });
    callbacks.buffer_switch(index as usize, time.as_ref(), direct_process != 0);
    std::ptr::null_mut()
}

extern "C" fn on_sample_rate_did_change(rate: f64) {
    if let Some((callbacks, _)) = target() {
        callbacks.sample_rate_did_change(rate);
    }
}

extern "C" fn on_asio_message(
    selector: c_long,
    value: c_long,
    _message: *mut c_void,
    _opt: *mut f64,
) -> c_long {
    target().map_or(0, |(callbacks, _)| {
        callbacks.asio_message(MessageSelector::from_code(selector as i32), value as i64) as c_long
    })
}

fn fixed_cstr(raw: &[c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn check(code: c_long) -> Result<(), AsioError> {
    AsioError::check(code as i32)
}

/// Transport over a native host shim that wraps the ASIO SDK's driver list
/// and exports the SDK's C entry points.
pub struct LibraryTransport {
    api: Arc<HostApi>,
}

impl std::fmt::Debug for LibraryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryTransport")
            .field("library", &"<host>")
            .finish()
    }
}

impl LibraryTransport {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let path = path.as_ref();
        let api = HostApi::load(path)?;
        info!("loaded ASIO host library {}", path.display());
        Ok(Self { api: Arc::new(api) })
    }

    /// Opens the library named by the environment, or the platform's default
    /// file name for the host shim.
    pub fn from_env() -> Result<Self, DriverError> {
        match env_path(ASIO_LIBRARY_ENV) {
            Some(path) => Self::open(path),
            None => Self::open(libloading::library_filename(HOST_LIBRARY)),
        }
    }

    fn long_pair(&self, call: LongPair) -> Result<(usize, usize), AsioError> {
        let (mut a, mut b): (c_long, c_long) = (0, 0);
        check(unsafe { call(&mut a, &mut b) })?;
        Ok((a.max(0) as usize, b.max(0) as usize))
    }
}

impl Transport for LibraryTransport {
    fn driver_names(&self) -> Vec<String> {
        let count = unsafe { (self.api.driver_count)() };
        (0..count)
            .filter_map(|index| {
                let mut name = [0 as c_char; 32];
                let ok = unsafe { (self.api.driver_name)(index, name.as_mut_ptr(), 32) };
                (ok != 0).then(|| fixed_cstr(&name))
            })
            .collect()
    }

    fn load_driver(&self, name: &str) -> bool {
        let Ok(name) = CString::new(name) else {
            return false;
        };
        unsafe { (self.api.load_driver)(name.as_ptr()) != 0 }
    }

    fn remove_current_driver(&self) {
        unsafe { (self.api.remove_current_driver)() };
        lock(&TARGET).take();
    }

    fn init(&self) -> Result<DriverInfo, AsioError> {
        let mut raw = RawDriverInfo {
            asio_version: 2,
            driver_version: 0,
            name: [0; 32],
            error_message: [0; 124],
            sys_ref: std::ptr::null_mut(),
        };
        let code = unsafe { (self.api.init)(&mut raw) };
        if let Err(e) = check(code) {
            error!("ASIOInit failed: {}", fixed_cstr(&raw.error_message));
            return Err(e);
        }
        Ok(DriverInfo {
            asio_version: raw.asio_version as i32,
            driver_version: raw.driver_version as i32,
            name: fixed_cstr(&raw.name),
            error_message: fixed_cstr(&raw.error_message),
        })
    }

    fn exit(&self) -> Result<(), AsioError> {
        check(unsafe { (self.api.exit)() })
    }

    fn start(&self) -> Result<(), AsioError> {
        check(unsafe { (self.api.start)() })
    }

    fn stop(&self) -> Result<(), AsioError> {
        check(unsafe { (self.api.stop)() })
    }

    fn channels(&self) -> Result<(usize, usize), AsioError> {
        self.long_pair(self.api.get_channels)
    }

    fn latencies(&self) -> Result<(usize, usize), AsioError> {
        self.long_pair(self.api.get_latencies)
    }

    fn buffer_sizes(&self) -> Result<BufferSizes, AsioError> {
        let (mut min, mut max, mut preferred, mut granularity): (c_long, c_long, c_long, c_long) =
            (0, 0, 0, 0);
        check(unsafe {
            (self.api.get_buffer_size)(&mut min, &mut max, &mut preferred, &mut granularity)
        })?;
        Ok(BufferSizes {
            min: min.max(0) as usize,
            max: max.max(0) as usize,
            preferred: preferred.max(0) as usize,
            granularity: granularity as i32,
        })
    }

    fn can_sample_rate(&self, rate: f64) -> Result<bool, AsioError> {
        match unsafe { (self.api.can_sample_rate)(rate) } as i32 {
            ASE_NO_CLOCK => Ok(false),
            code => AsioError::check(code).map(|()| true),
        }
    }

    fn sample_rate(&self) -> Result<f64, AsioError> {
        let mut rate = 0.0;
        check(unsafe { (self.api.get_sample_rate)(&mut rate) })?;
        Ok(rate)
    }

    fn set_sample_rate(&self, rate: f64) -> Result<(), AsioError> {
        check(unsafe { (self.api.set_sample_rate)(rate) })
    }

    fn clock_sources(&self) -> Result<Vec<ClockSource>, AsioError> {
        let mut raw: Vec<RawClockSource> = (0..16)
            .map(|_| RawClockSource {
                index: 0,
                associated_channel: 0,
                associated_group: 0,
                is_current_source: 0,
                name: [0; 32],
            })
            .collect();
        let mut count = raw.len() as c_long;
        check(unsafe { (self.api.get_clock_sources)(raw.as_mut_ptr(), &mut count) })?;
        raw.truncate(count.clamp(0, 16) as usize);
        Ok(raw
            .iter()
            .map(|source| ClockSource {
                index: source.index as i32,
                associated_channel: source.associated_channel as i32,
                associated_group: source.associated_group as i32,
                is_current: source.is_current_source != 0,
                name: fixed_cstr(&source.name),
            })
            .collect())
    }

    fn set_clock_source(&self, index: i32) -> Result<(), AsioError> {
        check(unsafe { (self.api.set_clock_source)(index as c_long) })
    }

    fn channel_info(&self, channel: usize, is_input: bool) -> Result<ChannelInfo, AsioError> {
        let mut raw = RawChannelInfo {
            channel: channel as c_long,
            is_input: c_long::from(is_input),
            is_active: 0,
            channel_group: 0,
            sample_type: 0,
            name: [0; 32],
        };
        check(unsafe { (self.api.get_channel_info)(&mut raw) })?;
        let sample_type = SampleType::from_code(raw.sample_type as i32).ok_or_else(|| {
            warn!("channel {channel} reports unknown sample type {}", raw.sample_type);
            AsioError::InvalidMode
        })?;
        Ok(ChannelInfo {
            channel,
            is_input,
            is_active: raw.is_active != 0,
            group: raw.channel_group as i32,
            sample_type,
            name: fixed_cstr(&raw.name),
        })
    }

    fn create_buffers(
        &self,
        requests: &[BufferRequest],
        buffer_frames: usize,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> Result<Vec<[HalfBuffer; 2]>, AsioError> {
        let mut raw: Vec<RawBufferInfo> = requests
            .iter()
            .map(|request| RawBufferInfo {
                is_input: c_long::from(request.is_input),
                channel_num: request.channel as c_long,
                buffers: [std::ptr::null_mut(); 2],
            })
            .collect();
        let mut sample_bytes = Vec::with_capacity(requests.len());
        for request in requests {
            sample_bytes.push(
                self.channel_info(request.channel, request.is_input)?
                    .sample_type
                    .container_bytes(),
            );
        }
        *lock(&TARGET) = Some(CallbackTarget {
            callbacks,
            api: self.api.clone(),
        });
        let code = unsafe {
            (self.api.create_buffers)(
                raw.as_mut_ptr(),
                raw.len() as c_long,
                buffer_frames as c_long,
                &CALLBACK_TABLE,
            )
        };
        if let Err(e) = check(code) {
            lock(&TARGET).take();
            return Err(e);
        }
        let mut halves = Vec::with_capacity(raw.len());
        for (info, bytes) in raw.iter().zip(sample_bytes) {
            let len = buffer_frames * bytes;
            let pair = match (
                NonNull::new(info.buffers[0].cast::<u8>()),
                NonNull::new(info.buffers[1].cast::<u8>()),
            ) {
                // The driver keeps both halves alive until dispose_buffers.
                (Some(first), Some(second)) => unsafe {
                    [HalfBuffer::from_raw(first, len), HalfBuffer::from_raw(second, len)]
                },
                _ => {
                    if let Err(e) = self.dispose_buffers() {
                        warn!("ASIODisposeBuffers failed: {e}");
                    }
                    return Err(AsioError::NoMemory);
                }
            };
            halves.push(pair);
        }
        debug!(
            "created {} ASIO buffer pair(s) of {buffer_frames} frames",
            halves.len()
        );
        Ok(halves)
    }

    fn dispose_buffers(&self) -> Result<(), AsioError> {
        let result = check(unsafe { (self.api.dispose_buffers)() });
        lock(&TARGET).take();
        result
    }

    fn control_panel(&self) -> Result<(), AsioError> {
        check(unsafe { (self.api.control_panel)() })
    }
}
