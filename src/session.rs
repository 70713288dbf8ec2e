use crate::config::AppConfig;
use drumbox_engine::hw::asio::convert::{decode_interleaved, encode_interleaved};
use drumbox_engine::hw::asio::{ClockSource, DriverInfo};
use drumbox_engine::{
    AsioListener, AudioFormat, BufferSizes, Clocking, DriverRegistry, LibraryTransport, Line,
    LineEvent, LineInfo, Mixer, SimulatedDevice, SimulatedTransport, Transport,
};
use serde::Serialize;
use std::error::Error;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

pub type AppResult<T> = Result<T, Box<dyn Error>>;

struct LogListener;

impl AsioListener for LogListener {
    fn sample_rate_changed(&self, mixer: &Mixer, rate: f64) {
        info!("{}: sample rate is now {rate}", mixer.name());
    }

    fn reset_request(&self, mixer: &Mixer) {
        warn!("{} was reset by the driver", mixer.name());
    }
}

pub fn registry(config: &AppConfig, simulate: bool) -> AppResult<DriverRegistry> {
    let transport: Arc<dyn Transport> = if simulate || config.driver.simulate {
        let device: SimulatedDevice = config.simulator.clone();
        info!("using simulated driver '{}'", device.name);
        Arc::new(SimulatedTransport::new(vec![device]).with_clocking(Clocking::Realtime))
    } else {
        match &config.driver.library {
            Some(path) => Arc::new(LibraryTransport::open(path)?),
            None => Arc::new(LibraryTransport::from_env()?),
        }
    };
    let registry = DriverRegistry::new(transport, config.asio.clone());
    registry.add_listener(Arc::new(LogListener));
    Ok(registry)
}

/// The named driver, the configured one, or the first one found.
pub fn mixer(registry: &DriverRegistry, config: &AppConfig, name: Option<&str>) -> AppResult<Mixer> {
    let name = match name.or(config.driver.name.as_deref()) {
        Some(name) => name.to_string(),
        None => registry
            .driver_names()
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::other("no ASIO drivers installed"))?,
    };
    Ok(registry.mixer(&name)?)
}

pub fn log_events(rx: &mut UnboundedReceiver<LineEvent>) {
    while let Ok(event) = rx.try_recv() {
        info!(
            "{:?} from {:?} at frame {}",
            event.kind, event.source, event.frame_position
        );
    }
}

fn mono_format(line: &Line) -> AudioFormat {
    AudioFormat::new(None, line.info().channel.sample_type, 1)
}

/// Plays mono `samples` on output `channel` and waits until they are heard.
pub fn play(mixer: &Mixer, channel: usize, samples: &[f32]) -> AppResult<()> {
    let mut mixer_events = mixer.subscribe();
    let line = mixer.output_line(channel)?;
    let mut line_events = line.subscribe();
    let format = mono_format(&line);
    let mut bytes = Vec::with_capacity(samples.len() * format.frame_size);
    encode_interleaved(format.sample_type, samples, &mut bytes);

    line.open(Some(format))?;
    info!("playing {} frames through {}", samples.len(), line.info().channel.name);
    let queued = line.write(&bytes)?;
    line.start()?;
    let written = queued + line.write(&bytes[queued..])?;
    line.drain()?;
    line.close();
    log_events(&mut mixer_events);
    log_events(&mut line_events);
    if written < bytes.len() {
        warn!("line stopped after {written} of {} bytes", bytes.len());
    }
    Ok(())
}

/// Captures `seconds` of input `channel` as mono samples.
pub fn record(mixer: &Mixer, channel: usize, seconds: f64) -> AppResult<(Vec<f32>, f64)> {
    let line = mixer.input_line(channel)?;
    let mut line_events = line.subscribe();
    let format = mono_format(&line);
    line.open(Some(format))?;
    let rate = mixer.sample_rate()?;
    let frames = (seconds * rate).round() as usize;
    let mut bytes = vec![0_u8; frames * format.frame_size];
    line.start()?;
    let captured = line.read(&mut bytes)?;
    line.stop()?;
    line.close();
    log_events(&mut line_events);
    let mut samples = Vec::with_capacity(frames);
    decode_interleaved(format.sample_type, &bytes[..captured], &mut samples);
    Ok((samples, rate))
}

#[derive(Debug, Serialize)]
pub struct Description {
    pub driver: String,
    pub info: Option<DriverInfo>,
    pub sample_rate: f64,
    pub buffer_sizes: BufferSizes,
    pub latencies: (usize, usize),
    pub clock_sources: Vec<ClockSource>,
    pub outputs: Vec<LineInfo>,
    pub inputs: Vec<LineInfo>,
}

pub fn describe(mixer: &Mixer) -> AppResult<Description> {
    let ticket = mixer.init()?;
    let description = (|| -> AppResult<Description> {
        Ok(Description {
            driver: mixer.name().to_string(),
            info: mixer.driver_info(),
            sample_rate: mixer.sample_rate()?,
            buffer_sizes: mixer.buffer_sizes()?,
            latencies: mixer.latencies()?,
            clock_sources: mixer.clock_sources()?,
            outputs: mixer.source_line_infos()?,
            inputs: mixer.target_line_infos()?,
        })
    })();
    mixer.exit(ticket);
    description
}
