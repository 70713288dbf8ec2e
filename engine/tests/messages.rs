use drumbox_engine::hw::asio::MessageSelector;
use drumbox_engine::{
    AsioListener, DriverOptions, DriverRegistry, Mixer, SimulatedDevice, SimulatedTransport,
    Status,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, PartialEq)]
enum Heard {
    Rate(f64),
    Reset(String),
}

struct Recorder {
    tx: Mutex<Sender<Heard>>,
    accepts_size_changes: bool,
    resyncs: AtomicUsize,
}

impl Recorder {
    fn new(tx: Sender<Heard>, accepts_size_changes: bool) -> Arc<Self> {
        Arc::new(Self {
            tx: Mutex::new(tx),
            accepts_size_changes,
            resyncs: AtomicUsize::new(0),
        })
    }

    fn send(&self, heard: Heard) {
        let _ = self.tx.lock().unwrap().send(heard);
    }
}

impl AsioListener for Recorder {
    fn sample_rate_changed(&self, _mixer: &Mixer, rate: f64) {
        self.send(Heard::Rate(rate));
    }

    fn reset_request(&self, mixer: &Mixer) {
        self.send(Heard::Reset(mixer.name().to_string()));
    }

    fn supports_buffer_size_change(&self) -> bool {
        self.accepts_size_changes
    }

    fn buffer_size_changed(&self, _mixer: &Mixer, frames: usize) -> bool {
        frames == 256
    }

    fn supports_resync_request(&self) -> bool {
        true
    }

    fn resync_request(&self, _mixer: &Mixer) -> bool {
        self.resyncs.fetch_add(1, Ordering::SeqCst);
        true
    }
}

fn prepared() -> (SimulatedTransport, DriverRegistry, Mixer) {
    let sim = SimulatedTransport::new(vec![SimulatedDevice::default()]);
    let registry = DriverRegistry::new(Arc::new(sim.clone()), DriverOptions::default());
    let mixer = registry.mixer("Drumbox Simulator").unwrap();
    (sim, registry, mixer)
}

#[test]
fn host_capabilities_are_answered() {
    let (sim, _registry, mixer) = prepared();
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();

    assert_eq!(sim.post_message(MessageSelector::EngineVersion, 0), 2);
    assert_eq!(sim.post_message(MessageSelector::SupportsTimeInfo, 0), 1);
    assert_eq!(sim.post_message(MessageSelector::SupportsTimeCode, 0), 0);
    assert_eq!(sim.post_message(MessageSelector::Other(42), 0), 0);

    let reset = i64::from(MessageSelector::ResetRequest.code());
    assert_eq!(sim.post_message(MessageSelector::SelectorSupported, reset), 1);
    assert_eq!(sim.post_message(MessageSelector::SelectorSupported, 1), 0);
    assert_eq!(sim.post_message(MessageSelector::SelectorSupported, 42), 0);
    line.close();
}

#[test]
fn reset_request_unloads_then_notifies() {
    let (sim, registry, mixer) = prepared();
    let (tx, rx) = channel();
    registry.add_listener(Recorder::new(tx, false));
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();
    line.start().unwrap();

    assert_eq!(sim.post_message(MessageSelector::ResetRequest, 0), 1);
    let heard = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(heard, Heard::Reset("Drumbox Simulator".to_string()));
    assert_eq!(mixer.status(), Status::Unloaded);
    assert!(!line.is_open());
    assert!(registry.active_mixer().is_none());

    // Reopens cleanly afterwards.
    line.open(None).unwrap();
    assert_eq!(mixer.status(), Status::Prepared);
    line.close();
}

#[test]
fn reset_without_a_driver_is_refused() {
    let (sim, _registry, _mixer) = prepared();
    assert_eq!(sim.post_message(MessageSelector::ResetRequest, 0), 0);
}

#[test]
fn buffer_size_change_needs_a_supporting_listener() {
    let (sim, registry, mixer) = prepared();
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();
    assert_eq!(sim.post_message(MessageSelector::BufferSizeChange, 256), 0);

    let (tx, _rx) = channel();
    registry.add_listener(Recorder::new(tx, true));
    assert_eq!(sim.post_message(MessageSelector::BufferSizeChange, 256), 1);
    assert_eq!(sim.post_message(MessageSelector::BufferSizeChange, 128), 0);
    line.close();
}

#[test]
fn resync_reaches_listeners() {
    let (sim, registry, mixer) = prepared();
    let (tx, _rx) = channel();
    let recorder = Recorder::new(tx, false);
    let listener: Arc<dyn AsioListener> = recorder.clone();
    registry.add_listener(listener.clone());
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();

    assert_eq!(sim.post_message(MessageSelector::ResyncRequest, 0), 1);
    assert_eq!(recorder.resyncs.load(Ordering::SeqCst), 1);
    assert_eq!(sim.post_message(MessageSelector::LatenciesChanged, 0), 0);

    registry.remove_listener(&listener);
    assert_eq!(sim.post_message(MessageSelector::ResyncRequest, 0), 0);
    line.close();
}

#[test]
fn sample_rate_changes_are_forwarded() {
    let (_sim, registry, mixer) = prepared();
    let (tx, rx) = channel();
    registry.add_listener(Recorder::new(tx, false));
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();

    mixer.set_sample_rate(48_000.0).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Heard::Rate(48_000.0));
    assert_eq!(mixer.sample_rate().unwrap(), 48_000.0);

    // Same rate again is not a change.
    mixer.set_sample_rate(48_000.0).unwrap();
    assert!(rx.try_recv().is_err());
    line.close();
}
