use drumbox_engine::{
    AudioFormat, BufferSizes, DriverError, DriverOptions, DriverRegistry, LineEventKind, Mixer,
    SampleType, SimulatedDevice, SimulatedTransport, Status,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const RATE: f64 = 44_100.0;

fn device() -> SimulatedDevice {
    SimulatedDevice {
        sample_type: SampleType::Int16Lsb,
        buffer_sizes: BufferSizes {
            min: 4,
            max: 64,
            preferred: 8,
            granularity: -1,
        },
        ..SimulatedDevice::default()
    }
}

fn options() -> DriverOptions {
    DriverOptions {
        poll_interval_ms: 2,
        ..DriverOptions::default()
    }
}

fn setup_with(options: DriverOptions) -> (SimulatedTransport, Mixer) {
    let sim = SimulatedTransport::new(vec![device()]);
    let registry = DriverRegistry::new(Arc::new(sim.clone()), options);
    let mixer = registry.mixer("Drumbox Simulator").unwrap();
    (sim, mixer)
}

fn setup() -> (SimulatedTransport, Mixer) {
    setup_with(options())
}

fn ramp(from: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| from.wrapping_add(i as u8)).collect()
}

fn stereo() -> AudioFormat {
    AudioFormat::new(Some(RATE), SampleType::Int16Lsb, 2)
}

#[test]
fn written_bytes_reach_the_hardware_halves() {
    let (sim, mixer) = setup();
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();
    assert_eq!(mixer.status(), Status::Prepared);
    assert_eq!(mixer.buffer_frames(), Some(8));
    assert_eq!(line.buffer_size(), 32);
    assert_eq!(line.available(), 32);

    assert_eq!(line.write(&ramp(1, 16)).unwrap(), 16);
    assert_eq!(line.write(&ramp(17, 16)).unwrap(), 16);
    // Full and not running: nothing more is queued.
    assert_eq!(line.write(&ramp(33, 16)).unwrap(), 0);

    line.start().unwrap();
    assert_eq!(mixer.status(), Status::Running);
    assert_eq!(sim.output_half(0, 1), Some(ramp(1, 16)));

    assert!(sim.tick());
    assert_eq!(sim.output_half(0, 0), Some(ramp(17, 16)));
    assert!(sim.tick());
    assert_eq!(sim.output_half(0, 1), Some(vec![0; 16]));
    assert_eq!(mixer.switch_count(), 2);

    line.close();
    assert_eq!(mixer.status(), Status::Unloaded);
    assert!(!line.is_open());
}

#[test]
fn stereo_writes_split_per_channel() {
    let (sim, mixer) = setup();
    let line = mixer.output_line(0).unwrap();
    line.open(Some(stereo())).unwrap();
    assert_eq!(line.buffer_size(), 64);

    let frames: Vec<u8> = [[1, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12], [13, 14, 15, 16]]
        .concat();
    assert_eq!(line.write(&frames).unwrap(), 16);
    line.start().unwrap();

    let left = sim.output_half(0, 1).unwrap();
    let right = sim.output_half(1, 1).unwrap();
    assert_eq!(left[..8], [1, 2, 5, 6, 9, 10, 13, 14]);
    assert_eq!(right[..8], [3, 4, 7, 8, 11, 12, 15, 16]);
    assert!(left[8..].iter().all(|b| *b == 0));
    line.close();
}

#[test]
fn partial_frames_are_rejected() {
    let (_sim, mixer) = setup();
    let line = mixer.output_line(0).unwrap();
    line.open(Some(stereo())).unwrap();
    assert!(matches!(line.write(&[0; 6]), Err(DriverError::PartialFrame(6))));
    assert!(matches!(
        line.open_with(stereo(), 30),
        Err(DriverError::PartialFrame(30))
    ));
    line.close();
}

#[test]
fn directions_are_enforced() {
    let (_sim, mixer) = setup();
    let output = mixer.output_line(0).unwrap();
    let input = mixer.input_line(0).unwrap();
    let mut buf = [0_u8; 4];
    assert!(matches!(output.read(&mut buf), Err(DriverError::WrongDirection("read"))));
    assert!(matches!(input.write(&buf), Err(DriverError::WrongDirection("write"))));
}

#[test]
fn closed_lines_transfer_nothing() {
    let (_sim, mixer) = setup();
    let line = mixer.output_line(0).unwrap();
    assert_eq!(line.write(&[0; 4]).unwrap(), 0);
    assert_eq!(line.available(), 0);
    assert_eq!(line.buffer_size(), 0);
}

#[test]
fn unsupported_formats_are_rejected() {
    let (_sim, mixer) = setup();
    let line = mixer.output_line(1).unwrap();
    let too_wide = AudioFormat::new(Some(RATE), SampleType::Int16Lsb, 2);
    assert!(matches!(
        line.open(Some(too_wide)),
        Err(DriverError::UnsupportedFormat(_))
    ));
    let wrong_type = AudioFormat::new(Some(RATE), SampleType::Float32Lsb, 1);
    assert!(matches!(
        line.open(Some(wrong_type)),
        Err(DriverError::UnsupportedFormat(_))
    ));
    assert_eq!(mixer.status(), Status::Unloaded);
}

#[test]
fn only_one_layout_at_a_time() {
    let (_sim, mixer) = setup();
    let first = mixer.output_line(0).unwrap();
    let second = mixer.output_line(1).unwrap();
    first.open(None).unwrap();
    assert!(matches!(second.open(None), Err(DriverError::AlreadyActive)));
    first.close();
    second.open(None).unwrap();
    second.close();
}

#[test]
fn requested_buffer_bytes_pick_the_half_size() {
    let (_sim, mixer) = setup();
    let line = mixer.output_line(0).unwrap();
    let mono = AudioFormat::new(Some(RATE), SampleType::Int16Lsb, 1);
    line.open_with(mono, 64).unwrap();
    assert_eq!(mixer.buffer_frames(), Some(16));
    assert_eq!(line.buffer_size(), 64);
    line.close();

    // Rounded down to a power of two, then clamped to the maximum.
    line.open_with(mono, 2 * 2 * 100).unwrap();
    assert_eq!(mixer.buffer_frames(), Some(64));
    line.close();
}

#[test]
fn without_full_check_frames_round_to_the_fallback_granularity() {
    let (_sim, mixer) = setup_with(DriverOptions {
        full_check: false,
        ..options()
    });
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();
    assert_eq!(mixer.buffer_frames(), Some(32));
    assert_eq!(line.buffer_size(), 128);
    line.close();
}

#[test]
fn blocked_write_completes_as_the_driver_drains() {
    let (sim, mixer) = setup();
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();
    line.start().unwrap();

    let writer = {
        let line = line.clone();
        thread::spawn(move || line.write(&ramp(0, 96)))
    };
    for _ in 0..500 {
        if writer.is_finished() {
            break;
        }
        sim.tick();
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(writer.join().unwrap().unwrap(), 96);
    line.close();
}

#[test]
fn closing_releases_a_blocked_writer() {
    let (_sim, mixer) = setup();
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();
    line.start().unwrap();

    let writer = {
        let line = line.clone();
        thread::spawn(move || line.write(&ramp(0, 96)))
    };
    while line.available() > 0 {
        thread::sleep(Duration::from_millis(1));
    }
    line.close();
    assert_eq!(writer.join().unwrap().unwrap(), 32);
}

#[test]
fn closing_the_mixer_releases_a_blocked_writer() {
    let (_sim, mixer) = setup();
    mixer.open().unwrap();
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();
    line.start().unwrap();

    let writer = {
        let line = line.clone();
        thread::spawn(move || line.write(&ramp(0, 96)))
    };
    while line.available() > 0 {
        thread::sleep(Duration::from_millis(1));
    }
    mixer.close();
    assert_eq!(writer.join().unwrap().unwrap(), 32);
    assert!(!line.is_open());
    assert_eq!(mixer.status(), Status::Unloaded);
}

#[test]
fn flushing_releases_a_blocked_writer_and_empties_the_ring() {
    let (_sim, mixer) = setup();
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();
    line.start().unwrap();

    let writer = {
        let line = line.clone();
        thread::spawn(move || line.write(&ramp(0, 96)))
    };
    while line.available() > 0 {
        thread::sleep(Duration::from_millis(1));
    }
    line.flush();
    let written = writer.join().unwrap().unwrap();
    assert!((32..96).contains(&written));
    line.stop().unwrap();
    line.flush();
    assert_eq!(line.available(), 32);
    line.close();
}

#[test]
fn drain_waits_for_the_driver() {
    let (sim, mixer) = setup();
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();
    assert_eq!(line.write(&ramp(1, 32)).unwrap(), 32);
    line.start().unwrap();

    let drainer = {
        let line = line.clone();
        thread::spawn(move || line.drain())
    };
    for _ in 0..500 {
        if drainer.is_finished() {
            break;
        }
        sim.tick();
        thread::sleep(Duration::from_millis(1));
    }
    drainer.join().unwrap().unwrap();
    assert_eq!(line.available(), 32);
    line.close();
}

#[test]
fn loopback_input_reads_what_was_played() {
    let (sim, mixer) = setup();
    let output = mixer.output_line(0).unwrap();
    let input = mixer.input_line(0).unwrap();
    mixer.synchronize(&[output.clone(), input.clone()]).unwrap();

    output.open(None).unwrap();
    assert!(input.is_open());
    assert_eq!(output.write(&ramp(1, 16)).unwrap(), 16);
    output.start().unwrap();
    assert!(input.is_running());

    assert!(sim.tick());
    assert!(sim.tick());
    assert_eq!(input.available(), 32);
    let mut captured = [0_u8; 32];
    assert_eq!(input.read(&mut captured).unwrap(), 32);
    assert_eq!(captured[..16], [0; 16]);
    assert_eq!(captured[16..], ramp(1, 16)[..]);

    input.close();
    assert!(!output.is_open());
    assert_eq!(mixer.status(), Status::Unloaded);
}

#[test]
fn input_reads_injected_capture() {
    let (sim, mixer) = setup();
    let input = mixer.input_line(1).unwrap();
    input.open(None).unwrap();
    input.start().unwrap();

    assert!(sim.set_input_half(1, 0, &ramp(100, 16)));
    assert!(sim.tick());
    let mut captured = [0_u8; 16];
    assert_eq!(input.read(&mut captured).unwrap(), 16);
    assert_eq!(captured[..], ramp(100, 16)[..]);

    input.stop().unwrap();
    // Stopped: returns what is buffered instead of blocking.
    assert_eq!(input.read(&mut captured).unwrap(), 0);
    input.close();
}

#[test]
fn open_lines_cannot_be_synchronized() {
    let (_sim, mixer) = setup();
    let a = mixer.output_line(0).unwrap();
    let b = mixer.output_line(1).unwrap();
    a.open(None).unwrap();
    assert!(mixer.synchronize(&[a.clone(), b.clone()]).is_err());
    a.close();
    mixer.synchronize(&[a.clone(), b.clone()]).unwrap();
    mixer.unsynchronize(&[a.clone(), b.clone()]);
    a.open(None).unwrap();
    assert!(!b.is_open());
    a.close();
}

#[test]
fn line_events_report_the_lifecycle() {
    let (_sim, mixer) = setup();
    let line = mixer.output_line(0).unwrap();
    let mut events = line.subscribe();
    line.open(None).unwrap();
    line.start().unwrap();
    line.stop().unwrap();
    line.close();

    let kinds: Vec<LineEventKind> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|event| event.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            LineEventKind::Open,
            LineEventKind::Start,
            LineEventKind::Stop,
            LineEventKind::Close
        ]
    );
}

#[test]
fn positions_advance_with_valid_time_info() {
    let (sim, mixer) = setup();
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();
    assert_eq!(line.frame_position(), 0);
    line.start().unwrap();
    for _ in 0..3 {
        assert!(sim.tick());
    }
    assert!(line.frame_position() >= 16);
    line.stop().unwrap();
    line.start().unwrap();
    assert_eq!(mixer.frame_position(), 0);
    line.close();
}
