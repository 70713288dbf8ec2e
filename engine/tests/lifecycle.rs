use drumbox_engine::{
    AsioError, DriverError, DriverOptions, DriverRegistry, LineEventKind, SimOp, SimulatedDevice,
    SimulatedTransport, Status,
};
use drumbox_engine::hw::traits::HwDevice;
use std::sync::Arc;

fn setup(names: &[&str]) -> (SimulatedTransport, DriverRegistry) {
    let devices = names.iter().map(|name| SimulatedDevice::named(name)).collect();
    let sim = SimulatedTransport::new(devices);
    let registry = DriverRegistry::new(Arc::new(sim.clone()), DriverOptions::default());
    (sim, registry)
}

#[test]
fn claimants_share_one_initialization() {
    let (sim, registry) = setup(&["A"]);
    let line_a = registry.mixer("A").unwrap();
    let line_b = registry.mixer("A").unwrap();
    assert!(line_a.same(&line_b));

    let ticket_a = line_a.init().unwrap();
    assert_eq!(line_a.status(), Status::Initialized);
    let ticket_b = line_b.init().unwrap();
    assert_eq!(ticket_a, ticket_b);
    assert_eq!(sim.calls(SimOp::Init), 1);

    line_a.exit(ticket_a);
    assert_eq!(line_a.status(), Status::Initialized);
    assert_eq!(sim.calls(SimOp::Exit), 0);

    line_b.exit(ticket_b);
    assert_eq!(line_b.status(), Status::Unloaded);
    assert_eq!(sim.calls(SimOp::Exit), 1);
    assert!(registry.active_mixer().is_none());
    assert_eq!(sim.loaded_driver(), None);
}

#[test]
fn sequences_start_at_one_and_advance() {
    let (_sim, registry) = setup(&["A"]);
    let mixer = registry.mixer("A").unwrap();
    let first = mixer.init().unwrap();
    assert_eq!(first.sequence(), 1);
    mixer.exit(first);
    let second = mixer.init().unwrap();
    assert_eq!(second.sequence(), 2);
    mixer.exit(second);
}

#[test]
fn stale_ticket_is_ignored() {
    let (_sim, registry) = setup(&["A"]);
    let mixer = registry.mixer("A").unwrap();
    let old = mixer.init().unwrap();
    mixer.exit(old);
    assert_eq!(mixer.status(), Status::Unloaded);

    let live = mixer.init().unwrap();
    assert_ne!(live, old);
    mixer.exit(old);
    assert_eq!(mixer.status(), Status::Initialized);
    mixer.exit(live);
    assert_eq!(mixer.status(), Status::Unloaded);
}

#[test]
fn only_one_driver_at_a_time() {
    let (_sim, registry) = setup(&["A", "B"]);
    let a = registry.mixer("A").unwrap();
    let b = registry.mixer("B").unwrap();
    let ticket = a.init().unwrap();

    match b.init() {
        Err(DriverError::AnotherDriverActive(holder)) => assert_eq!(holder, "A"),
        other => panic!("expected AnotherDriverActive, got {other:?}"),
    }
    assert!(registry.last_error().is_some());
    assert!(registry.active_mixer().is_some_and(|m| m.same(&a)));
    assert_eq!(b.status(), Status::Unloaded);

    a.exit(ticket);
    let ticket = b.init().unwrap();
    assert_eq!(b.status(), Status::Initialized);
    b.exit(ticket);
}

#[test]
fn failed_init_rolls_back_to_unloaded() {
    let (sim, registry) = setup(&["A"]);
    let mixer = registry.mixer("A").unwrap();
    sim.fail_next(SimOp::Init, AsioError::HwMalfunction);

    let err = mixer.init().unwrap_err();
    assert_eq!(err.asio_code(), Some(AsioError::HwMalfunction));
    assert_eq!(mixer.status(), Status::Unloaded);
    assert!(registry.active_mixer().is_none());
    assert_eq!(sim.loaded_driver(), None);

    let ticket = mixer.init().unwrap();
    assert_eq!(mixer.status(), Status::Initialized);
    mixer.exit(ticket);
}

#[test]
fn failed_buffer_creation_keeps_the_driver_initialized() {
    let (sim, registry) = setup(&["A"]);
    let mixer = registry.mixer("A").unwrap();
    mixer.open().unwrap();
    let line = mixer.output_line(0).unwrap();

    sim.fail_next(SimOp::CreateBuffers, AsioError::NoMemory);
    let err = line.open(None).unwrap_err();
    assert_eq!(err.asio_code(), Some(AsioError::NoMemory));
    assert!(!line.is_open());
    assert_eq!(mixer.status(), Status::Initialized);

    line.open(None).unwrap();
    assert_eq!(mixer.status(), Status::Prepared);
    line.close();
    assert_eq!(mixer.status(), Status::Initialized);
    mixer.close();
    assert_eq!(mixer.status(), Status::Unloaded);
}

#[test]
fn failed_start_stays_prepared() {
    let (sim, registry) = setup(&["A"]);
    let mixer = registry.mixer("A").unwrap();
    let line = mixer.output_line(0).unwrap();
    line.open(None).unwrap();

    sim.fail_next(SimOp::Start, AsioError::HwMalfunction);
    assert!(line.start().is_err());
    assert_eq!(mixer.status(), Status::Prepared);
    assert!(!line.is_active());

    line.start().unwrap();
    assert_eq!(mixer.status(), Status::Running);
    assert!(line.is_running());
    line.close();
    assert_eq!(mixer.status(), Status::Unloaded);
}

#[test]
fn unknown_driver_cannot_be_loaded() {
    let (_sim, registry) = setup(&["A"]);
    assert!(matches!(
        registry.mixer("missing"),
        Err(DriverError::LoadFailed(name)) if name == "missing"
    ));
}

#[test]
fn free_all_drops_every_claim() {
    let (_sim, registry) = setup(&["A"]);
    let mixer = registry.mixer("A").unwrap();
    mixer.open().unwrap();
    let _extra = mixer.init().unwrap();
    assert!(mixer.is_open());

    registry.free_all();
    assert_eq!(mixer.status(), Status::Unloaded);
    assert!(!mixer.is_open());
    mixer.open().unwrap();
    assert_eq!(mixer.status(), Status::Initialized);
    mixer.close();
}

#[test]
fn mixer_infos_probe_versions_without_holding_the_driver() {
    let (sim, registry) = setup(&["A", "B"]);
    let infos = registry.mixer_infos();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].name, "A (ASIO)");
    assert_eq!(infos[0].description, "A ASIO Driver");
    assert_eq!(infos[0].vendor, "Unknown");
    assert_eq!(infos[1].version, "1");
    assert_eq!(sim.loaded_driver(), None);
    assert!(registry.active_mixer().is_none());
}

#[test]
fn queries_use_a_temporary_claim() {
    let (_sim, registry) = setup(&["A"]);
    let mixer = registry.mixer("A").unwrap();
    assert_eq!(mixer.input_channel_count().unwrap(), 2);
    assert_eq!(mixer.sample_rate().unwrap(), 44_100.0);
    assert_eq!(mixer.buffer_sizes().unwrap().preferred, 512);
    assert_eq!(mixer.clock_sources().unwrap().len(), 1);
    assert_eq!(mixer.driver_version().unwrap(), 1);
    assert_eq!(mixer.status(), Status::Unloaded);

    mixer.set_sample_rate(48_000.0).unwrap();
    assert!(mixer.set_sample_rate(12_345.0).is_err());
    assert_eq!(mixer.status(), Status::Unloaded);
}

#[test]
fn mixer_events_follow_status() {
    let (_sim, registry) = setup(&["A"]);
    let mixer = registry.mixer("A").unwrap();
    let mut events = mixer.subscribe();
    mixer.open().unwrap();
    mixer.close();

    let kinds: Vec<LineEventKind> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|event| event.kind)
        .collect();
    assert_eq!(kinds, vec![LineEventKind::Open, LineEventKind::Close]);
}

#[test]
fn mixer_reports_as_a_hardware_device() {
    let (_sim, registry) = setup(&["A"]);
    let mixer = registry.mixer("A").unwrap();
    let device: &dyn HwDevice = &mixer;
    assert_eq!(device.input_channels(), 2);
    assert_eq!(device.output_channels(), 2);
    assert_eq!(device.sample_rate(), 44_100);
    assert_eq!(device.latency_ranges(), ((0, 0), (0, 1024)));
    assert_eq!(mixer.status(), Status::Unloaded);
}

#[test]
fn control_panel_runs_under_a_temporary_claim() {
    let (sim, registry) = setup(&["A", "B"]);
    let a = registry.mixer("A").unwrap();
    let b = registry.mixer("B").unwrap();

    a.show_control_panel().join().unwrap().unwrap();
    assert_eq!(sim.calls(SimOp::Init), 1);
    assert_eq!(a.status(), Status::Unloaded);

    let ticket = a.init().unwrap();
    assert!(matches!(
        b.show_control_panel().join().unwrap(),
        Err(DriverError::AnotherDriverActive(_))
    ));
    a.exit(ticket);
}
