use super::error::{AsioError, DriverError};
use super::half_buffer::HalfBuffer;
use super::listener::AsioListener;
use super::mixer::{Mixer, MixerShared, Status};
use super::transport::{BufferRequest, DriverCallbacks, MessageSelector, Transport};
use crate::hw::options::DriverOptions;
use crate::mutex::lock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

/// Claim on an initialized driver, returned by [`Mixer::init`] and given
/// back to [`Mixer::exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

impl Ticket {
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixerInfo {
    pub name: String,
    pub vendor: String,
    pub description: String,
    pub version: String,
}

impl MixerInfo {
    pub(crate) fn for_driver(driver: &str, version: Option<i32>) -> Self {
        Self {
            name: format!("{driver} (ASIO)"),
            vendor: "Unknown".to_string(),
            description: format!("{driver} ASIO Driver"),
            version: version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }
}

/// Driver-wide state. Every status transition happens under this lock.
struct Lifecycle {
    holder: Option<Mixer>,
    next_sequence: u64,
    init_ticket: Option<Ticket>,
    claims: usize,
    last_error: Option<String>,
}

impl Lifecycle {
    fn issue(&mut self) -> Ticket {
        if self.next_sequence == 0 || self.next_sequence == u64::MAX {
            self.next_sequence = 1;
        }
        let ticket = Ticket(self.next_sequence);
        self.next_sequence += 1;
        ticket
    }

    fn holds(&self, mixer: &Mixer) -> bool {
        self.holder.as_ref().is_some_and(|h| h.same(mixer))
    }

    fn record(&mut self, err: &DriverError) {
        self.last_error = Some(err.to_string());
    }
}

pub(crate) struct RegistryShared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) options: DriverOptions,
    lifecycle: Mutex<Lifecycle>,
    pool: Mutex<HashMap<String, Weak<MixerShared>>>,
    listeners: Mutex<Vec<Arc<dyn AsioListener>>>,
    infos: Mutex<Option<Vec<MixerInfo>>>,
}

/// Owns the transport and hands out one [`Mixer`] per driver name. At most
/// one driver is loaded at a time; the mixer that loaded it is the current
/// holder until its last claim is released.
#[derive(Clone)]
pub struct DriverRegistry {
    shared: Arc<RegistryShared>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("options", &self.shared.options)
            .field("active", &self.active_mixer().map(|m| m.name().to_string()))
            .finish()
    }
}

impl DriverRegistry {
    pub fn new(transport: Arc<dyn Transport>, options: DriverOptions) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                transport,
                options,
                lifecycle: Mutex::new(Lifecycle {
                    holder: None,
                    next_sequence: 1,
                    init_ticket: None,
                    claims: 0,
                    last_error: None,
                }),
                pool: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                infos: Mutex::new(None),
            }),
        }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.shared.options
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.shared.transport.clone()
    }

    pub fn driver_names(&self) -> Vec<String> {
        self.shared.transport.driver_names()
    }

    /// The pooled mixer for `driver`, created on first use.
    pub fn mixer(&self, driver: &str) -> Result<Mixer, DriverError> {
        if !self.driver_names().iter().any(|name| name == driver) {
            return Err(DriverError::LoadFailed(driver.to_string()));
        }
        let mut pool = lock(&self.shared.pool);
        if let Some(mixer) = pool.get(driver).and_then(Weak::upgrade) {
            return Ok(Mixer::from_shared(mixer));
        }
        let mixer = Mixer::new(driver, self.shared.clone());
        pool.insert(driver.to_string(), Arc::downgrade(&mixer.shared));
        Ok(mixer)
    }

    pub fn mixers(&self) -> Vec<Mixer> {
        self.driver_names()
            .iter()
            .filter_map(|name| self.mixer(name).ok())
            .collect()
    }

    pub fn mixer_infos(&self) -> Vec<MixerInfo> {
        let mut cached = lock(&self.shared.infos);
        if let Some(infos) = cached.as_ref() {
            return infos.clone();
        }
        let infos: Vec<MixerInfo> = self
            .driver_names()
            .iter()
            .map(|name| {
                let version = if self.shared.options.full_check {
                    self.shared.probe_version(name)
                } else {
                    None
                };
                MixerInfo::for_driver(name, version)
            })
            .collect();
        *cached = Some(infos.clone());
        infos
    }

    pub fn active_mixer(&self) -> Option<Mixer> {
        lock(&self.shared.lifecycle).holder.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.lifecycle).last_error.clone()
    }

    /// Unloads whatever driver is active, dropping every claim on it.
    pub fn free_all(&self) {
        let holder = self.active_mixer();
        if let Some(mixer) = holder {
            self.shared.force_unload(&mixer);
        }
        self.shared.transport.remove_current_driver();
    }

    pub fn add_listener(&self, listener: Arc<dyn AsioListener>) {
        lock(&self.shared.listeners).push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn AsioListener>) {
        lock(&self.shared.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }
}

impl RegistryShared {
    fn record(&self, err: DriverError) -> DriverError {
        lock(&self.lifecycle).record(&err);
        err
    }

    pub(crate) fn record_asio(&self, operation: &'static str, err: AsioError) -> DriverError {
        error!("ASIO {operation} failed: {err}");
        self.record(DriverError::asio(operation, err))
    }

    fn load(&self, lc: &mut Lifecycle, mixer: &Mixer) -> Result<(), DriverError> {
        if let Some(holder) = lc.holder.clone() {
            if !holder.same(mixer) {
                let err = DriverError::AnotherDriverActive(holder.name().to_string());
                lc.record(&err);
                return Err(err);
            }
            if mixer.status() >= Status::Loaded {
                return Ok(());
            }
        }
        if !self.transport.load_driver(mixer.name()) {
            let err = DriverError::LoadFailed(mixer.name().to_string());
            lc.record(&err);
            return Err(err);
        }
        info!("loaded ASIO driver {}", mixer.name());
        lc.holder = Some(mixer.clone());
        mixer.set_status(Status::Loaded);
        Ok(())
    }

    /// Loads and initializes the driver if needed and adds one claim.
    pub(crate) fn init(&self, mixer: &Mixer) -> Result<Ticket, DriverError> {
        let mut lc = lock(&self.lifecycle);
        self.load(&mut lc, mixer)?;
        if mixer.status() >= Status::Initialized
            && let Some(ticket) = lc.init_ticket
        {
            lc.claims += 1;
            debug!(
                "driver {} claimed again ({} claims)",
                mixer.name(),
                lc.claims
            );
            return Ok(ticket);
        }
        match self.transport.init() {
            Ok(info) => {
                let ticket = lc.issue();
                lc.init_ticket = Some(ticket);
                lc.claims = 1;
                info!(
                    "initialized {} (driver version {}, sequence {})",
                    info.name,
                    info.driver_version,
                    ticket.sequence()
                );
                mixer.set_driver_info(Some(info));
                mixer.set_status(Status::Initialized);
                Ok(ticket)
            }
            Err(e) => {
                error!("ASIO init of {} failed: {e}", mixer.name());
                self.transport.remove_current_driver();
                lc.holder = None;
                mixer.set_status(Status::Unloaded);
                let err = DriverError::asio("init", e);
                lc.record(&err);
                Err(err)
            }
        }
    }

    /// Releases one claim. The last claim tears the driver down; tickets from
    /// an earlier initialization are ignored.
    pub(crate) fn exit(&self, mixer: &Mixer, ticket: Ticket) {
        let mut lc = lock(&self.lifecycle);
        if !lc.holds(mixer) || lc.init_ticket != Some(ticket) || lc.claims == 0 {
            debug!(
                "ignoring stale ticket {} for {}",
                ticket.sequence(),
                mixer.name()
            );
            return;
        }
        lc.claims -= 1;
        if lc.claims == 0 {
            self.unload(&mut lc, mixer);
        }
    }

    pub(crate) fn force_unload(&self, mixer: &Mixer) {
        let mut lc = lock(&self.lifecycle);
        if lc.holds(mixer) {
            self.unload(&mut lc, mixer);
        }
    }

    fn unload(&self, lc: &mut Lifecycle, mixer: &Mixer) {
        if let Err(e) = self.unprepare_locked(lc, mixer) {
            warn!("unprepare during unload of {} failed: {e}", mixer.name());
        }
        if mixer.status() >= Status::Initialized
            && let Err(e) = self.transport.exit()
        {
            warn!("ASIO exit of {} failed: {e}", mixer.name());
        }
        self.transport.remove_current_driver();
        lc.holder = None;
        lc.init_ticket = None;
        lc.claims = 0;
        mixer.forget_claims();
        mixer.set_driver_info(None);
        mixer.set_status(Status::Unloaded);
        info!("unloaded ASIO driver {}", mixer.name());
    }

    fn require_holder(&self, lc: &mut Lifecycle, mixer: &Mixer) -> Result<(), DriverError> {
        match lc.holder.clone() {
            Some(holder) if holder.same(mixer) => Ok(()),
            Some(holder) => {
                let err = DriverError::AnotherDriverActive(holder.name().to_string());
                lc.record(&err);
                Err(err)
            }
            None => Err(DriverError::InvalidState {
                required: Status::Initialized,
                actual: mixer.status(),
            }),
        }
    }

    /// Creates hardware buffers and runs `install` with them while still
    /// holding the lifecycle lock. A failing `install` disposes the buffers
    /// again.
    pub(crate) fn prepare<F>(
        &self,
        mixer: &Mixer,
        requests: &[BufferRequest],
        buffer_frames: usize,
        callbacks: Arc<dyn DriverCallbacks>,
        install: F,
    ) -> Result<(), DriverError>
    where
        F: FnOnce(Vec<[HalfBuffer; 2]>) -> Result<(), DriverError>,
    {
        let mut lc = lock(&self.lifecycle);
        self.require_holder(&mut lc, mixer)?;
        let status = mixer.status();
        if status >= Status::Prepared {
            let err = DriverError::AlreadyActive;
            lc.record(&err);
            return Err(err);
        }
        if status < Status::Initialized {
            return Err(DriverError::InvalidState {
                required: Status::Initialized,
                actual: status,
            });
        }
        let halves = match self
            .transport
            .create_buffers(requests, buffer_frames, callbacks)
        {
            Ok(halves) => halves,
            Err(e) => {
                error!("ASIO create buffers failed: {e}");
                let err = DriverError::asio("create buffers", e);
                lc.record(&err);
                return Err(err);
            }
        };
        if let Err(err) = install(halves) {
            if let Err(e) = self.transport.dispose_buffers() {
                warn!("ASIO dispose buffers failed: {e}");
            }
            lc.record(&err);
            return Err(err);
        }
        debug!(
            "prepared {} channel(s) of {} frames on {}",
            requests.len(),
            buffer_frames,
            mixer.name()
        );
        mixer.set_status(Status::Prepared);
        Ok(())
    }

    pub(crate) fn start(&self, mixer: &Mixer) -> Result<(), DriverError> {
        let mut lc = lock(&self.lifecycle);
        self.require_holder(&mut lc, mixer)?;
        match mixer.status() {
            Status::Running => return Ok(()),
            Status::Prepared => {}
            actual => {
                return Err(DriverError::InvalidState {
                    required: Status::Prepared,
                    actual,
                });
            }
        }
        // Running before the transport starts so the first switch is accepted.
        mixer.set_status(Status::Running);
        if let Err(e) = self.transport.start() {
            mixer.set_status(Status::Prepared);
            error!("ASIO start failed: {e}");
            let err = DriverError::asio("start", e);
            lc.record(&err);
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn stop(&self, mixer: &Mixer) -> Result<(), DriverError> {
        let mut lc = lock(&self.lifecycle);
        self.stop_locked(&mut lc, mixer)
    }

    fn stop_locked(&self, lc: &mut Lifecycle, mixer: &Mixer) -> Result<(), DriverError> {
        if mixer.status() < Status::Running {
            return Ok(());
        }
        self.require_holder(lc, mixer)?;
        if let Err(e) = self.transport.stop() {
            error!("ASIO stop failed: {e}");
            let err = DriverError::asio("stop", e);
            lc.record(&err);
            return Err(err);
        }
        mixer.set_status(Status::Prepared);
        Ok(())
    }

    pub(crate) fn unprepare(&self, mixer: &Mixer) -> Result<(), DriverError> {
        let mut lc = lock(&self.lifecycle);
        self.unprepare_locked(&mut lc, mixer)
    }

    fn unprepare_locked(&self, lc: &mut Lifecycle, mixer: &Mixer) -> Result<(), DriverError> {
        if mixer.status() < Status::Prepared {
            mixer.teardown_layout();
            return Ok(());
        }
        let stopped = self.stop_locked(lc, mixer);
        mixer.teardown_layout();
        let disposed = self.transport.dispose_buffers();
        mixer.set_status(Status::Initialized);
        stopped?;
        disposed.map_err(|e| {
            let err = DriverError::asio("dispose buffers", e);
            lc.record(&err);
            err
        })
    }

    fn probe_version(&self, driver: &str) -> Option<i32> {
        let lc = lock(&self.lifecycle);
        if lc.holder.is_some() || !self.transport.load_driver(driver) {
            return None;
        }
        let version = match self.transport.init() {
            Ok(info) => {
                if let Err(e) = self.transport.exit() {
                    warn!("ASIO exit of {driver} failed: {e}");
                }
                Some(info.driver_version)
            }
            Err(e) => {
                warn!("could not query version of {driver}: {e}");
                None
            }
        };
        self.transport.remove_current_driver();
        drop(lc);
        version
    }

    fn listeners(&self) -> Vec<Arc<dyn AsioListener>> {
        lock(&self.listeners).clone()
    }

    pub(crate) fn sample_rate_changed(&self, rate: f64) {
        let Some(mixer) = lock(&self.lifecycle).holder.clone() else {
            return;
        };
        info!("sample rate of {} changed to {rate}", mixer.name());
        for listener in self.listeners() {
            listener.sample_rate_changed(&mixer, rate);
        }
    }

    pub(crate) fn asio_message(self: &Arc<Self>, selector: MessageSelector, value: i64) -> i64 {
        match selector {
            MessageSelector::SelectorSupported => {
                let asked = MessageSelector::from_code(value as i32);
                i64::from(!matches!(
                    asked,
                    MessageSelector::SelectorSupported | MessageSelector::Other(_)
                ))
            }
            MessageSelector::EngineVersion => 2,
            MessageSelector::SupportsTimeInfo => 1,
            MessageSelector::SupportsTimeCode => 0,
            MessageSelector::ResetRequest => {
                let Some(mixer) = lock(&self.lifecycle).holder.clone() else {
                    return 0;
                };
                warn!("driver {} requested a reset", mixer.name());
                // The driver may be calling from its own audio thread, which
                // the unload has to join.
                let registry = self.clone();
                let spawned = std::thread::Builder::new()
                    .name("asio-reset".to_string())
                    .spawn(move || {
                        registry.force_unload(&mixer);
                        for listener in registry.listeners() {
                            listener.reset_request(&mixer);
                        }
                    });
                match spawned {
                    Ok(_) => 1,
                    Err(e) => {
                        error!("failed to spawn reset thread: {e}");
                        0
                    }
                }
            }
            MessageSelector::BufferSizeChange => self.forward(|l, mixer| {
                l.supports_buffer_size_change() && l.buffer_size_changed(mixer, value as usize)
            }),
            MessageSelector::ResyncRequest => {
                self.forward(|l, mixer| l.supports_resync_request() && l.resync_request(mixer))
            }
            MessageSelector::LatenciesChanged => self.forward(|l, mixer| {
                l.supports_latencies_changed() && l.latencies_changed(mixer)
            }),
            MessageSelector::Other(code) => {
                debug!("unhandled ASIO message selector {code}");
                0
            }
        }
    }

    fn forward(&self, handled: impl Fn(&dyn AsioListener, &Mixer) -> bool) -> i64 {
        let Some(mixer) = lock(&self.lifecycle).holder.clone() else {
            return 0;
        };
        let mut accepted = false;
        for listener in self.listeners() {
            accepted |= handled(listener.as_ref(), &mixer);
        }
        i64::from(accepted)
    }
}
