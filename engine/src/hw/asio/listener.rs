use super::mixer::Mixer;

/// Driver notifications that reach the application. Every method has a no-op
/// default; requests are only forwarded to listeners that report support.
pub trait AsioListener: Send + Sync {
    fn sample_rate_changed(&self, _mixer: &Mixer, _rate: f64) {}

    /// The driver asked to be reset. It has already been unloaded when this
    /// runs.
    fn reset_request(&self, _mixer: &Mixer) {}

    fn supports_buffer_size_change(&self) -> bool {
        false
    }

    /// Returns whether the new size was accepted.
    fn buffer_size_changed(&self, _mixer: &Mixer, _frames: usize) -> bool {
        false
    }

    fn supports_resync_request(&self) -> bool {
        false
    }

    fn resync_request(&self, _mixer: &Mixer) -> bool {
        false
    }

    fn supports_latencies_changed(&self) -> bool {
        false
    }

    fn latencies_changed(&self, _mixer: &Mixer) -> bool {
        false
    }
}
