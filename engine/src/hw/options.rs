use crate::hw::config::{ASIO_FULL_CHECK_ENV, ASIO_POLL_MS_ENV, env_flag, env_usize};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverOptions {
    /// Validate formats against the line info and clamp buffer sizes to the
    /// driver's reported limits. Off trusts the caller and rounds frames to
    /// `fallback_granularity`.
    pub full_check: bool,
    pub fallback_granularity: usize,
    pub default_buffer_frames: Option<usize>,
    pub poll_interval_ms: u64,
    pub fallback_sample_rate: f64,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            full_check: true,
            fallback_granularity: 32,
            default_buffer_frames: None,
            poll_interval_ms: 10,
            fallback_sample_rate: 44_100.0,
        }
    }
}

impl DriverOptions {
    pub fn with_env(mut self) -> Self {
        if let Some(full_check) = env_flag(ASIO_FULL_CHECK_ENV) {
            self.full_check = full_check;
        }
        if let Some(ms) = env_usize(ASIO_POLL_MS_ENV) {
            self.poll_interval_ms = ms as u64;
        }
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
