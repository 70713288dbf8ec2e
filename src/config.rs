use drumbox_engine::{DriverOptions, SimulatedDevice};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG: &str = "drumbox.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub asio: DriverOptions,
    pub driver: DriverSection,
    pub logging: LoggingSection,
    pub simulator: SimulatedDevice,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    /// Host shim to load instead of the platform default.
    pub library: Option<PathBuf>,
    /// Driver to use when a command does not name one.
    pub name: Option<String>,
    pub buffer_frames: Option<usize>,
    pub simulate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Reads `path`, or `drumbox.toml` when present. Environment overrides are
    /// applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn Error>> {
        let text = match path {
            Some(path) => Some(fs::read_to_string(path).map_err(|e| {
                io::Error::other(format!("Failed to read config '{}': {e}", path.display()))
            })?),
            None => fs::read_to_string(DEFAULT_CONFIG).ok(),
        };
        let mut config = match text {
            Some(text) => Self::parse(&text)?,
            None => Self::default(),
        };
        config.asio = config.asio.with_env();
        if let Some(frames) = config.driver.buffer_frames {
            config.asio.default_buffer_frames = Some(frames);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.asio.full_check);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn tables_override_defaults() {
        let config = AppConfig::parse(
            r#"
            [asio]
            full_check = false
            fallback_granularity = 64

            [driver]
            name = "ASIO4ALL v2"
            buffer_frames = 256
            simulate = true

            [logging]
            level = "debug"

            [simulator]
            inputs = 0
            outputs = 8
            "#,
        )
        .unwrap();
        assert!(!config.asio.full_check);
        assert_eq!(config.asio.fallback_granularity, 64);
        assert_eq!(config.asio.poll_interval_ms, 10);
        assert_eq!(config.driver.name.as_deref(), Some("ASIO4ALL v2"));
        assert_eq!(config.driver.buffer_frames, Some(256));
        assert!(config.driver.simulate);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.simulator.outputs, 8);
        assert_eq!(config.simulator.name, "Drumbox Simulator");
    }
}
