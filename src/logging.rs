use std::str::FromStr;
use tracing::Level;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::FmtSubscriber;

/// `-v` counts win over the configured level.
pub fn level(verbosity: u8, configured: &str) -> Level {
    match verbosity {
        0 => Level::from_str(configured).unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

pub fn init(level: Level) -> Result<(), SetGlobalDefaultError> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}
