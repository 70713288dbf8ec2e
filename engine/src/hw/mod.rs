pub mod asio;
pub mod config;
pub mod latency;
pub mod options;
pub mod traits;
