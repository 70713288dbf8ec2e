pub const ASIO_FULL_CHECK_ENV: &str = "DRUMBOX_ASIO_FULL_CHECK";
pub const ASIO_LIBRARY_ENV: &str = "DRUMBOX_ASIO_LIBRARY";
pub const ASIO_POLL_MS_ENV: &str = "DRUMBOX_ASIO_POLL_MS";

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|v| parse_flag(&v))
}

pub fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn env_path(key: &str) -> Option<std::path::PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(std::path::PathBuf::from)
}
