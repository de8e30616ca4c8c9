//! Logger bootstrap for storechain binaries.

use env_logger::Builder;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "STORECHAIN_LOG";

/// Install the global logger.
///
/// The filter comes from `STORECHAIN_LOG`, then `RUST_LOG`, then
/// `default_level`. Returns `false` when a logger was already installed.
pub fn init(default_level: &str) -> bool {
    let filter = resolve_filter(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        default_level,
    );
    Builder::new()
        .parse_filters(&filter)
        .format_timestamp_secs()
        .format_target(false)
        .try_init()
        .is_ok()
}

fn resolve_filter(primary: Option<String>, fallback: Option<String>, default: &str) -> String {
    primary
        .filter(|value| !value.trim().is_empty())
        .or_else(|| fallback.filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| default.to_string())
}
