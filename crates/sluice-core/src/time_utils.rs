/// Milliseconds in one trailing ledger window hour.
pub const HOUR_MS: u64 = 3_600_000;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns true when `timestamp_unix_ms` is strictly older than `max_age_ms`
/// relative to `now_unix_ms`. Timestamps in the future are never old.
pub fn is_older_than_unix_ms(timestamp_unix_ms: u64, now_unix_ms: u64, max_age_ms: u64) -> bool {
    now_unix_ms.saturating_sub(timestamp_unix_ms) > max_age_ms
}
