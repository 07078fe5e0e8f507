//! Foundational low-level utilities shared across sluice crates.
//!
//! Provides atomic file-write helpers and time utilities used by the state
//! store, ledger window queries, and retention cutoff calculations.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::{write_json_atomic, write_text_atomic};
pub use time_utils::{
    current_unix_timestamp, current_unix_timestamp_ms, is_older_than_unix_ms, HOUR_MS,
};

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn unit_time_utils_ms_and_seconds_agree() {
        let now_s = current_unix_timestamp();
        let now_ms = current_unix_timestamp_ms();
        let now_ms_s = now_ms / 1_000;
        assert!(now_ms_s >= now_s);
        assert!(now_ms_s <= now_s.saturating_add(1));
    }

    #[test]
    fn unit_is_older_than_unix_ms_respects_bounds() {
        assert!(is_older_than_unix_ms(0, 1_000, 500));
        assert!(!is_older_than_unix_ms(600, 1_000, 500));
        assert!(!is_older_than_unix_ms(2_000, 1_000, 500));
        assert!(!is_older_than_unix_ms(500, 1_000, 500));
    }

    #[test]
    fn unit_write_text_atomic_writes_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("snapshot.json");
        write_text_atomic(&path, "{}\n").expect("write");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "{}\n");
    }

    #[test]
    fn regression_write_text_atomic_rejects_directory_target() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        assert!(write_text_atomic(tempdir.path(), "nope").is_err());
    }

    #[test]
    fn unit_write_json_atomic_round_trips() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("status.json");
        write_json_atomic(&path, &vec![1u64, 2, 3]).expect("write");
        let raw = read_to_string(&path).expect("read");
        let values: Vec<u64> = serde_json::from_str(&raw).expect("parse");
        assert_eq!(values, vec![1, 2, 3]);
    }
}
