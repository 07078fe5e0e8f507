//! File-spool ingestion for bot mode.
//!
//! The external gateway drops one verified delivery per `.json` file into
//! the spool directory; the feeder normalizes each file, hands it to the
//! runtime channel, and consumes the file. Malformed files are set aside
//! with a `.malformed` suffix instead of being retried forever.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use sluice_admission::InboundEvent;
use sluice_core::current_unix_timestamp_ms;
use sluice_runtime::normalize_payload;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub(crate) async fn run_spool_feeder(
    spool_dir: PathBuf,
    sender: mpsc::Sender<InboundEvent>,
    mut shutdown: watch::Receiver<bool>,
    poll_interval_ms: u64,
) -> Result<()> {
    std::fs::create_dir_all(&spool_dir)
        .with_context(|| format!("failed to create spool directory {}", spool_dir.display()))?;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(poll_interval_ms.max(1))) => {
                for path in spool_files(&spool_dir)? {
                    match ingest_spool_file(&path) {
                        Ok(event) => {
                            debug!(path = %path.display(), event_id = %event.id, "ingested spool file");
                            if sender.send(event).await.is_err() {
                                return Ok(());
                            }
                            if let Err(error) = std::fs::remove_file(&path) {
                                warn!(path = %path.display(), error = %error, "failed to consume spool file");
                            }
                        }
                        Err(error) => {
                            warn!(path = %path.display(), error = %error, "setting malformed spool file aside");
                            set_aside(&path);
                        }
                    }
                }
            }
        }
    }
}

fn spool_files(spool_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(spool_dir)
        .with_context(|| format!("failed to read spool directory {}", spool_dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|value| value.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn ingest_spool_file(path: &Path) -> Result<InboundEvent> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read spool file {}", path.display()))?;
    let payload: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in spool file {}", path.display()))?;
    normalize_payload(&payload, current_unix_timestamp_ms())
}

fn set_aside(path: &Path) {
    let mut target = path.as_os_str().to_os_string();
    target.push(".malformed");
    if let Err(error) = std::fs::rename(path, &target) {
        warn!(path = %path.display(), error = %error, "failed to set malformed spool file aside");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn functional_spool_feeder_ingests_and_consumes_files() {
        let dir = tempdir().expect("tempdir");
        let spool_dir = dir.path().join("spool");
        std::fs::create_dir_all(&spool_dir).expect("mkdir");
        std::fs::write(
            spool_dir.join("delivery-1.json"),
            r#"{"event_name": "issues", "action": "opened", "issue": {"number": 8, "title": "t", "body": "b"}}"#,
        )
        .expect("write");
        std::fs::write(spool_dir.join("broken.json"), "{not json").expect("write");

        let (sender, mut receiver) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let feeder = tokio::spawn(run_spool_feeder(spool_dir.clone(), sender, shutdown_rx, 10));

        let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("timely")
            .expect("event");
        assert_eq!(event.id, "issues-8");

        // The good file is consumed; the malformed one is set aside.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!spool_dir.join("delivery-1.json").exists());
        assert!(!spool_dir.join("broken.json").exists());
        assert!(spool_dir.join("broken.json.malformed").exists());

        shutdown_tx.send(true).expect("shutdown");
        feeder.await.expect("join").expect("feeder");
    }
}
