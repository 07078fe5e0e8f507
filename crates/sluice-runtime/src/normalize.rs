//! Normalizes raw collaboration-platform payloads into inbound events.
//!
//! Accepts either the already-normalized gateway form or a raw webhook or
//! action payload carrying an `event_name` alongside the subject object.

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sluice_admission::{EventKind, InboundEvent};

const SUMMARY_CHAR_LIMIT: usize = 4_000;

pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    format!("{:x}", hasher.finalize())
}

/// Parses an RFC 3339 timestamp into unix milliseconds.
pub fn parse_rfc3339_to_unix_ms(value: &str) -> Option<u64> {
    let parsed = DateTime::parse_from_rfc3339(value).ok()?;
    u64::try_from(parsed.timestamp_millis()).ok()
}

fn kind_from_event_name(event_name: &str) -> Option<EventKind> {
    match event_name {
        "issue" | "issues" => Some(EventKind::Issue),
        "pull_request" => Some(EventKind::PullRequest),
        "discussion" => Some(EventKind::Discussion),
        _ => None,
    }
}

fn subject_payload<'a>(raw: &'a Value, kind: EventKind) -> Option<&'a Value> {
    let key = match kind {
        EventKind::Issue => "issue",
        EventKind::PullRequest => "pull_request",
        EventKind::Discussion => "discussion",
    };
    raw.get(key)
}

fn truncate_summary(summary: &str) -> String {
    if summary.chars().count() <= SUMMARY_CHAR_LIMIT {
        return summary.to_string();
    }
    summary.chars().take(SUMMARY_CHAR_LIMIT).collect()
}

/// Builds an `InboundEvent` from a delivery payload.
///
/// Raw payloads get the original integration's stable id shape,
/// `{event_name}-{number}`, so webhook re-deliveries of the same activity
/// collapse onto one record. Payloads without a subject number fall back to
/// a content hash.
pub fn normalize_payload(raw: &Value, now_unix_ms: u64) -> Result<InboundEvent> {
    if let Some(id) = raw.get("id").and_then(Value::as_str) {
        // Already-normalized gateway form.
        let kind_raw = raw
            .get("type")
            .and_then(Value::as_str)
            .context("normalized payload is missing 'type'")?;
        let Some(kind) = EventKind::parse(kind_raw).or_else(|| kind_from_event_name(kind_raw))
        else {
            bail!("unsupported event type '{}'", kind_raw);
        };
        let action = raw
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let subject_id = raw
            .get("subject_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string());
        let payload_summary = raw
            .get("payload_summary")
            .and_then(Value::as_str)
            .map(truncate_summary)
            .unwrap_or_default();
        let received_at_unix_ms = match raw.get("received_at") {
            Some(Value::String(text)) => parse_rfc3339_to_unix_ms(text).unwrap_or(now_unix_ms),
            Some(Value::Number(number)) => number.as_u64().unwrap_or(now_unix_ms),
            _ => now_unix_ms,
        };
        return Ok(InboundEvent {
            id: id.to_string(),
            kind,
            action,
            subject_id,
            payload_summary,
            received_at_unix_ms,
        });
    }

    let event_name = raw
        .get("event_name")
        .and_then(Value::as_str)
        .context("payload is missing 'event_name'")?;
    let Some(kind) = kind_from_event_name(event_name) else {
        bail!("unsupported event type '{}'", event_name);
    };
    let action = raw
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let subject = subject_payload(raw, kind);
    let number = subject.and_then(|value| value.get("number")).and_then(Value::as_u64);
    let (id, subject_id) = match number {
        Some(number) => (
            format!("{event_name}-{number}"),
            format!("{}-{number}", kind.as_str()),
        ),
        None => {
            let digest = sha256_hex(raw.to_string().as_bytes());
            let short = &digest[..16];
            (format!("{event_name}-{short}"), format!("{}-{short}", kind.as_str()))
        }
    };

    let title = subject
        .and_then(|value| value.get("title"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let body = subject
        .and_then(|value| value.get("body"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let payload_summary = truncate_summary(format!("{title}\n\n{body}").trim());

    let received_at_unix_ms = subject
        .and_then(|value| value.get("created_at"))
        .and_then(Value::as_str)
        .and_then(parse_rfc3339_to_unix_ms)
        .unwrap_or(now_unix_ms);

    Ok(InboundEvent {
        id,
        kind,
        action,
        subject_id,
        payload_summary,
        received_at_unix_ms,
    })
}
