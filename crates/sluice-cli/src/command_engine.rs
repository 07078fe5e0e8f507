//! Execution-engine binding that shells out to a configured command.
//!
//! The command receives the event JSON on stdin and reports realized cost
//! as JSON on stdout. The real agentic engine lives behind this seam; a
//! stub script is enough for smoke runs.

use std::process::Stdio;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sluice_admission::SizedEvent;
use sluice_dispatch::{EngineError, EngineReport, ExecutionEngine};
use sluice_runtime::EngineConfig;
use tokio::io::AsyncWriteExt;

const REASON_CHAR_LIMIT: usize = 400;

#[derive(Debug, Deserialize)]
struct CommandReport {
    #[serde(default)]
    cost: f64,
    #[serde(default)]
    tokens: u64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

pub(crate) struct CommandEngine {
    command: Vec<String>,
}

impl CommandEngine {
    pub(crate) fn from_config(config: &EngineConfig) -> Result<Self> {
        if config.command.is_empty() {
            bail!("engine.command must be configured (the execution engine is external)");
        }
        Ok(Self {
            command: config.command.clone(),
        })
    }
}

fn truncate_reason(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= REASON_CHAR_LIMIT {
        return trimmed.to_string();
    }
    trimmed.chars().take(REASON_CHAR_LIMIT).collect()
}

#[async_trait]
impl ExecutionEngine for CommandEngine {
    async fn execute(&self, event: &SizedEvent) -> Result<EngineReport, EngineError> {
        let payload = serde_json::to_string(event).map_err(|error| EngineError::Failed {
            reason: format!("failed to encode event payload: {error}"),
        })?;

        let mut command = tokio::process::Command::new(&self.command[0]);
        command
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|error| EngineError::Unavailable {
            reason: format!("failed to spawn engine command: {error}"),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|error| EngineError::Unavailable {
                    reason: format!("failed to write event to engine stdin: {error}"),
                })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|error| EngineError::Unavailable {
                reason: format!("failed to collect engine output: {error}"),
            })?;
        if !output.status.success() {
            return Err(EngineError::Failed {
                reason: format!(
                    "engine exited with {}: {}",
                    output.status,
                    truncate_reason(&String::from_utf8_lossy(&output.stderr))
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let report: CommandReport =
            serde_json::from_str(stdout.trim()).map_err(|_| EngineError::Failed {
                reason: format!("invalid engine report: {}", truncate_reason(&stdout)),
            })?;
        if matches!(report.status.as_deref(), Some("failure")) {
            return Err(EngineError::Failed {
                reason: report
                    .reason
                    .unwrap_or_else(|| "engine reported failure".to_string()),
            });
        }

        Ok(EngineReport {
            cost: report.cost,
            tokens_used: report.tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_admission::{EventKind, InboundEvent};

    fn sized() -> SizedEvent {
        SizedEvent {
            event: InboundEvent {
                id: "issues-1".to_string(),
                kind: EventKind::Issue,
                action: "opened".to_string(),
                subject_id: "issue-1".to_string(),
                payload_summary: "run me".to_string(),
                received_at_unix_ms: 1_000,
            },
            token_estimate: 64,
        }
    }

    #[test]
    fn unit_from_config_requires_a_command() {
        assert!(CommandEngine::from_config(&EngineConfig::default()).is_err());
    }

    #[tokio::test]
    async fn functional_engine_parses_command_report() {
        let engine = CommandEngine {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat >/dev/null; printf '{"cost": 0.75, "tokens": 33}'"#.to_string(),
            ],
        };
        let report = engine.execute(&sized()).await.expect("execute");
        assert_eq!(report.cost, 0.75);
        assert_eq!(report.tokens_used, 33);
    }

    #[tokio::test]
    async fn functional_engine_failure_status_becomes_event_failure() {
        let engine = CommandEngine {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat >/dev/null; printf '{"status": "failure", "reason": "no fix found"}'"#
                    .to_string(),
            ],
        };
        match engine.execute(&sized()).await {
            Err(EngineError::Failed { reason }) => assert_eq!(reason, "no fix found"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn regression_missing_command_binary_is_unavailable_not_failed() {
        let engine = CommandEngine {
            command: vec!["/nonexistent/sluice-engine".to_string()],
        };
        assert!(matches!(
            engine.execute(&sized()).await,
            Err(EngineError::Unavailable { .. })
        ));
    }
}
