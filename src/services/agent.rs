//! Agent Runs
//!
//! Helpers for purposes that treat an agent run as "prompt in, text out":
//! chat replies, compaction summaries and fork titles.

use forgeflow_core::{AgentRequest, AgentSession, AgentStream, AgentStreamEvent, SessionEvent};
use tokio::sync::mpsc;
use tracing::debug;

use crate::utils::error::{AppError, AppResult};

/// Start a run and wait for its final text.
pub async fn run_to_text(agent: &dyn AgentStream, request: AgentRequest) -> AppResult<String> {
    let purpose = request.purpose;
    let AgentSession {
        session_id,
        mut events,
    } = agent.start(request).await?;
    debug!("[Agent] Started {:?} session {}", purpose, session_id);
    collect_text(&session_id, &mut events).await
}

/// Drain a session until its terminal event.
///
/// Streamed `text` is accumulated; a `complete` outcome that is a string (or
/// an object with a `text` field) takes precedence over it. Events tagged
/// with another session id are dropped.
pub async fn collect_text(
    session_id: &str,
    events: &mut mpsc::Receiver<SessionEvent>,
) -> AppResult<String> {
    let mut streamed = String::new();

    while let Some(SessionEvent { session_id: from, event }) = events.recv().await {
        if from != session_id {
            debug!("[Agent] Dropping event from foreign session {}", from);
            continue;
        }

        match event {
            AgentStreamEvent::Text { content } => streamed.push_str(&content),
            AgentStreamEvent::Complete { outcome } => {
                return Ok(outcome_text(&outcome).unwrap_or(streamed));
            }
            AgentStreamEvent::Error { message, code } => {
                if code.as_deref() == Some(AgentStreamEvent::TIMEOUT_CODE) {
                    return Err(AppError::agent_failure(format!("timed out: {}", message)));
                }
                return Err(AppError::agent_failure(message));
            }
            AgentStreamEvent::PhaseChange { .. }
            | AgentStreamEvent::Thinking { .. }
            | AgentStreamEvent::ToolUse { .. }
            | AgentStreamEvent::ToolResult { .. } => {}
        }
    }

    Err(AppError::agent_failure(format!(
        "Session {} ended without a result",
        session_id
    )))
}

fn outcome_text(outcome: &serde_json::Value) -> Option<String> {
    match outcome {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Object(map) => map
            .get("text")
            .and_then(|t| t.as_str())
            .map(str::to_string),
        _ => None,
    }
}
