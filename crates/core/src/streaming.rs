//! Agent Stream Types
//!
//! Backend-agnostic event types and the collaborator trait through which the
//! engine talks to an agent run. A backend turns whatever its provider emits
//! into `AgentStreamEvent`s, tags them with the session id and pushes them
//! through the session's channel in order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::CoreResult;

/// A single event emitted by an agent session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    /// The agent moved into a new phase of its run (backend-defined name)
    PhaseChange { phase: String },

    /// Incremental answer text
    Text { content: String },

    /// Incremental thinking/reasoning text
    Thinking { content: String },

    /// The agent invoked a tool
    ToolUse {
        tool_id: String,
        tool_name: String,
        #[serde(default)]
        input: serde_json::Value,
    },

    /// A tool invocation finished
    ToolResult {
        tool_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    /// Terminal success with the structured outcome payload
    Complete { outcome: serde_json::Value },

    /// Terminal failure
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl AgentStreamEvent {
    /// Whether this event ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Error code backends use to report that the run timed out.
    pub const TIMEOUT_CODE: &'static str = "timeout";

    /// Whether this is an error event carrying the timeout code.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Error { code: Some(code), .. } if code == Self::TIMEOUT_CODE)
    }
}

/// An event tagged with the session that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEvent {
    pub session_id: String,
    pub event: AgentStreamEvent,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, event: AgentStreamEvent) -> Self {
        Self {
            session_id: session_id.into(),
            event,
        }
    }
}

/// What an agent run is for. Backends may pick prompts/agents by purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPurpose {
    Clarification,
    Chat,
    Compaction,
    TitleGeneration,
}

/// Request to open an agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub purpose: AgentPurpose,
    /// Prompt text handed to the agent
    pub prompt: String,
    /// Free-form context (step ids, prior questions, message history, ...)
    #[serde(default)]
    pub context: serde_json::Value,
    /// Optional agent definition reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl AgentRequest {
    pub fn new(purpose: AgentPurpose, prompt: impl Into<String>) -> Self {
        Self {
            purpose,
            prompt: prompt.into(),
            context: serde_json::Value::Null,
            agent_id: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_agent(mut self, agent_id: Option<String>) -> Self {
        self.agent_id = agent_id;
        self
    }
}

/// An open agent session: its id plus the ordered event receiver.
#[derive(Debug)]
pub struct AgentSession {
    pub session_id: String,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// The agent stream collaborator.
///
/// `start` returns once the session exists; events then arrive on the
/// session's receiver over time. `cancel` must be safe for unknown or already
/// finished sessions.
#[async_trait]
pub trait AgentStream: Send + Sync {
    async fn start(&self, request: AgentRequest) -> CoreResult<AgentSession>;

    async fn cancel(&self, session_id: &str) -> CoreResult<()>;
}
