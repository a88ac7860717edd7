//! Compaction Summarizers
//!
//! A summarizer turns the oldest slice of a conversation into one summary
//! text. The default goes through the agent stream; `FnSummarizer` wraps a
//! plain async callback.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use forgeflow_core::{AgentPurpose, AgentRequest, AgentStream};
use serde_json::json;

use crate::models::conversation::ConversationMessage;
use crate::services::agent::run_to_text;
use crate::utils::error::AppResult;

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `messages`, given in conversation order.
    async fn summarize(&self, messages: &[ConversationMessage]) -> AppResult<String>;

    fn name(&self) -> &str;
}

// ============================================================================
// AgentSummarizer
// ============================================================================

/// Summarizes through a `compaction` agent run.
pub struct AgentSummarizer {
    agent: Arc<dyn AgentStream>,
}

impl AgentSummarizer {
    pub fn new(agent: Arc<dyn AgentStream>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Summarizer for AgentSummarizer {
    async fn summarize(&self, messages: &[ConversationMessage]) -> AppResult<String> {
        let transcript = render_transcript(messages);
        let request = AgentRequest::new(
            AgentPurpose::Compaction,
            format!(
                "Summarize the following {} messages so the conversation can continue without them.",
                messages.len()
            ),
        )
        .with_context(json!({
            "transcript": transcript,
            "messageIds": messages.iter().map(|m| m.id).collect::<Vec<_>>(),
        }));
        let summary = run_to_text(self.agent.as_ref(), request).await?;
        Ok(summary.trim().to_string())
    }

    fn name(&self) -> &str {
        "AgentSummarizer"
    }
}

// ============================================================================
// FnSummarizer
// ============================================================================

/// Async summarization callback.
pub type SummarizeFn = Box<
    dyn Fn(Vec<ConversationMessage>) -> Pin<Box<dyn Future<Output = AppResult<String>> + Send>>
        + Send
        + Sync,
>;

/// Summarizer backed by a callback, for embedders that summarize without an
/// agent session.
pub struct FnSummarizer {
    summarize: SummarizeFn,
}

impl FnSummarizer {
    pub fn new<F>(summarize: F) -> Self
    where
        F: Fn(Vec<ConversationMessage>) -> Pin<Box<dyn Future<Output = AppResult<String>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            summarize: Box::new(summarize),
        }
    }
}

#[async_trait]
impl Summarizer for FnSummarizer {
    async fn summarize(&self, messages: &[ConversationMessage]) -> AppResult<String> {
        (self.summarize)(messages.to_vec()).await
    }

    fn name(&self) -> &str {
        "FnSummarizer"
    }
}

/// `role: content` lines, one message per block.
pub fn render_transcript(messages: &[ConversationMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}
