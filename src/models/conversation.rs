//! Conversation Models
//!
//! Chat conversations, their messages, and the annotated views handed to the
//! presentation layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for MessageRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(AppError::validation(format!("Unknown message role: {}", other))),
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub parent_conversation_id: Option<i64>,
    pub fork_point_message_id: Option<i64>,
    pub is_compacted: bool,
    pub compacted_at: Option<String>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Input for creating a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    pub project_id: i64,
    pub title: String,
    #[serde(default)]
    pub parent_conversation_id: Option<i64>,
    #[serde(default)]
    pub fork_point_message_id: Option<i64>,
}

/// Conversation plus its computed child count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationNode {
    pub conversation: Conversation,
    pub child_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: i64,
    pub conversation_id: i64,
    /// Creation order within the conversation
    pub sequence: i64,
    pub role: MessageRole,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub token_estimate: i64,
    pub is_compaction_summary: bool,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    /// Summary message that replaced this one, when compaction removed it
    pub compacted_into: Option<i64>,
    pub created_at: String,
}

impl ConversationMessage {
    /// Position key used for every ordering decision.
    pub fn order_key(&self) -> (i64, i64) {
        (self.sequence, self.id)
    }

    pub fn is_active(&self) -> bool {
        !self.is_deleted
    }
}

/// Input for inserting a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub token_estimate: i64,
    #[serde(default)]
    pub is_compaction_summary: bool,
}

impl NewMessage {
    /// Copy of an existing message for a new conversation.
    pub fn copy_of(message: &ConversationMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            metadata: message.metadata.clone(),
            token_estimate: message.token_estimate,
            is_compaction_summary: message.is_compaction_summary,
        }
    }
}

/// An active message annotated with session search/selection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub message: ConversationMessage,
    pub matches_search: bool,
    pub selected: bool,
}

/// Result of a compaction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionReport {
    pub conversation_id: i64,
    pub summary: ConversationMessage,
    pub compacted_message_ids: Vec<i64>,
    pub tokens_before: i64,
    pub tokens_after: i64,
}
