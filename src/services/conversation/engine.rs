//! Conversation Engine
//!
//! Message lifecycle for chat conversations: append, revert and restore,
//! fork, export, compaction and chat turns. Mutations of one conversation
//! serialize through a per-conversation lock; reads go straight to the
//! repository.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use forgeflow_core::{AgentPurpose, AgentRequest, AgentSession, AgentStream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::summarizer::{render_transcript, Summarizer};
use super::tokens::{estimate_tokens, total_tokens};
use crate::models::conversation::{
    CompactionReport, Conversation, ConversationMessage, ConversationNode, MessageRole,
    MessageView, NewConversation, NewMessage,
};
use crate::models::settings::EngineConfig;
use crate::services::agent::{collect_text, run_to_text};
use crate::session_store::SessionStore;
use crate::storage::repository::ConversationRepository;
use crate::utils::error::{AppError, AppResult};

const DEFAULT_TITLE: &str = "New conversation";
const MAX_TITLE_CHARS: usize = 80;

/// One completed (or cancelled) chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatExchange {
    pub user_message: ConversationMessage,
    /// `None` when the turn was cancelled
    pub assistant_message: Option<ConversationMessage>,
    /// Set when the reply pushed the conversation over the compaction trigger
    pub compaction: Option<CompactionReport>,
}

/// A new fork and, when requested, the task generating its title.
#[derive(Debug)]
pub struct ForkOutcome {
    pub conversation: Conversation,
    pub messages: Vec<ConversationMessage>,
    /// Resolves to the retitled conversation, or `None` when generation
    /// failed and the fallback title stays
    pub title_task: Option<JoinHandle<Option<Conversation>>>,
}

pub struct ConversationEngine {
    repo: Arc<dyn ConversationRepository>,
    agent: Arc<dyn AgentStream>,
    summarizer: Arc<dyn Summarizer>,
    store: Arc<SessionStore>,
    config: RwLock<EngineConfig>,
    locks: DashMap<i64, Arc<Mutex<()>>>,
    /// Active chat session per conversation. An empty id marks a session
    /// being opened.
    chats: DashMap<i64, String>,
}

impl ConversationEngine {
    pub fn new(
        repo: Arc<dyn ConversationRepository>,
        agent: Arc<dyn AgentStream>,
        summarizer: Arc<dyn Summarizer>,
        store: Arc<SessionStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            agent,
            summarizer,
            store,
            config: RwLock::new(config),
            locks: DashMap::new(),
            chats: DashMap::new(),
        }
    }

    pub async fn set_config(&self, config: EngineConfig) {
        *self.config.write().await = config;
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    pub fn create_conversation(&self, project_id: i64, title: &str) -> AppResult<Conversation> {
        let title = match title.trim() {
            "" => DEFAULT_TITLE,
            trimmed => trimmed,
        };
        let conversation = self.repo.create_conversation(&NewConversation {
            project_id,
            title: title.to_string(),
            ..Default::default()
        })?;
        info!(
            "[Conversation] Created conversation {} in project {}",
            conversation.id, project_id
        );
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: i64) -> AppResult<Conversation> {
        self.repo
            .find_conversation(id)?
            .ok_or_else(|| AppError::not_found(format!("Conversation {}", id)))
    }

    pub fn list_conversations(&self, project_id: i64) -> AppResult<Vec<ConversationNode>> {
        self.repo.list_conversations(project_id)
    }

    pub fn list_children(&self, conversation_id: i64) -> AppResult<Vec<ConversationNode>> {
        self.get_conversation(conversation_id)?;
        self.repo.list_children(conversation_id)
    }

    pub fn rename(&self, id: i64, title: &str) -> AppResult<Conversation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AppError::validation("Title must not be empty"));
        }
        self.get_conversation(id)?;
        self.repo.update_title(id, title)
    }

    /// Delete a conversation with its messages. Forks keep their rows.
    pub async fn delete_conversation(&self, id: i64) -> AppResult<()> {
        self.cancel_chat(id).await;

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        if !self.repo.delete_conversation(id)? {
            return Err(AppError::not_found(format!("Conversation {}", id)));
        }
        self.store.forget_conversation(id).await;
        self.locks.remove(&id);
        info!("[Conversation] Deleted conversation {}", id);
        Ok(())
    }

    // ========================================================================
    // Messages
    // ========================================================================

    pub fn active_messages(&self, conversation_id: i64) -> AppResult<Vec<ConversationMessage>> {
        self.get_conversation(conversation_id)?;
        self.repo.list_messages(conversation_id, true)
    }

    /// Every message, soft-deleted ones included.
    pub fn all_messages(&self, conversation_id: i64) -> AppResult<Vec<ConversationMessage>> {
        self.get_conversation(conversation_id)?;
        self.repo.list_messages(conversation_id, false)
    }

    pub async fn append_message(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<ConversationMessage> {
        let chars_per_token = self.config.read().await.tokens.chars_per_token;
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        self.get_conversation(conversation_id)?;
        let message = self.repo.insert_message(
            conversation_id,
            &NewMessage {
                role,
                content: content.to_string(),
                metadata,
                token_estimate: estimate_tokens(content, chars_per_token),
                is_compaction_summary: false,
            },
        )?;
        debug!(
            "[Conversation] Appended {} message {} to conversation {} (~{} tokens)",
            role, message.id, conversation_id, message.token_estimate
        );
        Ok(message)
    }

    /// How many active messages a revert to `message_id` would remove.
    pub fn preview_revert(&self, conversation_id: i64, message_id: i64) -> AppResult<usize> {
        let anchor = self.message_in(conversation_id, message_id)?;
        let active = self.repo.list_messages(conversation_id, true)?;
        Ok(active
            .iter()
            .filter(|m| m.order_key() > anchor.order_key())
            .count())
    }

    /// Soft-delete every active message after `message_id`. Returns the ids
    /// that changed; repeating the call returns an empty list.
    pub async fn revert(&self, conversation_id: i64, message_id: i64) -> AppResult<Vec<i64>> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let anchor = self.message_in(conversation_id, message_id)?;
        let active = self.repo.list_messages(conversation_id, true)?;
        let (after, kept): (Vec<_>, Vec<_>) = active
            .into_iter()
            .partition(|m| m.order_key() > anchor.order_key());
        let ids: Vec<i64> = after.iter().map(|m| m.id).collect();

        let changed = self.repo.soft_delete_messages(conversation_id, &ids)?;
        if changed != ids.len() {
            return Err(AppError::concurrent_modification(format!(
                "Conversation {} changed while reverting",
                conversation_id
            )));
        }

        if self.store.active_conversation().await == Some(conversation_id) {
            let visible: BTreeSet<i64> = kept.iter().map(|m| m.id).collect();
            self.store.retain_selection(&visible).await;
        }
        info!(
            "[Conversation] Reverted conversation {} to message {} ({} removed)",
            conversation_id,
            message_id,
            ids.len()
        );
        Ok(ids)
    }

    /// Undo the soft delete of one message.
    pub async fn restore_message(&self, message_id: i64) -> AppResult<ConversationMessage> {
        let message = self.find_message(message_id)?;
        let lock = self.lock_for(message.conversation_id);
        let _guard = lock.lock().await;

        let message = self.find_message(message_id)?;
        if let Some(summary_id) = message.compacted_into {
            return Err(AppError::invalid_transition(format!(
                "Message {} was compacted into summary {}",
                message_id, summary_id
            )));
        }
        if message.is_active() {
            return Ok(message);
        }

        let restored = self
            .repo
            .restore_message(message_id)?
            .ok_or_else(|| AppError::not_found(format!("Message {}", message_id)))?;
        debug!(
            "[Conversation] Restored message {} in conversation {}",
            message_id, restored.conversation_id
        );
        Ok(restored)
    }

    /// Sum of active token estimates.
    pub fn get_token_estimate_total(&self, conversation_id: i64) -> AppResult<i64> {
        let active = self.active_messages(conversation_id)?;
        Ok(total_tokens(active.iter().map(|m| &m.token_estimate)))
    }

    // ========================================================================
    // Fork & export
    // ========================================================================

    /// Branch a conversation at `fork_point` (inclusive), or copy all of it.
    pub async fn fork(
        &self,
        source_id: i64,
        fork_point: Option<i64>,
        generate_title: bool,
    ) -> AppResult<ForkOutcome> {
        let suffix = self.config.read().await.fork.fallback_title_suffix.clone();
        let lock = self.lock_for(source_id);
        let _guard = lock.lock().await;

        let source = self.get_conversation(source_id)?;
        let active = self.repo.list_messages(source_id, true)?;
        let copied: Vec<&ConversationMessage> = match fork_point {
            Some(point_id) => {
                let point = self.message_in(source_id, point_id)?;
                if !point.is_active() {
                    return Err(AppError::invalid_transition(format!(
                        "Fork point {} is deleted",
                        point_id
                    )));
                }
                active
                    .iter()
                    .filter(|m| m.order_key() <= point.order_key())
                    .collect()
            }
            None => active.iter().collect(),
        };

        let input = NewConversation {
            project_id: source.project_id,
            title: format!("{}{}", source.title, suffix),
            parent_conversation_id: Some(source_id),
            fork_point_message_id: fork_point,
        };
        let new_messages: Vec<NewMessage> = copied.iter().map(|m| NewMessage::copy_of(m)).collect();
        let (conversation, messages) = self
            .repo
            .create_conversation_with_messages(&input, &new_messages)?;
        info!(
            "[Conversation] Forked conversation {} into {} ({} messages)",
            source_id,
            conversation.id,
            messages.len()
        );

        let title_task = generate_title.then(|| self.spawn_title_task(conversation.id, &messages));
        Ok(ForkOutcome {
            conversation,
            messages,
            title_task,
        })
    }

    fn spawn_title_task(
        &self,
        conversation_id: i64,
        messages: &[ConversationMessage],
    ) -> JoinHandle<Option<Conversation>> {
        let repo = self.repo.clone();
        let agent = self.agent.clone();
        let request = AgentRequest::new(
            AgentPurpose::TitleGeneration,
            "Write a short title for this conversation.",
        )
        .with_context(json!({
            "conversationId": conversation_id,
            "transcript": render_transcript(messages),
        }));

        tokio::spawn(async move {
            let title = match run_to_text(agent.as_ref(), request).await {
                Ok(text) => clean_title(&text),
                Err(e) => {
                    warn!(
                        "[Conversation] Title generation failed for conversation {}: {}",
                        conversation_id, e
                    );
                    return None;
                }
            };
            let title = title?;
            match repo.update_title(conversation_id, &title) {
                Ok(conversation) => Some(conversation),
                Err(e) => {
                    warn!(
                        "[Conversation] Could not store generated title for conversation {}: {}",
                        conversation_id, e
                    );
                    None
                }
            }
        })
    }

    /// Copy exactly `message_ids`, in their original order, into a new
    /// conversation of `project_id`.
    pub async fn export_to_new_chat(
        &self,
        source_id: i64,
        message_ids: &[i64],
        project_id: i64,
    ) -> AppResult<(Conversation, Vec<ConversationMessage>)> {
        if message_ids.is_empty() {
            return Err(AppError::validation("Select at least one message to export"));
        }

        let lock = self.lock_for(source_id);
        let _guard = lock.lock().await;

        let source = self.get_conversation(source_id)?;
        let wanted: BTreeSet<i64> = message_ids.iter().copied().collect();
        let all = self.repo.list_messages(source_id, false)?;
        let picked: Vec<&ConversationMessage> =
            all.iter().filter(|m| wanted.contains(&m.id)).collect();
        if picked.len() != wanted.len() {
            let found: BTreeSet<i64> = picked.iter().map(|m| m.id).collect();
            let missing: Vec<i64> = wanted.difference(&found).copied().collect();
            return Err(AppError::not_found(format!(
                "Messages {:?} in conversation {}",
                missing, source_id
            )));
        }

        let input = NewConversation {
            project_id,
            title: format!("Export from {}", source.title),
            ..Default::default()
        };
        let new_messages: Vec<NewMessage> = picked.iter().map(|m| NewMessage::copy_of(m)).collect();
        let created = self
            .repo
            .create_conversation_with_messages(&input, &new_messages)?;
        info!(
            "[Conversation] Exported {} messages from conversation {} to {}",
            picked.len(),
            source_id,
            created.0.id
        );
        Ok(created)
    }

    // ========================================================================
    // Compaction
    // ========================================================================

    /// Replace the oldest `fraction` of active messages (by count, floored)
    /// with one summary message.
    pub async fn compact(&self, conversation_id: i64, fraction: f64) -> AppResult<CompactionReport> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(AppError::validation(format!(
                "Compaction fraction must be in (0, 1], got {}",
                fraction
            )));
        }
        let chars_per_token = self.config.read().await.tokens.chars_per_token;

        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        self.get_conversation(conversation_id)?;
        let active = self.repo.list_messages(conversation_id, true)?;
        let count = selection_size(active.len(), fraction);
        if count == 0 {
            return Err(AppError::invalid_transition(format!(
                "Nothing to compact in conversation {} ({} active messages)",
                conversation_id,
                active.len()
            )));
        }

        let range = &active[..count];
        let tokens_before = total_tokens(active.iter().map(|m| &m.token_estimate));
        let summary = self.summarizer.summarize(range).await?;
        if summary.trim().is_empty() {
            return Err(AppError::agent_failure("Compaction summary was empty"));
        }

        let ids: Vec<i64> = range.iter().map(|m| m.id).collect();
        let summary_message = self.repo.apply_compaction(
            conversation_id,
            &ids,
            &NewMessage {
                role: MessageRole::Assistant,
                token_estimate: estimate_tokens(&summary, chars_per_token),
                content: summary,
                metadata: Some(json!({ "compactedMessageCount": count })),
                is_compaction_summary: true,
            },
        )?;

        let remaining = self.repo.list_messages(conversation_id, true)?;
        let tokens_after = total_tokens(remaining.iter().map(|m| &m.token_estimate));
        info!(
            "[Conversation] Compacted {} messages of conversation {} with {}: {} -> {} tokens",
            count,
            conversation_id,
            self.summarizer.name(),
            tokens_before,
            tokens_after
        );

        Ok(CompactionReport {
            conversation_id,
            summary: summary_message,
            compacted_message_ids: ids,
            tokens_before,
            tokens_after,
        })
    }

    /// Compact with the configured fraction once the active total passes the
    /// trigger.
    pub async fn compact_if_needed(&self, conversation_id: i64) -> AppResult<Option<CompactionReport>> {
        let compaction = self.config.read().await.compaction.clone();
        let active = self.active_messages(conversation_id)?;
        let total = total_tokens(active.iter().map(|m| &m.token_estimate));

        if !compaction.should_compact(total) {
            return Ok(None);
        }
        if selection_size(active.len(), compaction.threshold_fraction) == 0 {
            debug!(
                "[Conversation] Conversation {} is over the trigger but too short to compact",
                conversation_id
            );
            return Ok(None);
        }
        self.compact(conversation_id, compaction.threshold_fraction)
            .await
            .map(Some)
    }

    // ========================================================================
    // Chat
    // ========================================================================

    pub fn is_chatting(&self, conversation_id: i64) -> bool {
        self.chats.contains_key(&conversation_id)
    }

    /// Append a user message, run one agent turn over the active history and
    /// append the reply.
    pub async fn send_message(
        &self,
        conversation_id: i64,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<ChatExchange> {
        if content.trim().is_empty() {
            return Err(AppError::validation("Message must not be empty"));
        }
        match self.chats.entry(conversation_id) {
            Entry::Occupied(_) => {
                return Err(AppError::invalid_transition(format!(
                    "A chat turn is already running in conversation {}",
                    conversation_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(String::new());
            }
        }

        let result = self.run_chat(conversation_id, content, metadata).await;
        if result.is_err() {
            self.chats.remove_if(&conversation_id, |_, s| s.is_empty());
        }
        result
    }

    async fn run_chat(
        &self,
        conversation_id: i64,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<ChatExchange> {
        let user_message = self
            .append_message(conversation_id, MessageRole::User, content, metadata)
            .await?;

        let history: Vec<serde_json::Value> = self
            .repo
            .list_messages(conversation_id, true)?
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();
        let request = AgentRequest::new(AgentPurpose::Chat, content)
            .with_context(json!({ "conversationId": conversation_id, "history": history }));

        let AgentSession {
            session_id,
            mut events,
        } = self.agent.start(request).await?;

        let registered = match self.chats.get_mut(&conversation_id) {
            Some(mut slot) if slot.is_empty() => {
                *slot = session_id.clone();
                true
            }
            _ => false,
        };
        if !registered {
            if let Err(e) = self.agent.cancel(&session_id).await {
                warn!("[Conversation] Failed to cancel session {}: {}", session_id, e);
            }
            info!("[Conversation] Chat in conversation {} cancelled while starting", conversation_id);
            return Ok(ChatExchange {
                user_message,
                assistant_message: None,
                compaction: None,
            });
        }

        let reply = collect_text(&session_id, &mut events).await;
        let still_ours = self
            .chats
            .remove_if(&conversation_id, |_, s| s == &session_id)
            .is_some();
        if !still_ours {
            info!("[Conversation] Chat in conversation {} was cancelled", conversation_id);
            return Ok(ChatExchange {
                user_message,
                assistant_message: None,
                compaction: None,
            });
        }

        let reply = reply?;
        let assistant_message = self
            .append_message(conversation_id, MessageRole::Assistant, &reply, None)
            .await?;

        let compaction = match self.compact_if_needed(conversation_id).await {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    "[Conversation] Automatic compaction of conversation {} failed: {}",
                    conversation_id, e
                );
                None
            }
        };

        Ok(ChatExchange {
            user_message,
            assistant_message: Some(assistant_message),
            compaction,
        })
    }

    /// Cancel the running chat turn; returns whether one was running.
    pub async fn cancel_chat(&self, conversation_id: i64) -> bool {
        let Some((_, session_id)) = self.chats.remove(&conversation_id) else {
            return false;
        };
        if !session_id.is_empty() {
            if let Err(e) = self.agent.cancel(&session_id).await {
                warn!("[Conversation] Failed to cancel session {}: {}", session_id, e);
            }
        }
        info!("[Conversation] Cancelled chat in conversation {}", conversation_id);
        true
    }

    // ========================================================================
    // Session views
    // ========================================================================

    /// Make `conversation_id` the open conversation and return its view.
    pub async fn open(&self, conversation_id: i64) -> AppResult<Vec<MessageView>> {
        self.get_conversation(conversation_id)?;
        self.store.set_active_conversation(Some(conversation_id)).await;
        self.message_views(conversation_id).await
    }

    pub async fn close(&self) {
        self.store.set_active_conversation(None).await;
    }

    pub async fn search(&self, query: Option<String>) -> AppResult<Vec<MessageView>> {
        let conversation_id = self.open_conversation_id().await?;
        self.store.set_search_query(query).await;
        self.message_views(conversation_id).await
    }

    /// Flip selection of an active message in the open conversation.
    pub async fn toggle_selection(&self, message_id: i64) -> AppResult<bool> {
        let conversation_id = self.open_conversation_id().await?;
        let message = self.message_in(conversation_id, message_id)?;
        if !message.is_active() {
            return Err(AppError::invalid_transition(format!(
                "Message {} is deleted",
                message_id
            )));
        }
        Ok(self.store.toggle_selection(message_id).await)
    }

    /// Active messages annotated with the session's search and selection.
    /// Annotations only apply to the open conversation.
    pub async fn message_views(&self, conversation_id: i64) -> AppResult<Vec<MessageView>> {
        let active = self.active_messages(conversation_id)?;
        let state = self.store.snapshot().await;
        let is_open = state.active_conversation_id == Some(conversation_id);
        let query = state
            .search_query
            .filter(|_| is_open)
            .map(|q| q.to_lowercase());

        Ok(active
            .into_iter()
            .map(|message| MessageView {
                matches_search: query
                    .as_deref()
                    .map_or(false, |q| message.content.to_lowercase().contains(q)),
                selected: is_open && state.selected_message_ids.contains(&message.id),
                message,
            })
            .collect())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn lock_for(&self, conversation_id: i64) -> Arc<Mutex<()>> {
        self.locks.entry(conversation_id).or_default().clone()
    }

    fn find_message(&self, message_id: i64) -> AppResult<ConversationMessage> {
        self.repo
            .find_message(message_id)?
            .ok_or_else(|| AppError::not_found(format!("Message {}", message_id)))
    }

    fn message_in(&self, conversation_id: i64, message_id: i64) -> AppResult<ConversationMessage> {
        let message = self.find_message(message_id)?;
        if message.conversation_id != conversation_id {
            return Err(AppError::not_found(format!(
                "Message {} in conversation {}",
                message_id, conversation_id
            )));
        }
        Ok(message)
    }

    async fn open_conversation_id(&self) -> AppResult<i64> {
        self.store
            .active_conversation()
            .await
            .ok_or_else(|| AppError::invalid_transition("No conversation is open"))
    }
}

/// Number of messages a compaction of `fraction` selects.
fn selection_size(active: usize, fraction: f64) -> usize {
    ((active as f64) * fraction).floor() as usize
}

/// First non-empty line, unquoted and capped in length.
fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.trim_matches(|c| c == '"' || c == '\'' || c == '#').trim();
    if line.is_empty() {
        return None;
    }
    Some(line.chars().take(MAX_TITLE_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::conversation::summarizer::FnSummarizer;
    use crate::storage::database::Database;
    use forgeflow_core::{ScriptedAgentStream, ScriptedRun};

    fn engine_with(agent: Arc<ScriptedAgentStream>) -> ConversationEngine {
        let summarizer = FnSummarizer::new(|messages| {
            Box::pin(async move { Ok(format!("Summary of {} messages", messages.len())) })
        });
        ConversationEngine::new(
            Arc::new(Database::new_in_memory().unwrap()),
            agent,
            Arc::new(summarizer),
            Arc::new(SessionStore::new()),
            EngineConfig::default(),
        )
    }

    fn engine() -> ConversationEngine {
        engine_with(Arc::new(ScriptedAgentStream::new()))
    }

    async fn seeded(engine: &ConversationEngine, count: usize) -> (Conversation, Vec<ConversationMessage>) {
        let conversation = engine.create_conversation(1, "Design chat").unwrap();
        let mut messages = Vec::new();
        for i in 0..count {
            let role = if i % 2 == 0 {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            messages.push(
                engine
                    .append_message(conversation.id, role, &format!("message number {}", i), None)
                    .await
                    .unwrap(),
            );
        }
        (conversation, messages)
    }

    #[test]
    fn test_selection_size_floors() {
        assert_eq!(selection_size(10, 0.5), 5);
        assert_eq!(selection_size(5, 0.5), 2);
        assert_eq!(selection_size(1, 0.5), 0);
        assert_eq!(selection_size(3, 1.0), 3);
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("\n  \"CSV export plan\"  \nmore"), Some("CSV export plan".to_string()));
        assert_eq!(clean_title("   "), None);
    }

    #[tokio::test]
    async fn test_append_estimates_tokens() {
        let engine = engine();
        let conversation = engine.create_conversation(1, "").unwrap();
        assert_eq!(conversation.title, DEFAULT_TITLE);

        let message = engine
            .append_message(conversation.id, MessageRole::User, "abcdefghi", None)
            .await
            .unwrap();
        assert_eq!(message.token_estimate, 3);
        assert_eq!(engine.get_token_estimate_total(conversation.id).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_append_to_missing_conversation() {
        let err = engine()
            .append_message(99, MessageRole::User, "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_revert_is_idempotent_and_previewable() {
        let engine = engine();
        let (conversation, messages) = seeded(&engine, 5).await;

        assert_eq!(engine.preview_revert(conversation.id, messages[1].id).unwrap(), 3);
        let removed = engine.revert(conversation.id, messages[1].id).await.unwrap();
        assert_eq!(removed, vec![messages[2].id, messages[3].id, messages[4].id]);

        assert!(engine.revert(conversation.id, messages[1].id).await.unwrap().is_empty());
        assert_eq!(engine.preview_revert(conversation.id, messages[1].id).unwrap(), 0);
        assert_eq!(engine.active_messages(conversation.id).unwrap().len(), 2);
        assert_eq!(engine.all_messages(conversation.id).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_revert_with_foreign_message_is_not_found() {
        let engine = engine();
        let (a, _) = seeded(&engine, 2).await;
        let (_, b_messages) = seeded(&engine, 2).await;
        let err = engine.revert(a.id, b_messages[0].id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_restore_rejects_compacted_message() {
        let engine = engine();
        let (conversation, messages) = seeded(&engine, 4).await;
        engine.compact(conversation.id, 0.5).await.unwrap();

        let err = engine.restore_message(messages[0].id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_compact_places_summary_first() {
        let engine = engine();
        let (conversation, messages) = seeded(&engine, 4).await;

        let report = engine.compact(conversation.id, 0.5).await.unwrap();
        assert_eq!(report.compacted_message_ids, vec![messages[0].id, messages[1].id]);
        assert_eq!(report.summary.content, "Summary of 2 messages");

        let active = engine.active_messages(conversation.id).unwrap();
        assert_eq!(active.len(), 3);
        assert!(active[0].is_compaction_summary);
        assert_eq!(active[1].id, messages[2].id);
        assert!(engine.get_conversation(conversation.id).unwrap().is_compacted);
    }

    #[tokio::test]
    async fn test_compact_validation() {
        let engine = engine();
        let (conversation, _) = seeded(&engine, 1).await;

        let err = engine.compact(conversation.id, 0.0).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let err = engine.compact(conversation.id, 1.5).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let err = engine.compact(conversation.id, 0.5).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_compact_if_needed_respects_trigger() {
        let engine = engine();
        let (conversation, _) = seeded(&engine, 4).await;
        assert!(engine.compact_if_needed(conversation.id).await.unwrap().is_none());

        let mut config = EngineConfig::default();
        config.compaction.context_window_tokens = 10;
        config.compaction.trigger_ratio = 0.5;
        engine.set_config(config).await;

        let report = engine.compact_if_needed(conversation.id).await.unwrap();
        assert_eq!(report.unwrap().compacted_message_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_fork_copies_prefix() {
        let engine = engine();
        let (source, messages) = seeded(&engine, 4).await;

        let fork = engine.fork(source.id, Some(messages[1].id), false).await.unwrap();
        assert_eq!(fork.conversation.title, "Design chat (fork)");
        assert_eq!(fork.conversation.parent_conversation_id, Some(source.id));
        assert_eq!(fork.conversation.fork_point_message_id, Some(messages[1].id));
        assert_eq!(fork.messages.len(), 2);
        assert_eq!(fork.messages[1].content, messages[1].content);
        assert!(fork.title_task.is_none());

        let children = engine.list_children(source.id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(engine.active_messages(source.id).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_fork_title_generation() {
        let agent = Arc::new(ScriptedAgentStream::with_runs([ScriptedRun::text(
            "\"Storage options\"",
        )]));
        let engine = engine_with(agent.clone());
        let (source, _) = seeded(&engine, 2).await;

        let fork = engine.fork(source.id, None, true).await.unwrap();
        let retitled = fork.title_task.unwrap().await.unwrap().unwrap();
        assert_eq!(retitled.title, "Storage options");
        assert_eq!(agent.requests()[0].purpose, AgentPurpose::TitleGeneration);
    }

    #[tokio::test]
    async fn test_fork_title_failure_keeps_fallback() {
        let engine = engine_with(Arc::new(ScriptedAgentStream::with_runs([ScriptedRun::error(
            "model overloaded",
        )])));
        let (source, _) = seeded(&engine, 2).await;

        let fork = engine.fork(source.id, None, true).await.unwrap();
        assert!(fork.title_task.unwrap().await.unwrap().is_none());
        assert_eq!(
            engine.get_conversation(fork.conversation.id).unwrap().title,
            "Design chat (fork)"
        );
    }

    #[tokio::test]
    async fn test_export_keeps_relative_order() {
        let engine = engine();
        let (source, messages) = seeded(&engine, 5).await;

        let (exported, copies) = engine
            .export_to_new_chat(source.id, &[messages[3].id, messages[0].id], 2)
            .await
            .unwrap();
        assert_eq!(exported.title, "Export from Design chat");
        assert_eq!(exported.project_id, 2);
        assert_eq!(exported.parent_conversation_id, None);
        let contents: Vec<_> = copies.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["message number 0", "message number 3"]);
    }

    #[tokio::test]
    async fn test_export_unknown_message() {
        let engine = engine();
        let (source, _) = seeded(&engine, 1).await;
        let err = engine.export_to_new_chat(source.id, &[999], 1).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_send_message_appends_reply() {
        let agent = Arc::new(ScriptedAgentStream::with_runs([ScriptedRun::text("Use SQLite.")]));
        let engine = engine_with(agent.clone());
        let conversation = engine.create_conversation(1, "Chat").unwrap();

        let exchange = engine
            .send_message(conversation.id, "Which database?", None)
            .await
            .unwrap();
        assert_eq!(exchange.user_message.content, "Which database?");
        assert_eq!(exchange.assistant_message.unwrap().content, "Use SQLite.");
        assert!(exchange.compaction.is_none());
        assert!(!engine.is_chatting(conversation.id));
        assert_eq!(agent.requests()[0].purpose, AgentPurpose::Chat);
    }

    #[tokio::test]
    async fn test_send_message_agent_error() {
        let engine = engine_with(Arc::new(ScriptedAgentStream::with_runs([ScriptedRun::error(
            "rate limited",
        )])));
        let conversation = engine.create_conversation(1, "Chat").unwrap();

        let err = engine
            .send_message(conversation.id, "hello", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AgentFailure(_)));
        assert!(!engine.is_chatting(conversation.id));
        assert_eq!(engine.active_messages(conversation.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_chat_drops_reply() {
        let agent = Arc::new(ScriptedAgentStream::with_runs([ScriptedRun::Open(vec![])]));
        let engine = Arc::new(engine_with(agent.clone()));
        let conversation = engine.create_conversation(1, "Chat").unwrap();

        let running = {
            let engine = engine.clone();
            let id = conversation.id;
            tokio::spawn(async move { engine.send_message(id, "hello", None).await })
        };
        while !engine.is_chatting(conversation.id) {
            tokio::task::yield_now().await;
        }

        assert!(engine.cancel_chat(conversation.id).await);
        let exchange = running.await.unwrap().unwrap();
        assert!(exchange.assistant_message.is_none());
        assert_eq!(engine.active_messages(conversation.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_and_selection_views() {
        let engine = engine();
        let (conversation, messages) = seeded(&engine, 3).await;

        engine.open(conversation.id).await.unwrap();
        let views = engine.search(Some("NUMBER 1".to_string())).await.unwrap();
        assert_eq!(
            views.iter().filter(|v| v.matches_search).map(|v| v.message.id).collect::<Vec<_>>(),
            vec![messages[1].id]
        );

        assert!(engine.toggle_selection(messages[2].id).await.unwrap());
        engine.revert(conversation.id, messages[0].id).await.unwrap();
        let views = engine.message_views(conversation.id).await.unwrap();
        assert_eq!(views.len(), 1);
        assert!(views.iter().all(|v| !v.selected));
    }

    #[tokio::test]
    async fn test_delete_clears_open_conversation() {
        let engine = engine();
        let (conversation, _) = seeded(&engine, 1).await;
        engine.open(conversation.id).await.unwrap();

        engine.delete_conversation(conversation.id).await.unwrap();
        assert!(engine.search(None).await.is_err());
        assert!(matches!(
            engine.delete_conversation(conversation.id).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }
}
