//! Session Store
//!
//! Process-local, UI-observable state: which step is expanded, which
//! conversation is open, its search and selection, and live clarification
//! runs. Nothing here is persisted. Reads are open to anyone; only engine
//! operations mutate it.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::services::clarification::phase::ClarificationSnapshot;

/// Point-in-time copy of the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub expanded_step_id: Option<i64>,
    pub active_conversation_id: Option<i64>,
    pub search_query: Option<String>,
    pub selected_message_ids: BTreeSet<i64>,
    /// Live clarification runs keyed by step id
    pub clarifications: HashMap<i64, ClarificationSnapshot>,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    state: RwLock<SessionState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn expanded_step(&self) -> Option<i64> {
        self.state.read().await.expanded_step_id
    }

    pub async fn active_conversation(&self) -> Option<i64> {
        self.state.read().await.active_conversation_id
    }

    pub async fn search_query(&self) -> Option<String> {
        self.state.read().await.search_query.clone()
    }

    pub async fn selected_messages(&self) -> BTreeSet<i64> {
        self.state.read().await.selected_message_ids.clone()
    }

    pub async fn clarification(&self, step_id: i64) -> Option<ClarificationSnapshot> {
        self.state.read().await.clarifications.get(&step_id).cloned()
    }

    // ========================================================================
    // Mutations (engine only)
    // ========================================================================

    pub(crate) async fn set_expanded_step(&self, step_id: Option<i64>) {
        self.state.write().await.expanded_step_id = step_id;
    }

    /// Switch conversations. Search and selection belong to the previous one.
    pub(crate) async fn set_active_conversation(&self, conversation_id: Option<i64>) {
        let mut state = self.state.write().await;
        if state.active_conversation_id != conversation_id {
            state.search_query = None;
            state.selected_message_ids.clear();
        }
        state.active_conversation_id = conversation_id;
    }

    pub(crate) async fn set_search_query(&self, query: Option<String>) {
        self.state.write().await.search_query = query.filter(|q| !q.trim().is_empty());
    }

    /// Flip one message's selection; returns whether it is now selected.
    pub(crate) async fn toggle_selection(&self, message_id: i64) -> bool {
        let mut state = self.state.write().await;
        if state.selected_message_ids.remove(&message_id) {
            false
        } else {
            state.selected_message_ids.insert(message_id);
            true
        }
    }

    pub(crate) async fn clear_selection(&self) {
        self.state.write().await.selected_message_ids.clear();
    }

    /// Drop selected ids that are no longer visible.
    pub(crate) async fn retain_selection(&self, visible: &BTreeSet<i64>) {
        self.state
            .write()
            .await
            .selected_message_ids
            .retain(|id| visible.contains(id));
    }

    pub(crate) async fn put_clarification(&self, snapshot: ClarificationSnapshot) {
        self.state
            .write()
            .await
            .clarifications
            .insert(snapshot.step_id, snapshot);
    }

    /// Apply `f` to a tracked run and return the result.
    pub(crate) async fn update_clarification<F>(
        &self,
        step_id: i64,
        f: F,
    ) -> Option<ClarificationSnapshot>
    where
        F: FnOnce(&mut ClarificationSnapshot),
    {
        let mut state = self.state.write().await;
        let snapshot = state.clarifications.get_mut(&step_id)?;
        f(snapshot);
        Some(snapshot.clone())
    }

    pub(crate) async fn remove_clarification(&self, step_id: i64) -> Option<ClarificationSnapshot> {
        self.state.write().await.clarifications.remove(&step_id)
    }

    /// Forget everything tied to a deleted conversation.
    pub(crate) async fn forget_conversation(&self, conversation_id: i64) {
        let mut state = self.state.write().await;
        if state.active_conversation_id == Some(conversation_id) {
            state.active_conversation_id = None;
            state.search_query = None;
            state.selected_message_ids.clear();
        }
    }
}
