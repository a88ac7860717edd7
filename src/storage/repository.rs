//! Repository Contracts
//!
//! Persistence seams used by the engines. Every method is a single atomic
//! operation: either the whole write lands or nothing does. Lookups return
//! `Ok(None)` rather than an error when the row does not exist.

use crate::models::conversation::{
    Conversation, ConversationMessage, ConversationNode, NewConversation, NewMessage,
};
use crate::models::workflow::{
    NewWorkflow, StepStatus, StepType, StepUpdate, Workflow, WorkflowStatus, WorkflowStep,
};
use crate::utils::error::AppResult;

/// Initial type and status of a step created alongside its workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSeed {
    pub step_type: StepType,
    pub status: StepStatus,
}

impl StepSeed {
    pub fn new(step_type: StepType, status: StepStatus) -> Self {
        Self { step_type, status }
    }
}

/// Durable storage for workflows and their steps.
pub trait WorkflowRepository: Send + Sync {
    /// Insert a workflow and its steps (numbered from 1 in seed order).
    fn create_workflow(
        &self,
        input: &NewWorkflow,
        steps: &[StepSeed],
    ) -> AppResult<(Workflow, Vec<WorkflowStep>)>;

    fn find_workflow(&self, id: i64) -> AppResult<Option<Workflow>>;

    fn list_workflows(&self, project_id: i64) -> AppResult<Vec<Workflow>>;

    /// Compare-and-set the workflow status.
    ///
    /// Fails with `ConcurrentModification` when `expected_version` is stale and
    /// `NotFound` when the row is gone.
    fn update_workflow_status(
        &self,
        id: i64,
        expected_version: i64,
        status: WorkflowStatus,
    ) -> AppResult<Workflow>;

    /// Delete a workflow; its steps go with it.
    fn delete_workflow(&self, id: i64) -> AppResult<bool>;

    fn find_step(&self, id: i64) -> AppResult<Option<WorkflowStep>>;

    /// Steps of a workflow in step order, optionally filtered by status.
    fn list_steps(
        &self,
        workflow_id: i64,
        status: Option<StepStatus>,
    ) -> AppResult<Vec<WorkflowStep>>;

    /// Compare-and-set a step. `update.workflow_status`, when present, is
    /// applied to the owning workflow inside the same transaction.
    fn update_step(
        &self,
        id: i64,
        expected_version: i64,
        update: &StepUpdate,
    ) -> AppResult<WorkflowStep>;
}

/// Durable storage for conversations and their messages.
pub trait ConversationRepository: Send + Sync {
    fn create_conversation(&self, input: &NewConversation) -> AppResult<Conversation>;

    /// Create a conversation pre-populated with copies of messages, in order.
    fn create_conversation_with_messages(
        &self,
        input: &NewConversation,
        messages: &[NewMessage],
    ) -> AppResult<(Conversation, Vec<ConversationMessage>)>;

    fn find_conversation(&self, id: i64) -> AppResult<Option<Conversation>>;

    fn list_conversations(&self, project_id: i64) -> AppResult<Vec<ConversationNode>>;

    fn list_children(&self, parent_id: i64) -> AppResult<Vec<ConversationNode>>;

    fn update_title(&self, id: i64, title: &str) -> AppResult<Conversation>;

    /// Delete a conversation and its messages. Children keep their rows with
    /// the parent link cleared.
    fn delete_conversation(&self, id: i64) -> AppResult<bool>;

    /// Append a message at the end of the conversation.
    fn insert_message(
        &self,
        conversation_id: i64,
        message: &NewMessage,
    ) -> AppResult<ConversationMessage>;

    fn find_message(&self, id: i64) -> AppResult<Option<ConversationMessage>>;

    /// Messages in `(sequence, id)` order; `active_only` drops soft-deleted rows.
    fn list_messages(
        &self,
        conversation_id: i64,
        active_only: bool,
    ) -> AppResult<Vec<ConversationMessage>>;

    /// Soft-delete the listed messages that are still active. Returns how many
    /// rows changed.
    fn soft_delete_messages(&self, conversation_id: i64, ids: &[i64]) -> AppResult<usize>;

    /// Clear the soft-delete marker on one message.
    fn restore_message(&self, id: i64) -> AppResult<Option<ConversationMessage>>;

    /// Replace `ids` with `summary` in one transaction: insert the summary at
    /// the position of the first replaced message, soft-delete the range with
    /// `compacted_into` pointing at the summary, and mark the conversation
    /// compacted. Fails with `ConcurrentModification` if any id is no longer
    /// active.
    fn apply_compaction(
        &self,
        conversation_id: i64,
        ids: &[i64],
        summary: &NewMessage,
    ) -> AppResult<ConversationMessage>;
}

/// `?, ?, ?` for an `IN (...)` clause.
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
