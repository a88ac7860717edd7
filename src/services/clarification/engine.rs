//! Clarification Engine
//!
//! Drives clarification runs for clarification steps: opens the agent
//! session, folds its events into the UI snapshot, and persists the outcome
//! through the pipeline engine once the run completes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use forgeflow_core::{AgentPurpose, AgentRequest, AgentSession, AgentStream, AgentStreamEvent, SessionEvent};
use serde_json::json;
use tracing::{debug, info, warn};

use super::outcome::ClarificationOutcome;
use super::phase::{ClarificationPhase, ClarificationSnapshot, RunMode};
use crate::models::clarification::{ClarificationOutput, ClarificationQuestion};
use crate::models::workflow::{StepStatus, StepType, StepUpdate, WorkflowStep};
use crate::services::pipeline::engine::elapsed_ms;
use crate::services::pipeline::gate;
use crate::services::pipeline::{PipelineEngine, StepContext};
use crate::session_store::SessionStore;
use crate::storage::database::now_timestamp;
use crate::utils::error::{AppError, AppResult};

pub struct ClarificationEngine {
    pipeline: Arc<PipelineEngine>,
    agent: Arc<dyn AgentStream>,
    store: Arc<SessionStore>,
    max_questions: AtomicUsize,
    /// Active session per step id. An empty id marks a session being opened.
    sessions: DashMap<i64, String>,
}

impl ClarificationEngine {
    pub fn new(
        pipeline: Arc<PipelineEngine>,
        agent: Arc<dyn AgentStream>,
        store: Arc<SessionStore>,
        max_questions: usize,
    ) -> Self {
        Self {
            pipeline,
            agent,
            store,
            max_questions: AtomicUsize::new(max_questions),
            sessions: DashMap::new(),
        }
    }

    pub fn set_max_questions(&self, max_questions: usize) {
        self.max_questions.store(max_questions, Ordering::Relaxed);
    }

    /// Whether a run is in flight for the step.
    pub fn is_active(&self, step_id: i64) -> bool {
        self.sessions.contains_key(&step_id)
    }

    // ========================================================================
    // Starting runs
    // ========================================================================

    /// Open the first clarification run of a step.
    ///
    /// The step must be pending with its dependencies met, or already running
    /// without generated questions.
    pub async fn start(&self, workflow_id: i64, step_id: i64) -> AppResult<AgentSession> {
        let ctx = self.pipeline.load_step(step_id)?;
        if ctx.workflow.id != workflow_id {
            return Err(AppError::not_found(format!(
                "Step {} in workflow {}",
                step_id, workflow_id
            )));
        }
        ensure_clarification_step(&ctx.step)?;
        ctx.ensure_workflow_active()?;
        ensure_initial_allowed(&ctx)?;

        let context = json!({
            "workflowId": workflow_id,
            "stepId": step_id,
            "mode": RunMode::Initial.as_str(),
            "maxQuestions": self.max_questions.load(Ordering::Relaxed),
        });
        self.open_session(&ctx, RunMode::Initial, context).await
    }

    /// Replace the step's questions and answers with a fresh run.
    pub async fn rerun(&self, step_id: i64) -> AppResult<AgentSession> {
        let ctx = self.load_finished(step_id)?;
        let context = json!({
            "workflowId": ctx.workflow.id,
            "stepId": step_id,
            "mode": RunMode::Rerun.as_str(),
            "maxQuestions": self.max_questions.load(Ordering::Relaxed),
        });
        self.open_session(&ctx, RunMode::Rerun, context).await
    }

    /// Ask for further questions, keeping existing questions and answers.
    pub async fn generate_more(&self, step_id: i64) -> AppResult<AgentSession> {
        let ctx = self.load_finished(step_id)?;
        let existing = current_output(&ctx.step);
        let context = json!({
            "workflowId": ctx.workflow.id,
            "stepId": step_id,
            "mode": RunMode::GenerateMore.as_str(),
            "maxQuestions": self.max_questions.load(Ordering::Relaxed),
            "existingQuestions": existing.questions,
            "existingAnswers": existing.answers,
        });
        self.open_session(&ctx, RunMode::GenerateMore, context).await
    }

    fn load_finished(&self, step_id: i64) -> AppResult<StepContext> {
        let ctx = self.pipeline.load_step(step_id)?;
        ensure_clarification_step(&ctx.step)?;
        if !matches!(ctx.step.status, StepStatus::Completed | StepStatus::Skipped) {
            return Err(AppError::invalid_transition(format!(
                "Clarification step {} is {}, not finished",
                ctx.step.step_number, ctx.step.status
            )));
        }
        self.pipeline.ensure_reopenable(&ctx)?;
        Ok(ctx)
    }

    async fn open_session(
        &self,
        ctx: &StepContext,
        mode: RunMode,
        context: serde_json::Value,
    ) -> AppResult<AgentSession> {
        let step_id = ctx.step.id;
        match self.sessions.entry(step_id) {
            Entry::Occupied(_) => {
                return Err(AppError::invalid_transition(format!(
                    "A clarification run is already active for step {}",
                    step_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(String::new());
            }
        }

        let request = AgentRequest::new(AgentPurpose::Clarification, ctx.workflow.feature_request.clone())
            .with_context(context)
            .with_agent(ctx.workflow.clarification_agent_id.clone());

        let session = match self.agent.start(request).await {
            Ok(session) => session,
            Err(e) => {
                self.sessions.remove(&step_id);
                warn!("[Clarification] Failed to start run for step {}: {}", step_id, e);
                return Err(e.into());
            }
        };

        let registered = match self.sessions.get_mut(&step_id) {
            Some(mut slot) => {
                *slot = session.session_id.clone();
                true
            }
            None => false,
        };
        if !registered {
            if let Err(e) = self.agent.cancel(&session.session_id).await {
                warn!("[Clarification] Failed to cancel session {}: {}", session.session_id, e);
            }
            return Err(AppError::invalid_transition(
                "Clarification was cancelled while starting",
            ));
        }

        self.store
            .put_clarification(ClarificationSnapshot::new(
                ctx.workflow.id,
                step_id,
                mode,
                session.session_id.clone(),
            ))
            .await;
        info!(
            "[Clarification] Started {} run for step {} (session {})",
            mode.as_str(),
            step_id,
            session.session_id
        );
        Ok(session)
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    /// Drain a session until it ends and return the resulting snapshot.
    pub async fn drive(&self, session: AgentSession) -> AppResult<ClarificationSnapshot> {
        let AgentSession {
            session_id,
            mut events,
        } = session;
        let step_id = self.step_for_session(&session_id).ok_or_else(|| {
            AppError::invalid_transition(format!("Session {} is not tracked", session_id))
        })?;

        while let Some(event) = events.recv().await {
            let terminal = event.session_id == session_id && event.event.is_terminal();
            self.apply_event(event).await?;
            if terminal || !self.is_tracked(step_id, &session_id) {
                break;
            }
        }

        if self.untrack(step_id, &session_id) {
            self.fail_run(
                step_id,
                AppError::agent_failure("Agent stream ended without a result"),
            )
            .await?;
        }
        self.snapshot(step_id).await
    }

    /// Fold one session event into the run it belongs to.
    ///
    /// Events from sessions that are not tracked (cancelled or foreign) are
    /// dropped and yield `None`.
    pub async fn apply_event(&self, event: SessionEvent) -> AppResult<Option<ClarificationSnapshot>> {
        let SessionEvent { session_id, event } = event;
        let Some(step_id) = self.step_for_session(&session_id) else {
            debug!("[Clarification] Discarding event from untracked session {}", session_id);
            return Ok(None);
        };

        match event {
            AgentStreamEvent::PhaseChange { phase } => {
                let next = match phase.parse::<ClarificationPhase>() {
                    Ok(next) if next.is_in_flight() => next,
                    _ => {
                        warn!("[Clarification] Ignoring phase '{}' for step {}", phase, step_id);
                        return Ok(self.store.clarification(step_id).await);
                    }
                };
                Ok(self
                    .store
                    .update_clarification(step_id, |s| {
                        if s.phase.is_regression(next) {
                            warn!(
                                "[Clarification] Ignoring phase regression {} -> {} for step {}",
                                s.phase, next, step_id
                            );
                        } else {
                            s.phase = next;
                        }
                    })
                    .await)
            }
            AgentStreamEvent::Text { content } => Ok(self
                .store
                .update_clarification(step_id, |s| s.text.push_str(&content))
                .await),
            AgentStreamEvent::Thinking { content } => Ok(self
                .store
                .update_clarification(step_id, |s| s.thinking.push_str(&content))
                .await),
            AgentStreamEvent::ToolUse {
                tool_id,
                tool_name,
                input,
            } => Ok(self
                .store
                .update_clarification(step_id, |s| s.tool_started(tool_id, tool_name, input))
                .await),
            AgentStreamEvent::ToolResult {
                tool_id,
                output,
                is_error,
            } => Ok(self
                .store
                .update_clarification(step_id, |s| s.tool_finished(&tool_id, output, is_error))
                .await),
            AgentStreamEvent::Complete { outcome } => {
                self.untrack(step_id, &session_id);
                self.finish(step_id, &outcome).await
            }
            AgentStreamEvent::Error { message, code } => {
                self.untrack(step_id, &session_id);
                let message = if code.as_deref() == Some(AgentStreamEvent::TIMEOUT_CODE) {
                    format!("timed out: {}", message)
                } else {
                    message
                };
                warn!("[Clarification] Run for step {} failed: {}", step_id, message);
                Ok(self
                    .store
                    .update_clarification(step_id, |s| {
                        s.phase = ClarificationPhase::Error;
                        s.error = Some(message);
                        s.session_id = None;
                        s.active_tools.clear();
                    })
                    .await)
            }
        }
    }

    async fn finish(
        &self,
        step_id: i64,
        outcome: &serde_json::Value,
    ) -> AppResult<Option<ClarificationSnapshot>> {
        let mode = self
            .store
            .clarification(step_id)
            .await
            .map(|s| s.mode)
            .unwrap_or(RunMode::Initial);

        let outcome = match ClarificationOutcome::parse(outcome) {
            Ok(outcome) => outcome,
            Err(e) => return self.fail_run(step_id, e).await,
        };

        match self.persist_outcome(step_id, mode, &outcome) {
            Ok(phase) => {
                info!(
                    "[Clarification] Step {} {} run finished: {}",
                    step_id,
                    mode.as_str(),
                    phase
                );
                Ok(self
                    .store
                    .update_clarification(step_id, |s| {
                        s.phase = phase;
                        s.outcome = Some(outcome);
                        s.session_id = None;
                        s.active_tools.clear();
                    })
                    .await)
            }
            Err(e) => self.fail_run(step_id, e).await,
        }
    }

    /// Record a failed run. Agent failures stay in the snapshot; persistence
    /// errors are also returned to the caller.
    async fn fail_run(
        &self,
        step_id: i64,
        err: AppError,
    ) -> AppResult<Option<ClarificationSnapshot>> {
        warn!("[Clarification] Run for step {} failed: {}", step_id, err);
        let message = err.to_string();
        let snapshot = self
            .store
            .update_clarification(step_id, |s| {
                s.phase = ClarificationPhase::Error;
                s.error = Some(message);
                s.session_id = None;
                s.active_tools.clear();
            })
            .await;

        match err {
            AppError::AgentFailure(_) => Ok(snapshot),
            other => Err(other),
        }
    }

    /// Write a run's outcome. The step is reloaded so the transition is
    /// validated against its current state.
    fn persist_outcome(
        &self,
        step_id: i64,
        mode: RunMode,
        outcome: &ClarificationOutcome,
    ) -> AppResult<ClarificationPhase> {
        let ctx = self.pipeline.load_step(step_id)?;
        ctx.ensure_workflow_active()?;

        match (mode, outcome) {
            (RunMode::Initial, ClarificationOutcome::Questions { questions }) => {
                ensure_initial_allowed(&ctx)?;
                let mut update = if ctx.step.status == StepStatus::Pending {
                    PipelineEngine::running_update(&ctx)
                } else {
                    StepUpdate::default()
                };
                let output = ClarificationOutput::with_questions(questions.clone());
                update.output_structured = Some(Some(serde_json::to_value(&output)?));
                self.pipeline.write_step(&ctx, update)?;
                Ok(ClarificationPhase::AwaitingAnswers)
            }
            (RunMode::Initial, ClarificationOutcome::Skip { reason }) => {
                ensure_initial_allowed(&ctx)?;
                self.write_skipped(&ctx, reason)?;
                Ok(ClarificationPhase::Skipped)
            }
            (RunMode::Rerun, ClarificationOutcome::Questions { questions }) => {
                self.pipeline.ensure_reopenable(&ctx)?;
                let mut update = PipelineEngine::reopen_update(&ctx);
                let output = ClarificationOutput::with_questions(questions.clone());
                update.output_structured = Some(Some(serde_json::to_value(&output)?));
                self.pipeline.write_step(&ctx, update)?;
                Ok(ClarificationPhase::AwaitingAnswers)
            }
            (RunMode::Rerun, ClarificationOutcome::Skip { reason }) => {
                self.pipeline.ensure_reopenable(&ctx)?;
                self.write_skipped(&ctx, reason)?;
                Ok(ClarificationPhase::Skipped)
            }
            (RunMode::GenerateMore, ClarificationOutcome::Questions { questions }) => {
                self.pipeline.ensure_reopenable(&ctx)?;
                let mut output = current_output(&ctx.step);
                output.append_questions(questions.clone());
                let mut update = PipelineEngine::running_update(&ctx);
                update.started_at = None;
                update.output_structured = Some(Some(serde_json::to_value(&output)?));
                update.completed_at = Some(None);
                update.duration_ms = Some(None);
                self.pipeline.write_step(&ctx, update)?;
                Ok(ClarificationPhase::AwaitingAnswers)
            }
            (RunMode::GenerateMore, ClarificationOutcome::Skip { reason }) => {
                info!(
                    "[Clarification] No further questions for step {}: {}",
                    step_id, reason
                );
                Ok(ClarificationPhase::Complete)
            }
        }
    }

    /// Complete the step as skipped in one write, entering the running family
    /// first when it was still pending.
    fn write_skipped(&self, ctx: &StepContext, reason: &str) -> AppResult<WorkflowStep> {
        let output = ClarificationOutput::skipped(reason);
        let mut update = if ctx.step.status == StepStatus::Pending {
            PipelineEngine::running_update(ctx)
        } else {
            StepUpdate::default()
        };
        update.status = Some(StepStatus::Completed);
        update.output_text = Some(Some(output.to_output_text()));
        update.output_structured = Some(Some(serde_json::to_value(&output)?));
        update.error_message = Some(None);
        update.completed_at = Some(Some(now_timestamp()));
        update.duration_ms = Some(elapsed_ms(ctx.step.started_at.as_deref()));
        self.pipeline.write_step(ctx, update)
    }

    // ========================================================================
    // User actions
    // ========================================================================

    /// Merge answers into the step's output and complete it in one write.
    pub async fn submit_answers(
        &self,
        step_id: i64,
        current: ClarificationOutput,
        answers: BTreeMap<usize, String>,
    ) -> AppResult<WorkflowStep> {
        if self.is_active(step_id) {
            return Err(AppError::invalid_transition(format!(
                "A clarification run is still active for step {}",
                step_id
            )));
        }

        let ctx = self.pipeline.load_step(step_id)?;
        ensure_clarification_step(&ctx.step)?;
        ctx.ensure_workflow_active()?;
        let phase = ClarificationPhase::from_step(&ctx.step);
        if phase != ClarificationPhase::AwaitingAnswers {
            return Err(AppError::invalid_transition(format!(
                "Cannot submit answers for step {} while {} ({})",
                ctx.step.step_number, phase, ctx.step.status
            )));
        }
        if current.questions != questions_of(&ctx.step) {
            return Err(AppError::invalid_transition(format!(
                "Questions for step {} changed since they were loaded",
                ctx.step.step_number
            )));
        }
        if let Some(index) = answers.keys().find(|i| **i >= current.questions.len()) {
            return Err(AppError::validation(format!(
                "Answer index {} is out of range ({} questions)",
                index,
                current.questions.len()
            )));
        }

        let mut output = current;
        output.merge_answers(answers);
        let step = self.pipeline.write_step(
            &ctx,
            StepUpdate {
                status: Some(StepStatus::Completed),
                output_text: Some(Some(output.to_output_text())),
                output_structured: Some(Some(serde_json::to_value(&output)?)),
                error_message: Some(None),
                duration_ms: Some(elapsed_ms(ctx.step.started_at.as_deref())),
                completed_at: Some(Some(now_timestamp())),
                ..Default::default()
            },
        )?;

        self.store.remove_clarification(step_id).await;
        info!(
            "[Clarification] Step {} completed with {}/{} answers",
            step_id,
            output.answered_count(),
            output.questions.len()
        );
        Ok(step)
    }

    /// Skip clarification. Any active run is cancelled once the skip has
    /// been validated.
    pub async fn skip(&self, step_id: i64, reason: Option<String>) -> AppResult<WorkflowStep> {
        let ctx = self.pipeline.load_step(step_id)?;
        ensure_clarification_step(&ctx.step)?;
        ctx.ensure_workflow_active()?;
        let pending = ctx.step.status == StepStatus::Pending;
        if pending {
            // skipping a pending step enters the running family first
            ctx.ensure_workflow_unpaused()?;
        }
        let pending_ready = pending
            && gate::dependencies_met(&ctx.step, ctx.predecessor(), ctx.other_running());
        if !(pending_ready || ctx.step.status.is_running_family()) {
            return Err(AppError::invalid_transition(format!(
                "Cannot skip clarification step {} from {}",
                ctx.step.step_number, ctx.step.status
            )));
        }

        self.cancel_session(step_id).await;
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "Skipped by user".to_string());
        let step = self.write_skipped(&ctx, &reason)?;
        self.store.remove_clarification(step_id).await;
        Ok(step)
    }

    /// Abandon the active run. Persisted state is never touched; late events
    /// from the cancelled session are discarded.
    pub async fn cancel(&self, step_id: i64) -> AppResult<()> {
        self.cancel_session(step_id).await;
        self.store.remove_clarification(step_id).await;
        Ok(())
    }

    /// Clear an errored run so the step returns to its at-rest phase.
    pub async fn acknowledge_error(&self, step_id: i64) -> AppResult<()> {
        match self.store.clarification(step_id).await {
            Some(s) if s.phase == ClarificationPhase::Error => {
                self.store.remove_clarification(step_id).await;
                Ok(())
            }
            _ => Err(AppError::invalid_transition(format!(
                "No failed clarification run for step {}",
                step_id
            ))),
        }
    }

    /// Current snapshot, or the phase implied by the stored step.
    pub async fn snapshot(&self, step_id: i64) -> AppResult<ClarificationSnapshot> {
        if let Some(snapshot) = self.store.clarification(step_id).await {
            return Ok(snapshot);
        }
        let step = self.pipeline.get_step(step_id)?;
        Ok(ClarificationSnapshot::at_rest(&step))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn cancel_session(&self, step_id: i64) {
        let Some((_, session_id)) = self.sessions.remove(&step_id) else {
            return;
        };
        if !session_id.is_empty() {
            if let Err(e) = self.agent.cancel(&session_id).await {
                warn!("[Clarification] Failed to cancel session {}: {}", session_id, e);
            }
        }
        info!("[Clarification] Cancelled run for step {}", step_id);
    }

    fn step_for_session(&self, session_id: &str) -> Option<i64> {
        if session_id.is_empty() {
            return None;
        }
        self.sessions
            .iter()
            .find(|entry| entry.value() == session_id)
            .map(|entry| *entry.key())
    }

    fn is_tracked(&self, step_id: i64, session_id: &str) -> bool {
        self.sessions
            .get(&step_id)
            .map_or(false, |s| s.value() == session_id)
    }

    /// Stop tracking `session_id`; returns whether it was still tracked.
    fn untrack(&self, step_id: i64, session_id: &str) -> bool {
        self.sessions
            .remove_if(&step_id, |_, s| s == session_id)
            .is_some()
    }
}

fn ensure_clarification_step(step: &WorkflowStep) -> AppResult<()> {
    if step.step_type != StepType::Clarification {
        return Err(AppError::invalid_transition(format!(
            "Step {} is a {} step, not clarification",
            step.step_number, step.step_type
        )));
    }
    Ok(())
}

/// A first run needs a pending step whose dependencies are met, or a
/// running step without generated questions.
fn ensure_initial_allowed(ctx: &StepContext) -> AppResult<()> {
    ctx.ensure_workflow_unpaused()?;
    let allowed = match ctx.step.status {
        StepStatus::Pending => {
            gate::dependencies_met(&ctx.step, ctx.predecessor(), ctx.other_running())
        }
        status if status.is_running_family() => ctx.step.output_structured.is_none(),
        _ => false,
    };
    if !allowed {
        return Err(AppError::invalid_transition(format!(
            "Cannot start clarification for step {} from {}",
            ctx.step.step_number, ctx.step.status
        )));
    }
    Ok(())
}

fn current_output(step: &WorkflowStep) -> ClarificationOutput {
    step.output_structured
        .as_ref()
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Questions of a stored step, for callers rendering the answer form.
pub fn questions_of(step: &WorkflowStep) -> Vec<ClarificationQuestion> {
    current_output(step).questions
}
