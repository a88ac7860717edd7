//! Pipeline Engine
//!
//! Step and workflow status transitions. Every operation loads the current
//! rows, validates the transition against them, then issues one
//! version-checked write. Nothing is written when validation fails.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::gate;
use super::metrics::{compute_step_metrics, StepMetric};
use crate::models::workflow::{
    NewWorkflow, StepStatus, StepType, StepUpdate, VisualStatus, Workflow, WorkflowStatus,
    WorkflowStep,
};
use crate::storage::database::now_timestamp;
use crate::storage::repository::{StepSeed, WorkflowRepository};
use crate::utils::error::{AppError, AppResult};

/// One row of the visible step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    pub step: WorkflowStep,
    pub visual_status: VisualStatus,
    pub can_start: bool,
    pub metrics: Vec<StepMetric>,
}

/// A step loaded together with its workflow and siblings.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow: Workflow,
    pub steps: Vec<WorkflowStep>,
    pub step: WorkflowStep,
}

impl StepContext {
    pub fn predecessor(&self) -> Option<&WorkflowStep> {
        self.step.predecessor(&self.steps)
    }

    pub fn successor(&self) -> Option<&WorkflowStep> {
        self.step.successor(&self.steps)
    }

    /// Whether a step other than this one is in the running family.
    pub fn other_running(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.id != self.step.id && s.status.is_running_family())
    }

    /// Reject any change once the workflow is terminal.
    pub fn ensure_workflow_active(&self) -> AppResult<()> {
        ensure_not_terminal(&self.workflow)
    }

    /// Reject anything that would put a step into `running` while the
    /// workflow is paused.
    pub fn ensure_workflow_unpaused(&self) -> AppResult<()> {
        ensure_not_paused(&self.workflow)
    }
}

/// Drives workflow and step state.
pub struct PipelineEngine {
    repo: Arc<dyn WorkflowRepository>,
    /// Last successful step list per workflow, served when a read fails
    step_lists: DashMap<i64, Vec<StepView>>,
}

impl PipelineEngine {
    pub fn new(repo: Arc<dyn WorkflowRepository>) -> Self {
        Self {
            repo,
            step_lists: DashMap::new(),
        }
    }

    // ========================================================================
    // Workflows
    // ========================================================================

    /// Create a workflow with the default step pipeline.
    pub fn create_workflow(&self, input: NewWorkflow) -> AppResult<(Workflow, Vec<WorkflowStep>)> {
        if input.feature_request.trim().is_empty() {
            return Err(AppError::validation("Feature request must not be empty"));
        }

        let seeds: Vec<StepSeed> = StepType::default_pipeline()
            .into_iter()
            .map(|step_type| {
                let status = if step_type == StepType::Clarification && input.skip_clarification {
                    StepStatus::Skipped
                } else {
                    StepStatus::Pending
                };
                StepSeed::new(step_type, status)
            })
            .collect();

        let (workflow, steps) = self.repo.create_workflow(&input, &seeds)?;
        info!(
            "[Pipeline] Created workflow {} ({} steps, {})",
            workflow.id,
            steps.len(),
            workflow.pause_behavior.as_str()
        );
        Ok((workflow, steps))
    }

    pub fn get_workflow(&self, id: i64) -> AppResult<Workflow> {
        self.repo
            .find_workflow(id)?
            .ok_or_else(|| AppError::not_found(format!("Workflow {}", id)))
    }

    pub fn list_workflows(&self, project_id: i64) -> AppResult<Vec<Workflow>> {
        self.repo.list_workflows(project_id)
    }

    pub fn get_step(&self, id: i64) -> AppResult<WorkflowStep> {
        self.repo
            .find_step(id)?
            .ok_or_else(|| AppError::not_found(format!("Step {}", id)))
    }

    pub fn steps(&self, workflow_id: i64) -> AppResult<Vec<WorkflowStep>> {
        self.repo.list_steps(workflow_id, None)
    }

    pub fn start_workflow(&self, id: i64) -> AppResult<Workflow> {
        self.set_workflow_status(id, WorkflowStatus::Running, |w| {
            w.status == WorkflowStatus::Created
        })
    }

    pub fn pause_workflow(&self, id: i64) -> AppResult<Workflow> {
        self.set_workflow_status(id, WorkflowStatus::Paused, |w| {
            w.status == WorkflowStatus::Running
        })
    }

    pub fn resume_workflow(&self, id: i64) -> AppResult<Workflow> {
        self.set_workflow_status(id, WorkflowStatus::Running, |w| {
            w.status == WorkflowStatus::Paused
        })
    }

    pub fn cancel_workflow(&self, id: i64) -> AppResult<Workflow> {
        self.set_workflow_status(id, WorkflowStatus::Cancelled, |_| true)
    }

    pub fn fail_workflow(&self, id: i64) -> AppResult<Workflow> {
        self.set_workflow_status(id, WorkflowStatus::Failed, |_| true)
    }

    /// Complete a workflow whose steps have all reached the completed bucket.
    pub fn complete_workflow(&self, id: i64) -> AppResult<Workflow> {
        let steps = self.repo.list_steps(id, None)?;
        if let Some(open) = steps
            .iter()
            .find(|s| s.status.visual() != VisualStatus::Completed)
        {
            return Err(AppError::invalid_transition(format!(
                "Step {} ({}) is still {}",
                open.step_number, open.step_type, open.status
            )));
        }
        self.set_workflow_status(id, WorkflowStatus::Completed, |_| true)
    }

    fn set_workflow_status(
        &self,
        id: i64,
        status: WorkflowStatus,
        allowed: impl FnOnce(&Workflow) -> bool,
    ) -> AppResult<Workflow> {
        let workflow = self.get_workflow(id)?;
        ensure_not_terminal(&workflow)?;
        if !allowed(&workflow) {
            return Err(AppError::invalid_transition(format!(
                "Workflow {} cannot move from {} to {}",
                id, workflow.status, status
            )));
        }

        let updated = self
            .repo
            .update_workflow_status(id, workflow.version, status)?;
        info!(
            "[Pipeline] Workflow {}: {} -> {}",
            id, workflow.status, updated.status
        );
        Ok(updated)
    }

    // ========================================================================
    // Steps
    // ========================================================================

    /// Start a pending step the gate allows.
    pub fn start(&self, step_id: i64) -> AppResult<WorkflowStep> {
        let ctx = self.load_step(step_id)?;
        ctx.ensure_workflow_active()?;
        ctx.ensure_workflow_unpaused()?;

        let any_running = gate::any_running(&ctx.steps);
        if !gate::can_start(
            &ctx.step,
            ctx.predecessor(),
            ctx.workflow.pause_behavior,
            any_running,
        ) {
            return Err(AppError::invalid_transition(format!(
                "Step {} ({}) cannot start: status {}, {} pause behavior{}",
                ctx.step.step_number,
                ctx.step.step_type,
                ctx.step.status,
                ctx.workflow.pause_behavior.as_str(),
                if any_running { ", another step is running" } else { "" }
            )));
        }

        self.begin_running(&ctx)
    }

    /// Move a step the caller has already validated into `running`.
    pub(crate) fn begin_running(&self, ctx: &StepContext) -> AppResult<WorkflowStep> {
        self.write_step(ctx, Self::running_update(ctx))
    }

    /// Update that enters `running`, bumping the workflow in the same write.
    pub(crate) fn running_update(ctx: &StepContext) -> StepUpdate {
        StepUpdate {
            status: Some(StepStatus::Running),
            started_at: Some(Some(now_timestamp())),
            workflow_status: Some(WorkflowStatus::Running),
            workflow_version: Some(ctx.workflow.version),
            ..Default::default()
        }
    }

    /// Complete a running step with its output and duration in one write.
    pub fn complete(
        &self,
        step_id: i64,
        output_text: Option<String>,
        duration_ms: Option<i64>,
    ) -> AppResult<WorkflowStep> {
        self.complete_with_output(step_id, output_text, None, duration_ms)
    }

    /// `complete` that also stores structured output.
    pub fn complete_with_output(
        &self,
        step_id: i64,
        output_text: Option<String>,
        output_structured: Option<serde_json::Value>,
        duration_ms: Option<i64>,
    ) -> AppResult<WorkflowStep> {
        let ctx = self.load_step(step_id)?;
        ctx.ensure_workflow_active()?;
        ensure_running_family(&ctx.step, "complete")?;

        let duration_ms = duration_ms.or_else(|| elapsed_ms(ctx.step.started_at.as_deref()));
        let mut update = StepUpdate {
            status: Some(StepStatus::Completed),
            output_text: Some(output_text),
            error_message: Some(None),
            duration_ms: Some(duration_ms),
            completed_at: Some(Some(now_timestamp())),
            ..Default::default()
        };
        if output_structured.is_some() {
            update.output_structured = Some(output_structured);
        }

        self.write_step(&ctx, update)
    }

    /// Mark a running step failed. The workflow keeps its status.
    pub fn fail(&self, step_id: i64, error_message: impl Into<String>) -> AppResult<WorkflowStep> {
        let ctx = self.load_step(step_id)?;
        ctx.ensure_workflow_active()?;
        ensure_running_family(&ctx.step, "fail")?;

        let duration_ms = elapsed_ms(ctx.step.started_at.as_deref());
        self.write_step(
            &ctx,
            StepUpdate {
                status: Some(StepStatus::Failed),
                error_message: Some(Some(error_message.into())),
                duration_ms: Some(duration_ms),
                completed_at: Some(Some(now_timestamp())),
                ..Default::default()
            },
        )
    }

    /// Skip a running or failed step.
    pub fn skip(&self, step_id: i64) -> AppResult<WorkflowStep> {
        let ctx = self.load_step(step_id)?;
        ctx.ensure_workflow_active()?;
        if !(ctx.step.status.is_running_family() || ctx.step.status == StepStatus::Failed) {
            return Err(AppError::invalid_transition(format!(
                "Cannot skip step {} from {}",
                ctx.step.step_number, ctx.step.status
            )));
        }

        self.write_step(
            &ctx,
            StepUpdate {
                status: Some(StepStatus::Skipped),
                completed_at: Some(Some(now_timestamp())),
                ..Default::default()
            },
        )
    }

    /// Replace a running step's output with a user edit.
    pub fn mark_edited(&self, step_id: i64, output_text: impl Into<String>) -> AppResult<WorkflowStep> {
        let ctx = self.load_step(step_id)?;
        ctx.ensure_workflow_active()?;
        ensure_running_family(&ctx.step, "edit")?;

        self.write_step(
            &ctx,
            StepUpdate {
                status: Some(StepStatus::Editing),
                output_text: Some(Some(output_text.into())),
                output_edited_at: Some(Some(now_timestamp())),
                ..Default::default()
            },
        )
    }

    pub fn pause_step(&self, step_id: i64) -> AppResult<WorkflowStep> {
        let ctx = self.load_step(step_id)?;
        ctx.ensure_workflow_active()?;
        if ctx.step.status != StepStatus::Running {
            return Err(AppError::invalid_transition(format!(
                "Cannot pause step {} from {}",
                ctx.step.step_number, ctx.step.status
            )));
        }
        self.write_step(
            &ctx,
            StepUpdate {
                status: Some(StepStatus::Paused),
                ..Default::default()
            },
        )
    }

    /// Return a paused or editing step to `running`.
    pub fn resume_step(&self, step_id: i64) -> AppResult<WorkflowStep> {
        let ctx = self.load_step(step_id)?;
        ctx.ensure_workflow_active()?;
        if !matches!(ctx.step.status, StepStatus::Paused | StepStatus::Editing) {
            return Err(AppError::invalid_transition(format!(
                "Cannot resume step {} from {}",
                ctx.step.step_number, ctx.step.status
            )));
        }
        self.write_step(
            &ctx,
            StepUpdate {
                status: Some(StepStatus::Running),
                ..Default::default()
            },
        )
    }

    /// Send a failed step back to `pending` so it can be started again.
    pub fn retry(&self, step_id: i64) -> AppResult<WorkflowStep> {
        let ctx = self.load_step(step_id)?;
        ctx.ensure_workflow_active()?;
        if ctx.step.status != StepStatus::Failed {
            return Err(AppError::invalid_transition(format!(
                "Only failed steps can be retried; step {} is {}",
                ctx.step.step_number, ctx.step.status
            )));
        }
        self.write_step(
            &ctx,
            StepUpdate {
                status: Some(StepStatus::Pending),
                error_message: Some(None),
                duration_ms: Some(None),
                started_at: Some(None),
                completed_at: Some(None),
                ..Default::default()
            },
        )
    }

    /// Return a finished step to `running` with its output cleared.
    pub fn reopen(&self, step_id: i64) -> AppResult<WorkflowStep> {
        let ctx = self.load_step(step_id)?;
        self.ensure_reopenable(&ctx)?;
        let update = Self::reopen_update(&ctx);
        self.write_step(&ctx, update)
    }

    pub(crate) fn ensure_reopenable(&self, ctx: &StepContext) -> AppResult<()> {
        ctx.ensure_workflow_active()?;
        ctx.ensure_workflow_unpaused()?;
        if ctx.step.status.visual() != VisualStatus::Completed {
            return Err(AppError::invalid_transition(format!(
                "Step {} is {}, not finished",
                ctx.step.step_number, ctx.step.status
            )));
        }
        if let Some(next) = ctx.successor() {
            if next.status != StepStatus::Pending {
                return Err(AppError::invalid_transition(format!(
                    "Step {} already moved on to step {} ({})",
                    ctx.step.step_number, next.step_number, next.status
                )));
            }
        }
        if ctx.other_running() {
            return Err(AppError::invalid_transition("Another step is running"));
        }
        Ok(())
    }

    pub(crate) fn reopen_update(ctx: &StepContext) -> StepUpdate {
        StepUpdate {
            output_text: Some(None),
            output_structured: Some(None),
            error_message: Some(None),
            duration_ms: Some(None),
            completed_at: Some(None),
            output_edited_at: Some(None),
            ..Self::running_update(ctx)
        }
    }

    /// Start the next step that advances without a manual start, if any.
    pub fn advance(&self, workflow_id: i64) -> AppResult<Option<WorkflowStep>> {
        let workflow = self.get_workflow(workflow_id)?;
        if workflow.status.is_terminal() || workflow.status == WorkflowStatus::Paused {
            debug!(
                "[Pipeline] Workflow {} is {}, not advancing",
                workflow_id, workflow.status
            );
            return Ok(None);
        }

        let steps = self.repo.list_steps(workflow_id, None)?;
        let any_running = gate::any_running(&steps);
        let next = steps.iter().find(|s| {
            gate::auto_startable(
                s,
                s.predecessor(&steps),
                workflow.pause_behavior,
                any_running,
            )
        });

        let Some(next) = next.cloned() else {
            return Ok(None);
        };

        let ctx = StepContext {
            workflow,
            steps,
            step: next,
        };
        info!(
            "[Pipeline] Auto-starting step {} ({}) of workflow {}",
            ctx.step.step_number, ctx.step.step_type, workflow_id
        );
        self.begin_running(&ctx).map(Some)
    }

    // ========================================================================
    // Projection
    // ========================================================================

    /// Visible step list. Falls back to the last good projection when the
    /// read fails with a recoverable error.
    pub fn step_list(&self, workflow_id: i64) -> AppResult<Vec<StepView>> {
        match self.build_step_list(workflow_id) {
            Ok(list) => {
                self.step_lists.insert(workflow_id, list.clone());
                Ok(list)
            }
            Err(e) if e.is_read_recoverable() => match self.step_lists.get(&workflow_id) {
                Some(cached) => {
                    warn!(
                        "[Pipeline] Serving cached step list for workflow {}: {}",
                        workflow_id, e
                    );
                    Ok(cached.clone())
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    fn build_step_list(&self, workflow_id: i64) -> AppResult<Vec<StepView>> {
        let workflow = self.get_workflow(workflow_id)?;
        let steps = self.repo.list_steps(workflow_id, None)?;
        let any_running = gate::any_running(&steps);
        let active = !workflow.status.is_terminal() && workflow.status != WorkflowStatus::Paused;

        Ok(steps
            .iter()
            .map(|step| StepView {
                step: step.clone(),
                visual_status: step.visual_status(),
                can_start: active
                    && gate::can_start(
                        step,
                        step.predecessor(&steps),
                        workflow.pause_behavior,
                        any_running,
                    ),
                metrics: compute_step_metrics(step),
            })
            .collect())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Load a step together with its workflow and siblings.
    pub(crate) fn load_step(&self, step_id: i64) -> AppResult<StepContext> {
        let step = self.get_step(step_id)?;
        let workflow = self.get_workflow(step.workflow_id)?;
        let steps = self.repo.list_steps(step.workflow_id, None)?;
        Ok(StepContext {
            workflow,
            steps,
            step,
        })
    }

    /// Apply a validated update against the loaded version.
    pub(crate) fn write_step(&self, ctx: &StepContext, update: StepUpdate) -> AppResult<WorkflowStep> {
        let updated = self
            .repo
            .update_step(ctx.step.id, ctx.step.version, &update)?;
        info!(
            "[Pipeline] Step {} ({}) of workflow {}: {} -> {}",
            updated.step_number,
            updated.step_type,
            updated.workflow_id,
            ctx.step.status,
            updated.status
        );
        Ok(updated)
    }
}

fn ensure_not_terminal(workflow: &Workflow) -> AppResult<()> {
    if workflow.status.is_terminal() {
        return Err(AppError::invalid_transition(format!(
            "Workflow {} is {}",
            workflow.id, workflow.status
        )));
    }
    Ok(())
}

fn ensure_not_paused(workflow: &Workflow) -> AppResult<()> {
    if workflow.status == WorkflowStatus::Paused {
        return Err(AppError::invalid_transition(format!(
            "Workflow {} is paused",
            workflow.id
        )));
    }
    Ok(())
}

fn ensure_running_family(step: &WorkflowStep, action: &str) -> AppResult<()> {
    if !step.status.is_running_family() {
        return Err(AppError::invalid_transition(format!(
            "Cannot {} step {} from {}",
            action, step.step_number, step.status
        )));
    }
    Ok(())
}

/// Milliseconds since an RFC 3339 start time.
pub(crate) fn elapsed_ms(started_at: Option<&str>) -> Option<i64> {
    let started = DateTime::parse_from_rfc3339(started_at?).ok()?;
    let elapsed = Utc::now().signed_duration_since(started.with_timezone(&Utc));
    Some(elapsed.num_milliseconds().max(0))
}
