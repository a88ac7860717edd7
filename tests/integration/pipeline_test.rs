//! Pipeline Integration Tests
//!
//! Step transitions, the start gate and the cached step list, driven through
//! the public engine API against an in-memory database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use forgeflow_desktop::models::workflow::{
    NewWorkflow, PauseBehavior, StepStatus, StepType, StepUpdate, VisualStatus, Workflow,
    WorkflowStatus, WorkflowStep,
};
use forgeflow_desktop::services::pipeline::gate::can_start;
use forgeflow_desktop::services::pipeline::PipelineEngine;
use forgeflow_desktop::storage::{Database, StepSeed, WorkflowRepository};
use forgeflow_desktop::{AppError, AppResult};

fn new_workflow(pause_behavior: PauseBehavior) -> NewWorkflow {
    NewWorkflow {
        project_id: 1,
        feature_request: "Add CSV export to the reports page".to_string(),
        pause_behavior,
        skip_clarification: false,
        clarification_agent_id: None,
    }
}

fn engine() -> PipelineEngine {
    PipelineEngine::new(Arc::new(Database::new_in_memory().unwrap()))
}

fn step(number: i64, step_type: StepType, status: StepStatus) -> WorkflowStep {
    WorkflowStep {
        id: number,
        workflow_id: 1,
        step_number: number,
        step_type,
        status,
        output_text: None,
        output_structured: None,
        error_message: None,
        duration_ms: None,
        started_at: None,
        completed_at: None,
        output_edited_at: None,
        version: 1,
        created_at: String::new(),
        updated_at: String::new(),
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_auto_pause_rejects_out_of_order_start() {
    let engine = engine();
    let (workflow, steps) = engine
        .create_workflow(new_workflow(PauseBehavior::AutoPause))
        .unwrap();

    engine.start(steps[0].id).unwrap();
    engine
        .complete(steps[0].id, Some("clarified".to_string()), Some(1200))
        .unwrap();

    let err = engine.start(steps[2].id).unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let step3 = engine.get_step(steps[2].id).unwrap();
    assert_eq!(step3.status, StepStatus::Pending);
    assert_eq!(step3.version, steps[2].version);

    let list = engine.step_list(workflow.id).unwrap();
    assert!(list[1].can_start);
    assert!(!list[2].can_start);
    assert_eq!(list[0].visual_status, VisualStatus::Completed);
}

#[test]
fn test_complete_stores_output_and_duration_together() {
    let engine = engine();
    let (workflow, steps) = engine
        .create_workflow(new_workflow(PauseBehavior::AutoPause))
        .unwrap();

    engine.start(steps[0].id).unwrap();
    assert_eq!(
        engine.get_workflow(workflow.id).unwrap().status,
        WorkflowStatus::Running
    );

    let done = engine
        .complete(steps[0].id, Some("done".to_string()), Some(4500))
        .unwrap();
    assert_eq!(done.status, StepStatus::Completed);
    assert_eq!(done.output_text.as_deref(), Some("done"));
    assert_eq!(done.duration_ms, Some(4500));
    assert!(done.completed_at.is_some());
}

#[test]
fn test_fail_keeps_workflow_running_and_retry_recovers() {
    let engine = engine();
    let (workflow, steps) = engine
        .create_workflow(new_workflow(PauseBehavior::AutoPause))
        .unwrap();

    engine.start(steps[0].id).unwrap();
    let failed = engine.fail(steps[0].id, "agent crashed").unwrap();
    assert_eq!(failed.status, StepStatus::Failed);
    assert_eq!(failed.visual_status(), VisualStatus::Completed);
    assert_eq!(
        engine.get_workflow(workflow.id).unwrap().status,
        WorkflowStatus::Running
    );

    let retried = engine.retry(steps[0].id).unwrap();
    assert_eq!(retried.status, StepStatus::Pending);
    assert!(retried.error_message.is_none());
    engine.start(steps[0].id).unwrap();
}

#[test]
fn test_continuous_workflow_advances_on_its_own() {
    let engine = engine();
    let (workflow, steps) = engine
        .create_workflow(new_workflow(PauseBehavior::Continuous))
        .unwrap();

    assert!(matches!(
        engine.start(steps[0].id).unwrap_err(),
        AppError::InvalidTransition(_)
    ));

    let first = engine.advance(workflow.id).unwrap().unwrap();
    assert_eq!(first.id, steps[0].id);
    assert!(engine.advance(workflow.id).unwrap().is_none());

    engine.complete(first.id, None, None).unwrap();
    let second = engine.advance(workflow.id).unwrap().unwrap();
    assert_eq!(second.step_type, StepType::Discovery);
}

#[test]
fn test_paused_workflow_blocks_starts() {
    let engine = engine();
    let (workflow, steps) = engine
        .create_workflow(new_workflow(PauseBehavior::AutoPause))
        .unwrap();
    engine.start(steps[0].id).unwrap();
    engine.complete(steps[0].id, None, None).unwrap();
    engine.pause_workflow(workflow.id).unwrap();

    assert!(engine.start(steps[1].id).is_err());
    assert!(engine.step_list(workflow.id).unwrap().iter().all(|v| !v.can_start));

    engine.resume_workflow(workflow.id).unwrap();
    engine.start(steps[1].id).unwrap();
}

#[test]
fn test_terminal_workflow_rejects_step_transitions() {
    let engine = engine();
    let (workflow, steps) = engine
        .create_workflow(new_workflow(PauseBehavior::AutoPause))
        .unwrap();
    engine.start(steps[0].id).unwrap();
    engine.cancel_workflow(workflow.id).unwrap();

    for result in [
        engine.complete(steps[0].id, None, None),
        engine.fail(steps[0].id, "late"),
        engine.mark_edited(steps[0].id, "edit"),
    ] {
        assert!(matches!(result.unwrap_err(), AppError::InvalidTransition(_)));
    }
    assert!(engine.resume_workflow(workflow.id).is_err());
}

#[test]
fn test_reopen_only_while_successor_pending() {
    let engine = engine();
    let (_, steps) = engine
        .create_workflow(new_workflow(PauseBehavior::AutoPause))
        .unwrap();
    engine.start(steps[0].id).unwrap();
    engine
        .complete(steps[0].id, Some("first pass".to_string()), None)
        .unwrap();

    let reopened = engine.reopen(steps[0].id).unwrap();
    assert_eq!(reopened.status, StepStatus::Running);
    assert!(reopened.output_text.is_none());

    engine.complete(steps[0].id, None, None).unwrap();
    engine.start(steps[1].id).unwrap();
    assert!(matches!(
        engine.reopen(steps[0].id).unwrap_err(),
        AppError::InvalidTransition(_)
    ));
}

// ============================================================================
// Gate
// ============================================================================

#[test]
fn test_gate_never_passes_an_unfinished_predecessor() {
    let unfinished = [
        StepStatus::Pending,
        StepStatus::Running,
        StepStatus::Paused,
        StepStatus::Editing,
    ];
    let step_types = [
        StepType::Discovery,
        StepType::Planning,
        StepType::Implementation,
        StepType::QualityGate,
    ];

    for behavior in PauseBehavior::all() {
        for predecessor_status in unfinished {
            for step_type in step_types {
                for any_running in [false, true] {
                    let predecessor = step(1, StepType::Clarification, predecessor_status);
                    let candidate = step(2, step_type, StepStatus::Pending);
                    assert!(
                        !can_start(&candidate, Some(&predecessor), behavior, any_running),
                        "{:?} / {:?} / {:?}",
                        behavior,
                        predecessor_status,
                        step_type
                    );
                }
            }
        }
    }
}

#[test]
fn test_gate_first_step_and_finished_predecessor() {
    let first = step(1, StepType::Clarification, StepStatus::Pending);
    assert!(can_start(&first, None, PauseBehavior::AutoPause, false));
    assert!(!can_start(&first, None, PauseBehavior::Continuous, false));
    assert!(!can_start(&first, None, PauseBehavior::GatesOnly, false));

    for finished in [StepStatus::Completed, StepStatus::Failed, StepStatus::Skipped] {
        let predecessor = step(1, StepType::Clarification, finished);
        let gate = step(2, StepType::QualityGate, StepStatus::Pending);
        assert!(can_start(&gate, Some(&predecessor), PauseBehavior::GatesOnly, false));
        assert!(can_start(&gate, Some(&predecessor), PauseBehavior::AutoPause, false));
        assert!(!can_start(&gate, Some(&predecessor), PauseBehavior::AutoPause, true));
    }
}

// ============================================================================
// Cached step list
// ============================================================================

/// Delegates to SQLite; step reads fail while `unavailable` is set.
struct FlakyRepository {
    inner: Database,
    unavailable: AtomicBool,
}

impl FlakyRepository {
    fn check(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::unavailable("database file is locked"));
        }
        Ok(())
    }
}

impl WorkflowRepository for FlakyRepository {
    fn create_workflow(
        &self,
        input: &NewWorkflow,
        steps: &[StepSeed],
    ) -> AppResult<(Workflow, Vec<WorkflowStep>)> {
        self.inner.create_workflow(input, steps)
    }

    fn find_workflow(&self, id: i64) -> AppResult<Option<Workflow>> {
        self.inner.find_workflow(id)
    }

    fn list_workflows(&self, project_id: i64) -> AppResult<Vec<Workflow>> {
        self.inner.list_workflows(project_id)
    }

    fn update_workflow_status(
        &self,
        id: i64,
        expected_version: i64,
        status: WorkflowStatus,
    ) -> AppResult<Workflow> {
        self.inner.update_workflow_status(id, expected_version, status)
    }

    fn delete_workflow(&self, id: i64) -> AppResult<bool> {
        self.inner.delete_workflow(id)
    }

    fn find_step(&self, id: i64) -> AppResult<Option<WorkflowStep>> {
        self.inner.find_step(id)
    }

    fn list_steps(
        &self,
        workflow_id: i64,
        status: Option<StepStatus>,
    ) -> AppResult<Vec<WorkflowStep>> {
        self.check()?;
        self.inner.list_steps(workflow_id, status)
    }

    fn update_step(
        &self,
        id: i64,
        expected_version: i64,
        update: &StepUpdate,
    ) -> AppResult<WorkflowStep> {
        self.inner.update_step(id, expected_version, update)
    }
}

#[test]
fn test_step_list_serves_cache_when_storage_unavailable() {
    let repo = Arc::new(FlakyRepository {
        inner: Database::new_in_memory().unwrap(),
        unavailable: AtomicBool::new(false),
    });
    let engine = PipelineEngine::new(repo.clone());
    let (cached, _) = engine
        .create_workflow(new_workflow(PauseBehavior::AutoPause))
        .unwrap();
    let (uncached, _) = engine
        .create_workflow(new_workflow(PauseBehavior::AutoPause))
        .unwrap();

    let fresh = engine.step_list(cached.id).unwrap();
    repo.unavailable.store(true, Ordering::SeqCst);

    assert_eq!(engine.step_list(cached.id).unwrap(), fresh);
    assert!(matches!(
        engine.step_list(uncached.id).unwrap_err(),
        AppError::CollaboratorUnavailable(_)
    ));

    let first = fresh[0].step.id;
    assert!(matches!(
        engine.start(first).unwrap_err(),
        AppError::CollaboratorUnavailable(_)
    ));
}
