//! Property tests for the single-runner rule.
//!
//! Random sequences of step and workflow operations, valid or not, must never
//! leave more than one step of a workflow in the running family.

use std::sync::Arc;

use forgeflow_desktop::models::workflow::{NewWorkflow, PauseBehavior, WorkflowStep};
use forgeflow_desktop::services::pipeline::PipelineEngine;
use forgeflow_desktop::storage::Database;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Start(usize),
    Complete(usize),
    Fail(usize),
    Skip(usize),
    Edit(usize),
    PauseStep(usize),
    ResumeStep(usize),
    Retry(usize),
    Reopen(usize),
    Advance,
    PauseWorkflow,
    ResumeWorkflow,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let step = 0usize..4;
    prop_oneof![
        step.clone().prop_map(Op::Start),
        step.clone().prop_map(Op::Complete),
        step.clone().prop_map(Op::Fail),
        step.clone().prop_map(Op::Skip),
        step.clone().prop_map(Op::Edit),
        step.clone().prop_map(Op::PauseStep),
        step.clone().prop_map(Op::ResumeStep),
        step.clone().prop_map(Op::Retry),
        step.prop_map(Op::Reopen),
        Just(Op::Advance),
        Just(Op::PauseWorkflow),
        Just(Op::ResumeWorkflow),
    ]
}

fn behavior_strategy() -> impl Strategy<Value = PauseBehavior> {
    prop_oneof![
        Just(PauseBehavior::Continuous),
        Just(PauseBehavior::AutoPause),
        Just(PauseBehavior::GatesOnly),
    ]
}

fn running_count(steps: &[WorkflowStep]) -> usize {
    steps.iter().filter(|s| s.status.is_running_family()).count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn prop_at_most_one_running_step(
        behavior in behavior_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let engine = PipelineEngine::new(Arc::new(Database::new_in_memory().unwrap()));
        let (workflow, steps) = engine
            .create_workflow(NewWorkflow {
                project_id: 1,
                feature_request: "Property run".to_string(),
                pause_behavior: behavior,
                skip_clarification: false,
                clarification_agent_id: None,
            })
            .unwrap();
        let ids: Vec<i64> = steps.iter().map(|s| s.id).collect();

        for op in ops {
            // Rejected operations are expected; only the invariant matters.
            let _ = match op {
                Op::Start(i) => engine.start(ids[i]).map(|_| ()),
                Op::Complete(i) => engine.complete(ids[i], Some("out".to_string()), None).map(|_| ()),
                Op::Fail(i) => engine.fail(ids[i], "boom").map(|_| ()),
                Op::Skip(i) => engine.skip(ids[i]).map(|_| ()),
                Op::Edit(i) => engine.mark_edited(ids[i], "edited").map(|_| ()),
                Op::PauseStep(i) => engine.pause_step(ids[i]).map(|_| ()),
                Op::ResumeStep(i) => engine.resume_step(ids[i]).map(|_| ()),
                Op::Retry(i) => engine.retry(ids[i]).map(|_| ()),
                Op::Reopen(i) => engine.reopen(ids[i]).map(|_| ()),
                Op::Advance => engine.advance(workflow.id).map(|_| ()),
                Op::PauseWorkflow => engine.pause_workflow(workflow.id).map(|_| ()),
                Op::ResumeWorkflow => engine.resume_workflow(workflow.id).map(|_| ()),
            };

            let current = engine.steps(workflow.id).unwrap();
            prop_assert!(
                running_count(&current) <= 1,
                "more than one running step after {:?}: {:?}",
                op,
                current.iter().map(|s| s.status).collect::<Vec<_>>()
            );
        }
    }
}
