//! Clarification Integration Tests
//!
//! Full clarification runs over a scripted agent stream: skip outcomes,
//! answer merging across "generate more", and live event folding.

use std::collections::BTreeMap;
use std::sync::Arc;

use forgeflow_core::{ScriptedAgentStream, ScriptedRun};
use forgeflow_desktop::models::clarification::{ClarificationOutput, ClarificationQuestion};
use forgeflow_desktop::models::workflow::{
    NewWorkflow, PauseBehavior, StepStatus, WorkflowStatus, WorkflowStep,
};
use forgeflow_desktop::services::clarification::{ClarificationEngine, ClarificationPhase};
use forgeflow_desktop::services::pipeline::PipelineEngine;
use forgeflow_desktop::storage::Database;
use forgeflow_desktop::{AgentStreamEvent, AppError, SessionStore};
use serde_json::json;

struct Fixture {
    pipeline: Arc<PipelineEngine>,
    agent: Arc<ScriptedAgentStream>,
    engine: ClarificationEngine,
    workflow_id: i64,
    clarify: i64,
    next: i64,
}

fn fixture(runs: Vec<ScriptedRun>) -> Fixture {
    let pipeline = Arc::new(PipelineEngine::new(Arc::new(
        Database::new_in_memory().unwrap(),
    )));
    let agent = Arc::new(ScriptedAgentStream::with_runs(runs));
    let engine = ClarificationEngine::new(
        pipeline.clone(),
        agent.clone(),
        Arc::new(SessionStore::new()),
        6,
    );
    let (workflow, steps) = pipeline
        .create_workflow(NewWorkflow {
            project_id: 1,
            feature_request: "Let admins export audit logs".to_string(),
            pause_behavior: PauseBehavior::AutoPause,
            skip_clarification: false,
            clarification_agent_id: None,
        })
        .unwrap();
    Fixture {
        pipeline,
        agent,
        engine,
        workflow_id: workflow.id,
        clarify: steps[0].id,
        next: steps[1].id,
    }
}

fn questions(texts: &[&str]) -> ScriptedRun {
    ScriptedRun::outcome(json!({
        "type": "questions",
        "questions": texts.iter().map(|q| json!({"question": q})).collect::<Vec<_>>(),
    }))
}

fn output_of(step: &WorkflowStep) -> ClarificationOutput {
    serde_json::from_value(step.output_structured.clone().unwrap()).unwrap()
}

#[tokio::test]
async fn test_skip_outcome_completes_without_answers() {
    let f = fixture(vec![ScriptedRun::outcome(json!({
        "type": "skip",
        "reason": "request is fully specified",
    }))]);

    let session = f.engine.start(f.workflow_id, f.clarify).await.unwrap();
    let snapshot = f.engine.drive(session).await.unwrap();
    assert_eq!(snapshot.phase, ClarificationPhase::Skipped);

    let step = f.pipeline.get_step(f.clarify).unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert!(step.completed_at.is_some());
    let structured = step.output_structured.unwrap();
    assert_eq!(structured["skipped"], true);
    assert_eq!(structured["skipReason"], "request is fully specified");

    assert_eq!(
        f.pipeline.get_workflow(f.workflow_id).unwrap().status,
        WorkflowStatus::Running
    );
    f.pipeline.start(f.next).unwrap();
}

#[tokio::test]
async fn test_generate_more_keeps_earlier_answers() {
    let f = fixture(vec![
        questions(&["Which formats?", "Retention period?"]),
        questions(&["Who may export?"]),
    ]);

    let session = f.engine.start(f.workflow_id, f.clarify).await.unwrap();
    f.engine.drive(session).await.unwrap();
    let step = f.pipeline.get_step(f.clarify).unwrap();
    f.engine
        .submit_answers(
            f.clarify,
            output_of(&step),
            BTreeMap::from([
                (0, "CSV and JSON".to_string()),
                (1, "90 days".to_string()),
            ]),
        )
        .await
        .unwrap();

    let session = f.engine.generate_more(f.clarify).await.unwrap();
    let snapshot = f.engine.drive(session).await.unwrap();
    assert_eq!(snapshot.phase, ClarificationPhase::AwaitingAnswers);

    let step = f.pipeline.get_step(f.clarify).unwrap();
    assert_eq!(step.status, StepStatus::Running);
    assert!(step.completed_at.is_none());
    let current = output_of(&step);
    assert_eq!(current.questions.len(), 3);
    assert_eq!(current.answers.len(), 2);

    let done = f
        .engine
        .submit_answers(
            f.clarify,
            current,
            BTreeMap::from([
                (1, "1 year".to_string()),
                (2, "Admins only".to_string()),
            ]),
        )
        .await
        .unwrap();
    let merged = output_of(&done);
    assert_eq!(merged.answers[&0], "CSV and JSON");
    assert_eq!(merged.answers[&1], "1 year");
    assert_eq!(merged.answers[&2], "Admins only");
    assert_eq!(done.status, StepStatus::Completed);
}

#[tokio::test]
async fn test_rerun_cancelled_leaves_step_untouched() {
    let f = fixture(vec![questions(&["Which formats?"]), ScriptedRun::Open(vec![])]);

    let session = f.engine.start(f.workflow_id, f.clarify).await.unwrap();
    f.engine.drive(session).await.unwrap();
    let step = f.pipeline.get_step(f.clarify).unwrap();
    let done = f
        .engine
        .submit_answers(f.clarify, output_of(&step), BTreeMap::from([(0, "CSV".to_string())]))
        .await
        .unwrap();

    f.engine.rerun(f.clarify).await.unwrap();
    assert!(f.engine.is_active(f.clarify));
    f.engine.cancel(f.clarify).await.unwrap();

    let after = f.pipeline.get_step(f.clarify).unwrap();
    assert_eq!(after, done);
    assert_eq!(
        f.engine.snapshot(f.clarify).await.unwrap().phase,
        ClarificationPhase::Complete
    );
}

#[tokio::test]
async fn test_live_events_fold_into_snapshot() {
    let f = fixture(vec![ScriptedRun::Open(vec![AgentStreamEvent::PhaseChange {
        phase: "generating_questions".to_string(),
    }])]);

    let session = f.engine.start(f.workflow_id, f.clarify).await.unwrap();
    let session_id = session.session_id.clone();

    let agent = f.agent.clone();
    let pusher = tokio::spawn(async move {
        let events = vec![
            AgentStreamEvent::Thinking {
                content: "Looking at the audit module".to_string(),
            },
            AgentStreamEvent::ToolUse {
                tool_id: "t1".to_string(),
                tool_name: "read_file".to_string(),
                input: json!({"path": "src/audit.rs"}),
            },
            AgentStreamEvent::ToolResult {
                tool_id: "t1".to_string(),
                output: Some("120 lines".to_string()),
                is_error: false,
            },
            AgentStreamEvent::PhaseChange {
                phase: "streaming".to_string(),
            },
            AgentStreamEvent::Text {
                content: "Two questions".to_string(),
            },
            AgentStreamEvent::Complete {
                outcome: json!({"type": "questions", "questions": [{"question": "CSV?"}, {"question": "PDF?"}]}),
            },
        ];
        for event in events {
            assert!(agent.push(&session_id, event).await);
        }
        agent.close(&session_id);
    });

    let snapshot = f.engine.drive(session).await.unwrap();
    pusher.await.unwrap();

    assert_eq!(snapshot.phase, ClarificationPhase::AwaitingAnswers);
    assert_eq!(snapshot.thinking, "Looking at the audit module");
    assert_eq!(snapshot.text, "Two questions");
    assert!(snapshot.active_tools.is_empty());
    assert_eq!(snapshot.tool_history.len(), 1);
    assert_eq!(snapshot.tool_history[0].tool_name, "read_file");

    let step = f.pipeline.get_step(f.clarify).unwrap();
    assert_eq!(output_of(&step).questions.len(), 2);
}

#[tokio::test]
async fn test_submit_rejected_while_run_active() {
    let f = fixture(vec![ScriptedRun::Open(vec![])]);
    f.engine.start(f.workflow_id, f.clarify).await.unwrap();

    let err = f
        .engine
        .submit_answers(f.clarify, ClarificationOutput::default(), BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
}

#[tokio::test]
async fn test_submit_rejected_before_questions_exist() {
    let f = fixture(vec![]);
    f.pipeline.start(f.clarify).unwrap();

    let invented = ClarificationOutput::with_questions(vec![ClarificationQuestion::new("Invented?")]);
    let err = f
        .engine
        .submit_answers(f.clarify, invented, BTreeMap::from([(0, "yes".to_string())]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
    assert_eq!(
        f.pipeline.get_step(f.clarify).unwrap().status,
        StepStatus::Running
    );
}

#[tokio::test]
async fn test_paused_workflow_blocks_clarification_runs() {
    let f = fixture(vec![questions(&["Which formats?"])]);
    f.pipeline.start_workflow(f.workflow_id).unwrap();
    f.pipeline.pause_workflow(f.workflow_id).unwrap();

    let err = f.engine.start(f.workflow_id, f.clarify).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
    assert_eq!(
        f.pipeline.get_workflow(f.workflow_id).unwrap().status,
        WorkflowStatus::Paused
    );

    f.pipeline.resume_workflow(f.workflow_id).unwrap();
    let session = f.engine.start(f.workflow_id, f.clarify).await.unwrap();
    f.engine.drive(session).await.unwrap();
    let step = f.pipeline.get_step(f.clarify).unwrap();
    f.engine
        .submit_answers(f.clarify, output_of(&step), BTreeMap::from([(0, "CSV".to_string())]))
        .await
        .unwrap();

    f.pipeline.pause_workflow(f.workflow_id).unwrap();
    for err in [
        f.engine.rerun(f.clarify).await.unwrap_err(),
        f.engine.generate_more(f.clarify).await.unwrap_err(),
    ] {
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }
    assert!(matches!(
        f.pipeline.reopen(f.clarify).unwrap_err(),
        AppError::InvalidTransition(_)
    ));
    assert_eq!(f.agent.requests().len(), 1);
    assert_eq!(
        f.pipeline.get_workflow(f.workflow_id).unwrap().status,
        WorkflowStatus::Paused
    );
    assert_eq!(
        f.pipeline.get_step(f.clarify).unwrap().status,
        StepStatus::Completed
    );
}

#[tokio::test]
async fn test_skip_cancels_active_run() {
    let f = fixture(vec![ScriptedRun::Open(vec![])]);
    let session = f.engine.start(f.workflow_id, f.clarify).await.unwrap();

    let step = f
        .engine
        .skip(f.clarify, Some("user knows what they want".to_string()))
        .await
        .unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert!(output_of(&step).skipped);
    assert_eq!(f.agent.cancelled(), vec![session.session_id]);
    assert!(!f.engine.is_active(f.clarify));
}
