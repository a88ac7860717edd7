//! Clarification Phases
//!
//! Phase machine and the per-run snapshot observed by the UI.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::outcome::ClarificationOutcome;
use crate::models::clarification::ClarificationOutput;
use crate::models::workflow::{StepStatus, WorkflowStep};
use crate::utils::error::AppError;

/// Where a clarification run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationPhase {
    Idle,
    Exploring,
    GeneratingQuestions,
    Streaming,
    AwaitingAnswers,
    Skipped,
    Error,
    Complete,
}

impl ClarificationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Exploring => "exploring",
            Self::GeneratingQuestions => "generating_questions",
            Self::Streaming => "streaming",
            Self::AwaitingAnswers => "awaiting_answers",
            Self::Skipped => "skipped",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }

    /// Position along the run; phase changes may only move forward.
    fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Exploring => 1,
            Self::GeneratingQuestions => 2,
            Self::Streaming => 3,
            Self::AwaitingAnswers | Self::Skipped | Self::Error => 4,
            Self::Complete => 5,
        }
    }

    /// Phases an agent may announce while a run is in flight.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Exploring | Self::GeneratingQuestions | Self::Streaming
        )
    }

    /// Whether `next` would move the machine backwards.
    pub fn is_regression(&self, next: ClarificationPhase) -> bool {
        next.rank() < self.rank()
    }

    /// Phase implied by a persisted step when no run is tracked.
    pub fn from_step(step: &WorkflowStep) -> Self {
        let output = step
            .output_structured
            .as_ref()
            .and_then(|v| serde_json::from_value::<ClarificationOutput>(v.clone()).ok());

        match (step.status, output) {
            (StepStatus::Skipped, _) => Self::Skipped,
            (StepStatus::Completed, Some(o)) if o.skipped => Self::Skipped,
            (StepStatus::Completed, _) => Self::Complete,
            (status, Some(o)) if status.is_running_family() && o.has_questions() => {
                Self::AwaitingAnswers
            }
            _ => Self::Idle,
        }
    }
}

impl FromStr for ClarificationPhase {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "exploring" => Ok(Self::Exploring),
            "generating_questions" => Ok(Self::GeneratingQuestions),
            "streaming" => Ok(Self::Streaming),
            "awaiting_answers" => Ok(Self::AwaitingAnswers),
            "skipped" => Ok(Self::Skipped),
            "error" => Ok(Self::Error),
            "complete" => Ok(Self::Complete),
            other => Err(AppError::validation(format!(
                "Unknown clarification phase: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ClarificationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run was started; decides how its outcome is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// First run on a fresh step
    Initial,
    /// Replace prior questions and answers
    Rerun,
    /// Append questions, keeping existing answers
    GenerateMore,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Rerun => "rerun",
            Self::GenerateMore => "generate_more",
        }
    }

    pub fn entry_phase(&self) -> ClarificationPhase {
        match self {
            Self::Initial | Self::Rerun => ClarificationPhase::Exploring,
            Self::GenerateMore => ClarificationPhase::GeneratingQuestions,
        }
    }
}

/// A tool call seen on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolActivity {
    pub tool_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output: Option<String>,
    pub is_error: bool,
}

/// UI-observable state of one clarification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationSnapshot {
    pub workflow_id: i64,
    pub step_id: i64,
    pub mode: RunMode,
    pub phase: ClarificationPhase,
    pub session_id: Option<String>,
    pub text: String,
    pub thinking: String,
    pub active_tools: Vec<ToolActivity>,
    pub tool_history: Vec<ToolActivity>,
    pub outcome: Option<ClarificationOutcome>,
    pub error: Option<String>,
}

impl ClarificationSnapshot {
    pub fn new(workflow_id: i64, step_id: i64, mode: RunMode, session_id: String) -> Self {
        Self {
            workflow_id,
            step_id,
            mode,
            phase: mode.entry_phase(),
            session_id: Some(session_id),
            text: String::new(),
            thinking: String::new(),
            active_tools: Vec::new(),
            tool_history: Vec::new(),
            outcome: None,
            error: None,
        }
    }

    /// Snapshot for a step with no tracked run.
    pub fn at_rest(step: &WorkflowStep) -> Self {
        Self {
            workflow_id: step.workflow_id,
            step_id: step.id,
            mode: RunMode::Initial,
            phase: ClarificationPhase::from_step(step),
            session_id: None,
            text: String::new(),
            thinking: String::new(),
            active_tools: Vec::new(),
            tool_history: Vec::new(),
            outcome: None,
            error: None,
        }
    }

    pub(crate) fn tool_started(&mut self, tool_id: String, tool_name: String, input: serde_json::Value) {
        self.active_tools.push(ToolActivity {
            tool_id,
            tool_name,
            input,
            output: None,
            is_error: false,
        });
    }

    pub(crate) fn tool_finished(&mut self, tool_id: &str, output: Option<String>, is_error: bool) {
        let mut activity = match self.active_tools.iter().position(|t| t.tool_id == tool_id) {
            Some(index) => self.active_tools.remove(index),
            None => ToolActivity {
                tool_id: tool_id.to_string(),
                tool_name: String::new(),
                input: serde_json::Value::Null,
                output: None,
                is_error: false,
            },
        };
        activity.output = output;
        activity.is_error = is_error;
        self.tool_history.push(activity);
    }
}
