//! Workflow Models
//!
//! Workflows, their ordered steps, and the raw/visual status enums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::error::AppError;

/// Workflow-level policy controlling how steps advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseBehavior {
    /// Steps auto-advance; nothing is started manually
    Continuous,
    /// Every step requires a manual start
    AutoPause,
    /// Only quality gate steps require a manual start
    GatesOnly,
}

impl Default for PauseBehavior {
    fn default() -> Self {
        Self::AutoPause
    }
}

impl PauseBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::AutoPause => "auto_pause",
            Self::GatesOnly => "gates_only",
        }
    }

    pub fn all() -> [PauseBehavior; 3] {
        [Self::Continuous, Self::AutoPause, Self::GatesOnly]
    }
}

impl FromStr for PauseBehavior {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continuous" => Ok(Self::Continuous),
            "auto_pause" => Ok(Self::AutoPause),
            "gates_only" => Ok(Self::GatesOnly),
            other => Err(AppError::validation(format!("Unknown pause behavior: {}", other))),
        }
    }
}

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for WorkflowStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AppError::validation(format!("Unknown workflow status: {}", other))),
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a step performs. Drives the structured output shape and
/// metric projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Clarification,
    Discovery,
    Planning,
    Refinement,
    Implementation,
    QualityGate,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clarification => "clarification",
            Self::Discovery => "discovery",
            Self::Planning => "planning",
            Self::Refinement => "refinement",
            Self::Implementation => "implementation",
            Self::QualityGate => "quality_gate",
        }
    }

    /// Whether `gates_only` pipelines stop for a manual start at this step.
    pub fn is_gate(&self) -> bool {
        match self {
            Self::QualityGate => true,
            Self::Clarification
            | Self::Discovery
            | Self::Planning
            | Self::Refinement
            | Self::Implementation => false,
        }
    }

    /// Steps created for a new workflow, in order.
    pub fn default_pipeline() -> [StepType; 4] {
        [
            Self::Clarification,
            Self::Discovery,
            Self::Planning,
            Self::Implementation,
        ]
    }
}

impl FromStr for StepType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clarification" => Ok(Self::Clarification),
            "discovery" => Ok(Self::Discovery),
            "planning" => Ok(Self::Planning),
            "refinement" => Ok(Self::Refinement),
            "implementation" => Ok(Self::Implementation),
            "quality_gate" => Ok(Self::QualityGate),
            other => Err(AppError::validation(format!("Unknown step type: {}", other))),
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw, persisted step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Paused,
    Editing,
    Completed,
    Failed,
    Skipped,
}

/// Three-bucket status shown to the user. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualStatus {
    Pending,
    Running,
    Completed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Editing => "editing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Total mapping from raw to visual status.
    pub fn visual(&self) -> VisualStatus {
        match self {
            Self::Pending => VisualStatus::Pending,
            Self::Running | Self::Paused | Self::Editing => VisualStatus::Running,
            Self::Completed | Self::Failed | Self::Skipped => VisualStatus::Completed,
        }
    }

    pub fn is_running_family(&self) -> bool {
        self.visual() == VisualStatus::Running
    }

    pub fn all() -> [StepStatus; 7] {
        [
            Self::Pending,
            Self::Running,
            Self::Paused,
            Self::Editing,
            Self::Completed,
            Self::Failed,
            Self::Skipped,
        ]
    }
}

impl FromStr for StepStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "editing" => Ok(Self::Editing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(AppError::validation(format!("Unknown step status: {}", other))),
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: i64,
    pub project_id: i64,
    pub feature_request: String,
    pub pause_behavior: PauseBehavior,
    pub status: WorkflowStatus,
    pub clarification_agent_id: Option<String>,
    pub skip_clarification: bool,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

/// Input for creating a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWorkflow {
    pub project_id: i64,
    pub feature_request: String,
    pub pause_behavior: PauseBehavior,
    #[serde(default)]
    pub skip_clarification: bool,
    #[serde(default)]
    pub clarification_agent_id: Option<String>,
}

/// One step of a workflow's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: i64,
    pub workflow_id: i64,
    pub step_number: i64,
    pub step_type: StepType,
    pub status: StepStatus,
    pub output_text: Option<String>,
    pub output_structured: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub output_edited_at: Option<String>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl WorkflowStep {
    pub fn visual_status(&self) -> VisualStatus {
        self.status.visual()
    }

    /// The predecessor of this step within `steps` (same workflow).
    pub fn predecessor<'a>(&self, steps: &'a [WorkflowStep]) -> Option<&'a WorkflowStep> {
        steps
            .iter()
            .find(|s| s.workflow_id == self.workflow_id && s.step_number == self.step_number - 1)
    }

    /// The successor of this step within `steps` (same workflow).
    pub fn successor<'a>(&self, steps: &'a [WorkflowStep]) -> Option<&'a WorkflowStep> {
        steps
            .iter()
            .find(|s| s.workflow_id == self.workflow_id && s.step_number == self.step_number + 1)
    }
}

/// Field changes applied by a step transition in one write.
///
/// `None` leaves a column untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub status: Option<StepStatus>,
    pub output_text: Option<Option<String>>,
    pub output_structured: Option<Option<serde_json::Value>>,
    pub error_message: Option<Option<String>>,
    pub duration_ms: Option<Option<i64>>,
    pub started_at: Option<Option<String>>,
    pub completed_at: Option<Option<String>>,
    pub output_edited_at: Option<Option<String>>,
    /// Move the owning workflow to this status in the same write
    pub workflow_status: Option<WorkflowStatus>,
    /// Expected workflow version for `workflow_status`; a mismatch aborts the
    /// whole write
    pub workflow_version: Option<i64>,
}
