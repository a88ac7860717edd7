//! Step Output Models
//!
//! Typed views over a step's `outputStructured` JSON. The persisted column is
//! plain JSON; `StepOutput::parse` picks the shape from the step type.

use serde::{Deserialize, Serialize};

use crate::models::clarification::ClarificationOutput;
use crate::models::workflow::StepType;
use crate::utils::error::AppResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredFile {
    pub path: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default = "default_true")]
    pub included: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryOutput {
    #[serde(default)]
    pub files: Vec<DiscoveredFile>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningOutput {
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefinementOutput {
    #[serde(default)]
    pub refined_request: Option<String>,
    #[serde(default)]
    pub changes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementationOutput {
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub tests_passed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGateOutput {
    #[serde(default)]
    pub checks: Vec<GateCheck>,
}

/// Structured output, one variant per step type.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Clarification(ClarificationOutput),
    Discovery(DiscoveryOutput),
    Planning(PlanningOutput),
    Refinement(RefinementOutput),
    Implementation(ImplementationOutput),
    QualityGate(QualityGateOutput),
}

impl StepOutput {
    /// Interpret raw JSON according to the step type.
    pub fn parse(step_type: StepType, value: &serde_json::Value) -> AppResult<Self> {
        let value = value.clone();
        Ok(match step_type {
            StepType::Clarification => Self::Clarification(serde_json::from_value(value)?),
            StepType::Discovery => Self::Discovery(serde_json::from_value(value)?),
            StepType::Planning => Self::Planning(serde_json::from_value(value)?),
            StepType::Refinement => Self::Refinement(serde_json::from_value(value)?),
            StepType::Implementation => Self::Implementation(serde_json::from_value(value)?),
            StepType::QualityGate => Self::QualityGate(serde_json::from_value(value)?),
        })
    }

    pub fn step_type(&self) -> StepType {
        match self {
            Self::Clarification(_) => StepType::Clarification,
            Self::Discovery(_) => StepType::Discovery,
            Self::Planning(_) => StepType::Planning,
            Self::Refinement(_) => StepType::Refinement,
            Self::Implementation(_) => StepType::Implementation,
            Self::QualityGate(_) => StepType::QualityGate,
        }
    }

    pub fn to_value(&self) -> AppResult<serde_json::Value> {
        Ok(match self {
            Self::Clarification(o) => serde_json::to_value(o)?,
            Self::Discovery(o) => serde_json::to_value(o)?,
            Self::Planning(o) => serde_json::to_value(o)?,
            Self::Refinement(o) => serde_json::to_value(o)?,
            Self::Implementation(o) => serde_json::to_value(o)?,
            Self::QualityGate(o) => serde_json::to_value(o)?,
        })
    }
}
