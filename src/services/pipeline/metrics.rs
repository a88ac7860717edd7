//! Step Metrics
//!
//! Display-only figures derived from a step's structured output.

use serde::{Deserialize, Serialize};

use crate::models::step_output::StepOutput;
use crate::models::workflow::WorkflowStep;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetric {
    pub label: String,
    pub value: String,
}

impl StepMetric {
    fn new(label: &str, value: impl ToString) -> Self {
        Self {
            label: label.to_string(),
            value: value.to_string(),
        }
    }
}

/// Project the step's structured output into labelled figures.
///
/// Steps without structured output, or whose output does not match the
/// shape for their type, only report duration.
pub fn compute_step_metrics(step: &WorkflowStep) -> Vec<StepMetric> {
    let mut metrics = Vec::new();

    if let Some(value) = &step.output_structured {
        match StepOutput::parse(step.step_type, value) {
            Ok(output) => metrics.extend(output_metrics(&output)),
            Err(e) => {
                tracing::debug!(
                    "[Pipeline] Step {} output does not match {}: {}",
                    step.id,
                    step.step_type,
                    e
                );
            }
        }
    }

    if let Some(duration) = step.duration_ms {
        metrics.push(StepMetric::new("duration", format_duration(duration)));
    }

    metrics
}

fn output_metrics(output: &StepOutput) -> Vec<StepMetric> {
    match output {
        StepOutput::Clarification(c) if c.skipped => vec![StepMetric::new("skipped", "yes")],
        StepOutput::Clarification(c) => vec![
            StepMetric::new("questions", c.questions.len()),
            StepMetric::new("answered", c.answered_count()),
        ],
        StepOutput::Discovery(d) => vec![StepMetric::new(
            "files",
            d.files.iter().filter(|f| f.included).count(),
        )],
        StepOutput::Planning(p) => vec![StepMetric::new("tasks", p.tasks.len())],
        StepOutput::Refinement(r) => vec![StepMetric::new("changes", r.changes.len())],
        StepOutput::Implementation(i) => {
            let mut metrics = vec![StepMetric::new("files changed", i.files_changed.len())];
            if let Some(passed) = i.tests_passed {
                metrics.push(StepMetric::new("tests", if passed { "passed" } else { "failed" }));
            }
            metrics
        }
        StepOutput::QualityGate(g) => {
            let passed = g.checks.iter().filter(|c| c.passed).count();
            vec![StepMetric::new(
                "checks",
                format!("{}/{}", passed, g.checks.len()),
            )]
        }
    }
}

fn format_duration(ms: i64) -> String {
    if ms < 1_000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}
