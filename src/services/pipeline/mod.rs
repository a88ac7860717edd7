//! Workflow Pipeline
//!
//! Step gate, derived metrics, and the engine that owns step transitions.

pub mod engine;
pub mod gate;
pub mod metrics;

pub use engine::{PipelineEngine, StepContext, StepView};
pub use gate::{auto_startable, can_start};
pub use metrics::{compute_step_metrics, StepMetric};
