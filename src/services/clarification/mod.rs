//! Clarification
//!
//! Question generation and answer collection for clarification steps.

pub mod engine;
pub mod outcome;
pub mod phase;

pub use engine::{questions_of, ClarificationEngine};
pub use outcome::ClarificationOutcome;
pub use phase::{ClarificationPhase, ClarificationSnapshot, RunMode, ToolActivity};
