//! Services
//!
//! Engines that validate UI intents against persisted state and drive the
//! agent stream.

pub mod agent;
pub mod clarification;
pub mod conversation;
pub mod pipeline;

pub use clarification::{ClarificationEngine, ClarificationPhase, ClarificationSnapshot};
pub use conversation::{ChatExchange, ConversationEngine, ForkOutcome};
pub use pipeline::{PipelineEngine, StepView};
