//! Conversations
//!
//! Branching chat histories with soft-delete revert, fork, export and
//! summary-based compaction.

pub mod engine;
pub mod summarizer;
pub mod tokens;

pub use engine::{ChatExchange, ConversationEngine, ForkOutcome};
pub use summarizer::{AgentSummarizer, FnSummarizer, SummarizeFn, Summarizer};
pub use tokens::estimate_tokens;
