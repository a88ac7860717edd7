//! Data Models
//!
//! Contains all data structures used throughout the engine.

pub mod clarification;
pub mod conversation;
pub mod settings;
pub mod step_output;
pub mod workflow;

pub use clarification::*;
pub use conversation::*;
pub use settings::*;
pub use step_output::*;
pub use workflow::*;
