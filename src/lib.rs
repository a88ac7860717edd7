//! Forgeflow Desktop - Session State Engine
//!
//! Backend library for the Forgeflow desktop app. It includes:
//! - The workflow pipeline with its step gate and clarification sub-engine
//! - Branching chat conversations with revert, fork and compaction
//! - Storage layer (SQLite repositories, JSON config)
//! - The in-memory session store observed by the UI

pub mod models;
pub mod services;
pub mod session_store;
pub mod state;
pub mod storage;
pub mod utils;

pub use forgeflow_core::{AgentRequest, AgentSession, AgentStream, AgentStreamEvent, SessionEvent};
pub use session_store::{SessionState, SessionStore};
pub use state::EngineState;
pub use utils::error::{AppError, AppResult};
