//! Forgeflow Core
//!
//! Foundational error types and the agent stream contract for the Forgeflow
//! workspace. This crate has zero dependencies on application-level code
//! (database, engines, configuration).
//!
//! ## Module Organization
//!
//! - `error` - Collaborator error types (`CoreError`, `CoreResult`)
//! - `streaming` - Agent stream events, requests, sessions and the `AgentStream` trait
//! - `scripted` - Deterministic scripted `AgentStream` for tests and offline use

pub mod error;
pub mod scripted;
pub mod streaming;

// ── Error Types ────────────────────────────────────────────────────────
pub use error::{CoreError, CoreResult};

// ── Streaming Types ────────────────────────────────────────────────────
pub use streaming::{
    AgentPurpose, AgentRequest, AgentSession, AgentStream, AgentStreamEvent, SessionEvent,
};

// ── Scripted Stream ────────────────────────────────────────────────────
pub use scripted::{ScriptedAgentStream, ScriptedRun};
