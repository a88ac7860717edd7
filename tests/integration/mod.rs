//! Integration tests for the session state engine.
//!
//! Each module drives the public API against an in-memory database and a
//! scripted agent stream.

// Step transitions, start gate and cached step list
mod pipeline_test;

// Single-runner property over random operation sequences
mod single_runner_test;

// Clarification runs, outcomes and answer merging
mod clarification_test;

// Compaction, fork, export and revert/restore
mod conversation_test;
