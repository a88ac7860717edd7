//! Storage Layer
//!
//! Handles all data persistence: SQLite repositories and JSON config.

pub mod config;
pub mod conversations;
pub mod database;
pub mod repository;
pub mod workflows;

pub use config::*;
pub use database::*;
pub use repository::*;
