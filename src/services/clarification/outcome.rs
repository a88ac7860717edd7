//! Clarification Outcome
//!
//! The terminal payload of a clarification run: either questions for the
//! user or a reason to skip clarification altogether.

use serde::{Deserialize, Serialize};

use crate::models::clarification::ClarificationQuestion;
use crate::utils::error::{AppError, AppResult};

/// Reason recorded when the agent returns an empty question list.
pub const DEFAULT_SKIP_REASON: &str = "No clarification questions were needed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClarificationOutcome {
    Questions {
        questions: Vec<ClarificationQuestion>,
    },
    Skip {
        #[serde(default)]
        reason: String,
    },
}

impl ClarificationOutcome {
    /// Interpret a `complete` payload. A JSON document wrapped in a string is
    /// unwrapped first; an empty question list becomes a skip.
    pub fn parse(outcome: &serde_json::Value) -> AppResult<Self> {
        let parsed: Self = match outcome {
            serde_json::Value::String(text) => serde_json::from_str(text.trim()).map_err(|e| {
                AppError::agent_failure(format!("Unreadable clarification outcome: {}", e))
            })?,
            other => serde_json::from_value(other.clone()).map_err(|e| {
                AppError::agent_failure(format!("Unreadable clarification outcome: {}", e))
            })?,
        };

        Ok(match parsed {
            Self::Questions { questions } if questions.is_empty() => Self::Skip {
                reason: DEFAULT_SKIP_REASON.to_string(),
            },
            Self::Skip { reason } if reason.trim().is_empty() => Self::Skip {
                reason: DEFAULT_SKIP_REASON.to_string(),
            },
            other => other,
        })
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip { .. })
    }
}
