//! Clarification Models
//!
//! Structured output of a clarification step: the generated questions, the
//! user's answers keyed by question index, and the skip marker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A selectable answer option offered with a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A question generated by the clarification agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    pub question: String,
    /// Short label shown above the question
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
}

impl ClarificationQuestion {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            header: None,
            options: Vec::new(),
        }
    }
}

/// `outputStructured` of a clarification step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationOutput {
    #[serde(default)]
    pub questions: Vec<ClarificationQuestion>,
    /// Answers keyed by question index
    #[serde(default)]
    pub answers: BTreeMap<usize, String>,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl ClarificationOutput {
    pub fn with_questions(questions: Vec<ClarificationQuestion>) -> Self {
        Self {
            questions,
            ..Default::default()
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: true,
            skip_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Merge submitted answers. Only indices present in `answers` change.
    pub fn merge_answers(&mut self, answers: BTreeMap<usize, String>) {
        self.answers.extend(answers);
    }

    /// Append questions from a "generate more" run, keeping existing
    /// questions and answers in place.
    pub fn append_questions(&mut self, questions: Vec<ClarificationQuestion>) {
        self.questions.extend(questions);
        self.skipped = false;
        self.skip_reason = None;
    }

    pub fn answered_count(&self) -> usize {
        self.answers
            .iter()
            .filter(|(idx, answer)| **idx < self.questions.len() && !answer.trim().is_empty())
            .count()
    }

    pub fn has_questions(&self) -> bool {
        !self.questions.is_empty()
    }

    /// Render answered questions as plain text for the step's `outputText`.
    pub fn to_output_text(&self) -> String {
        if self.skipped {
            return format!(
                "Clarification skipped: {}",
                self.skip_reason.as_deref().unwrap_or("no reason given")
            );
        }

        let mut out = String::new();
        for (idx, question) in self.questions.iter().enumerate() {
            let answer = self
                .answers
                .get(&idx)
                .map(String::as_str)
                .unwrap_or("(unanswered)");
            out.push_str(&format!("Q{}: {}\nA: {}\n", idx + 1, question.question, answer));
        }
        out
    }
}
