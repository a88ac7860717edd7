//! Settings Models
//!
//! Engine configuration stored in config.json.

use serde::{Deserialize, Serialize};

use crate::models::workflow::PauseBehavior;

/// Token estimation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    /// Characters counted as one token by the estimator
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: u32,
}

fn default_chars_per_token() -> u32 {
    4
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            chars_per_token: default_chars_per_token(),
        }
    }
}

/// Conversation compaction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionConfig {
    /// Whether threshold-triggered compaction runs at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Context window size of the chat agent, in tokens
    #[serde(default = "default_context_window")]
    pub context_window_tokens: i64,
    /// Fraction of the window that triggers compaction
    #[serde(default = "default_trigger_ratio")]
    pub trigger_ratio: f64,
    /// Fraction of active messages (by count) to compact
    #[serde(default = "default_threshold_fraction")]
    pub threshold_fraction: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_context_window() -> i64 {
    200_000
}

fn default_trigger_ratio() -> f64 {
    0.8
}

fn default_threshold_fraction() -> f64 {
    0.5
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            context_window_tokens: default_context_window(),
            trigger_ratio: default_trigger_ratio(),
            threshold_fraction: default_threshold_fraction(),
        }
    }
}

impl CompactionConfig {
    /// Active-token total above which compaction is triggered.
    pub fn trigger_tokens(&self) -> i64 {
        (self.context_window_tokens as f64 * self.trigger_ratio) as i64
    }

    /// Check if compaction should be triggered for the given token total.
    pub fn should_compact(&self, active_tokens: i64) -> bool {
        self.enabled && active_tokens > self.trigger_tokens()
    }
}

/// Clarification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationConfig {
    /// Soft cap on questions requested from the agent per run
    #[serde(default = "default_max_questions")]
    pub max_questions: u32,
}

fn default_max_questions() -> u32 {
    8
}

impl Default for ClarificationConfig {
    fn default() -> Self {
        Self {
            max_questions: default_max_questions(),
        }
    }
}

/// Fork settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkConfig {
    #[serde(default)]
    pub generate_title_by_default: bool,
    #[serde(default = "default_fallback_suffix")]
    pub fallback_title_suffix: String,
}

fn default_fallback_suffix() -> String {
    " (fork)".to_string()
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            generate_title_by_default: false,
            fallback_title_suffix: default_fallback_suffix(),
        }
    }
}

/// Engine configuration stored in config.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Pause behavior for workflows created without an explicit one
    #[serde(default)]
    pub default_pause_behavior: PauseBehavior,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub clarification: ClarificationConfig,
    #[serde(default)]
    pub fork: ForkConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_pause_behavior: PauseBehavior::default(),
            tokens: TokenConfig::default(),
            compaction: CompactionConfig::default(),
            clarification: ClarificationConfig::default(),
            fork: ForkConfig::default(),
        }
    }
}

/// Settings update request (partial update)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub default_pause_behavior: Option<PauseBehavior>,
    pub chars_per_token: Option<u32>,
    pub compaction_enabled: Option<bool>,
    pub context_window_tokens: Option<i64>,
    pub trigger_ratio: Option<f64>,
    pub threshold_fraction: Option<f64>,
    pub max_questions: Option<u32>,
    pub generate_title_by_default: Option<bool>,
}

impl EngineConfig {
    /// Apply a partial update to the configuration
    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(behavior) = update.default_pause_behavior {
            self.default_pause_behavior = behavior;
        }
        if let Some(chars) = update.chars_per_token {
            self.tokens.chars_per_token = chars;
        }
        if let Some(enabled) = update.compaction_enabled {
            self.compaction.enabled = enabled;
        }
        if let Some(window) = update.context_window_tokens {
            self.compaction.context_window_tokens = window;
        }
        if let Some(ratio) = update.trigger_ratio {
            self.compaction.trigger_ratio = ratio;
        }
        if let Some(fraction) = update.threshold_fraction {
            self.compaction.threshold_fraction = fraction;
        }
        if let Some(max) = update.max_questions {
            self.clarification.max_questions = max;
        }
        if let Some(generate) = update.generate_title_by_default {
            self.fork.generate_title_by_default = generate;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.tokens.chars_per_token == 0 {
            return Err("charsPerToken must be at least 1".to_string());
        }

        if self.compaction.context_window_tokens <= 0 {
            return Err("contextWindowTokens must be positive".to_string());
        }

        if !(self.compaction.trigger_ratio > 0.0 && self.compaction.trigger_ratio <= 1.0) {
            return Err(format!(
                "triggerRatio must be in (0, 1], got {}",
                self.compaction.trigger_ratio
            ));
        }

        if !(self.compaction.threshold_fraction > 0.0 && self.compaction.threshold_fraction <= 1.0)
        {
            return Err(format!(
                "thresholdFraction must be in (0, 1], got {}",
                self.compaction.threshold_fraction
            ));
        }

        if self.clarification.max_questions == 0 {
            return Err("maxQuestions must be at least 1".to_string());
        }

        Ok(())
    }
}
