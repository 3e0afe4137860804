//! Load and run configuration for sessions

use super::io::Input;
use serde::{Deserialize, Serialize};

/// What the loaded model is tuned for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Preset {
    #[default]
    General,
    Classification {
        feature: String,
        values: Vec<String>,
    },
    Summarization,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextLength {
    #[default]
    Default,
    Maximal,
    Custom(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefillStepSize {
    #[default]
    Default,
    Custom(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingSeed {
    #[default]
    Default,
    Custom(u64),
}

/// How conversation context carries across runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ContextMode {
    /// Every run starts from an empty context
    #[default]
    None,
    /// Every run starts from the same prefilled input, such as shared instructions
    Static { input: Input },
    /// Runs extend one growing conversation
    Dynamic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncBatchSize {
    #[default]
    Default,
    Custom(u32),
}

/// Immutable configuration a session is loaded with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub preset: Preset,
    pub context_mode: ContextMode,
    pub context_length: ContextLength,
    pub prefill_step_size: PrefillStepSize,
    pub sampling_seed: SamplingSeed,
    pub async_batch_size: AsyncBatchSize,
}

impl SessionConfig {
    pub fn new(preset: Preset) -> Self {
        Self {
            preset,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_context_mode(mut self, context_mode: ContextMode) -> Self {
        self.context_mode = context_mode;
        self
    }

    #[must_use]
    pub fn with_context_length(mut self, context_length: ContextLength) -> Self {
        self.context_length = context_length;
        self
    }

    #[must_use]
    pub fn with_prefill_step_size(mut self, prefill_step_size: PrefillStepSize) -> Self {
        self.prefill_step_size = prefill_step_size;
        self
    }

    #[must_use]
    pub fn with_sampling_seed(mut self, sampling_seed: SamplingSeed) -> Self {
        self.sampling_seed = sampling_seed;
        self
    }

    #[must_use]
    pub fn with_async_batch_size(mut self, async_batch_size: AsyncBatchSize) -> Self {
        self.async_batch_size = async_batch_size;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SamplingMethod {
    Greedy,
    Temperature { temperature: f32 },
    TopP { top_p: f32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingPolicy {
    /// Whatever the model ships with
    #[default]
    Default,
    Custom(SamplingMethod),
}

/// Constrains generated text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrammarConfig {
    JsonSchema(String),
}

impl GrammarConfig {
    pub fn json_schema(schema: &serde_json::Value) -> Self {
        Self::JsonSchema(schema.to_string())
    }
}

/// Per-run generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub tokens_limit: i64,
    pub enable_thinking: bool,
    pub sampling_policy: SamplingPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grammar: Option<GrammarConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            tokens_limit: default_tokens_limit(),
            enable_thinking: true,
            sampling_policy: SamplingPolicy::Default,
            grammar: None,
        }
    }
}

impl RunConfig {
    #[must_use]
    pub fn with_tokens_limit(mut self, tokens_limit: i64) -> Self {
        self.tokens_limit = tokens_limit;
        self
    }

    #[must_use]
    pub fn with_thinking(mut self, enable_thinking: bool) -> Self {
        self.enable_thinking = enable_thinking;
        self
    }

    #[must_use]
    pub fn with_sampling_policy(mut self, sampling_policy: SamplingPolicy) -> Self {
        self.sampling_policy = sampling_policy;
        self
    }

    #[must_use]
    pub fn with_grammar(mut self, grammar: GrammarConfig) -> Self {
        self.grammar = Some(grammar);
        self
    }
}

fn default_tokens_limit() -> i64 {
    1024
}
