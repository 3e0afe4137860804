//! Configuration structures and loading logic

use crate::models::{ModelInfo, ModelKind, ModelSummary};
use crate::session::{
    AsyncBatchSize, ContextLength, ContextMode, Preset, RunConfig, SamplingSeed, SessionConfig,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Main bridge configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Key passed to the engine on activation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model used when a command does not name one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    pub session: SessionDefaults,
    pub run: RunDefaults,
    pub simulation: SimulationConfig,
}

impl BridgeConfig {
    /// Default config file location (`<config dir>/engine-bridge/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("engine-bridge").join("config.toml"))
    }

    /// Load configuration from file with environment variable overrides.
    ///
    /// Without an explicit path the default location is used if it exists.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.or_else(|| Self::default_path().filter(|p| p.exists()));

        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(api_key) = std::env::var("ENGINE_BRIDGE_API_KEY") {
            config.api_key = Some(api_key);
        }
        if let Ok(model) = std::env::var("ENGINE_BRIDGE_DEFAULT_MODEL") {
            config.default_model = Some(model);
        }
        if let Ok(limit) = std::env::var("ENGINE_BRIDGE_TOKENS_LIMIT") {
            config.run.tokens_limit = limit
                .parse()
                .context("Invalid ENGINE_BRIDGE_TOKENS_LIMIT value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.run.tokens_limit <= 0 {
            anyhow::bail!(
                "Tokens limit must be positive (got {})",
                self.run.tokens_limit
            );
        }

        if let Some(key) = &self.api_key
            && key.trim().is_empty()
        {
            anyhow::bail!("API key cannot be empty");
        }

        if self.session.context_length == ContextLength::Custom(0) {
            anyhow::bail!("Custom context length must be greater than zero");
        }

        if self.session.async_batch_size == AsyncBatchSize::Custom(0) {
            anyhow::bail!("Custom async batch size must be greater than zero");
        }

        let mut identifiers = HashSet::new();
        for model in &self.simulation.catalog {
            if model.identifier.is_empty() {
                anyhow::bail!("Simulated model identifier cannot be empty");
            }
            if !identifiers.insert(&model.identifier) {
                anyhow::bail!("Duplicate simulated model: {}", model.identifier);
            }
        }

        if self.simulation.download_steps == 0 {
            anyhow::bail!("Simulated downloads need at least one step");
        }

        Ok(())
    }
}

/// Defaults for loading sessions
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionDefaults {
    pub preset: Preset,
    pub context_mode: ContextMode,
    pub context_length: ContextLength,
    pub sampling_seed: SamplingSeed,
    pub async_batch_size: AsyncBatchSize,
}

impl SessionDefaults {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig::new(self.preset.clone())
            .with_context_mode(self.context_mode.clone())
            .with_context_length(self.context_length)
            .with_sampling_seed(self.sampling_seed)
            .with_async_batch_size(self.async_batch_size)
    }
}

/// Defaults for each generation run
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunDefaults {
    pub tokens_limit: i64,
    pub enable_thinking: bool,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            tokens_limit: default_tokens_limit(),
            enable_thinking: true,
        }
    }
}

impl RunDefaults {
    pub fn to_run_config(&self) -> RunConfig {
        RunConfig::default()
            .with_tokens_limit(self.tokens_limit)
            .with_thinking(self.enable_thinking)
    }
}

/// Settings for the in-memory engine used by the CLI
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Drive downloads from a worker thread instead of waiting for pushed states
    pub auto_downloads: bool,
    pub download_steps: u32,
    pub chunk_delay_ms: u64,
    pub token_delay_ms: u64,
    pub valid_keys: Vec<String>,
    pub grace_keys: Vec<String>,
    pub catalog: Vec<SimulatedModel>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            auto_downloads: true,
            download_steps: default_download_steps(),
            chunk_delay_ms: default_chunk_delay_ms(),
            token_delay_ms: default_token_delay_ms(),
            valid_keys: vec!["demo-key".to_string()],
            grace_keys: Vec::new(),
            catalog: default_catalog(),
        }
    }
}

/// A model seeded into the simulated registry
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SimulatedModel {
    pub identifier: String,
    pub vendor: String,
    pub name: String,

    #[serde(default = "default_precision")]
    pub precision: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,

    #[serde(default = "default_kind")]
    pub kind: ModelKind,

    #[serde(default = "default_size_bytes")]
    pub size_bytes: u64,

    /// Canned reply; a generic one is used when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,

    /// Thinking emitted ahead of the reply when a run enables it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Loading a session for this model fails
    #[serde(default)]
    pub unloadable: bool,
}

impl SimulatedModel {
    /// Model with generic metadata
    pub fn new(identifier: impl Into<String>, kind: ModelKind, size_bytes: u64) -> Self {
        let identifier = identifier.into();
        Self {
            vendor: "Simulated".to_string(),
            name: identifier.clone(),
            identifier,
            precision: default_precision(),
            quantization: None,
            kind,
            size_bytes,
            reply: None,
            reasoning: None,
            unloadable: false,
        }
    }

    pub fn local(identifier: impl Into<String>, size_bytes: u64) -> Self {
        Self::new(identifier, ModelKind::Local, size_bytes)
    }

    pub fn cloud(identifier: impl Into<String>) -> Self {
        Self::new(identifier, ModelKind::Cloud, 0)
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            identifier: self.identifier.clone(),
            info: ModelInfo {
                vendor: self.vendor.clone(),
                name: self.name.clone(),
                precision: self.precision.clone(),
                quantization: self.quantization.clone(),
                kind: self.kind,
            },
            state: Default::default(),
        }
    }
}

// Default functions
fn default_tokens_limit() -> i64 {
    1024
}
fn default_download_steps() -> u32 {
    5
}
fn default_chunk_delay_ms() -> u64 {
    200
}
fn default_token_delay_ms() -> u64 {
    40
}
fn default_precision() -> String {
    "bfloat16".to_string()
}
fn default_kind() -> ModelKind {
    ModelKind::Local
}
fn default_size_bytes() -> u64 {
    1_000_000_000
}
fn default_catalog() -> Vec<SimulatedModel> {
    vec![
        SimulatedModel {
            identifier: "meta-llama-3.2-1b-instruct".to_string(),
            vendor: "Meta".to_string(),
            name: "Llama-3.2-1B-Instruct".to_string(),
            precision: default_precision(),
            quantization: None,
            kind: ModelKind::Local,
            size_bytes: 2_470_000_000,
            reply: None,
            reasoning: None,
            unloadable: false,
        },
        SimulatedModel {
            identifier: "qwen-3-0.6b".to_string(),
            vendor: "Alibaba".to_string(),
            name: "Qwen3-0.6B".to_string(),
            precision: default_precision(),
            quantization: Some("q8".to_string()),
            kind: ModelKind::Local,
            size_bytes: 640_000_000,
            reply: None,
            reasoning: Some("The user wants a short answer, so keep it brief.".to_string()),
            unloadable: false,
        },
        SimulatedModel {
            identifier: "cloud-general".to_string(),
            vendor: "Cloud".to_string(),
            name: "General".to_string(),
            precision: "float16".to_string(),
            quantization: None,
            kind: ModelKind::Cloud,
            size_bytes: 0,
            reply: None,
            reasoning: None,
            unloadable: false,
        },
    ]
}
