//! Catalog of models known to the engine
//!
//! Two reconciliation modes:
//! - full sync replaces the whole collection, so models removed upstream
//!   disappear together with their download state
//! - incremental pushes upsert by identifier, last write wins, and never delete

use super::state::ModelDownloadState;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Where a model runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Weights are downloaded and executed on device
    Local,
    /// Executed remotely, nothing to download
    Cloud,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Cloud => write!(f, "cloud"),
        }
    }
}

/// Typed reference used when requesting a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelRef {
    Local(String),
    Cloud(String),
}

impl ModelRef {
    pub fn identifier(&self) -> &str {
        match self {
            Self::Local(id) | Self::Cloud(id) => id,
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Local(_) => ModelKind::Local,
            Self::Cloud(_) => ModelKind::Cloud,
        }
    }
}

/// Descriptive metadata for a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub vendor: String,
    pub name: String,
    pub precision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    pub kind: ModelKind,
}

/// A model as listed by the engine registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub identifier: String,
    pub info: ModelInfo,
    #[serde(default)]
    pub state: ModelDownloadState,
}

/// Identifiers touched by a full sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub retained: Vec<String>,
}

impl CatalogDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Metadata and download state for every known model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    info: HashMap<String, ModelInfo>,
    states: HashMap<String, ModelDownloadState>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_models(models: Vec<ModelSummary>) -> Self {
        let mut catalog = Self::new();
        catalog.replace(models);
        catalog
    }

    /// Replace the whole collection with a fresh registry listing.
    ///
    /// A listing that repeats an identifier keeps its last entry.
    pub fn replace(&mut self, models: Vec<ModelSummary>) -> CatalogDiff {
        let incoming: HashSet<&str> = models.iter().map(|m| m.identifier.as_str()).collect();

        let mut diff = CatalogDiff::default();
        for id in self.info.keys() {
            if !incoming.contains(id.as_str()) {
                diff.removed.push(id.clone());
            }
        }
        for id in &incoming {
            if self.info.contains_key(*id) {
                diff.retained.push(id.to_string());
            } else {
                diff.added.push(id.to_string());
            }
        }
        diff.added.sort();
        diff.removed.sort();
        diff.retained.sort();

        let mut info = HashMap::with_capacity(models.len());
        let mut states = HashMap::with_capacity(models.len());
        for model in models {
            states.insert(model.identifier.clone(), model.state);
            info.insert(model.identifier, model.info);
        }
        self.info = info;
        self.states = states;

        diff
    }

    /// Insert or overwrite entries by identifier. Absent identifiers are kept.
    pub fn upsert(&mut self, models: Vec<ModelSummary>) {
        for model in models {
            self.states.insert(model.identifier.clone(), model.state);
            self.info.insert(model.identifier, model.info);
        }
    }

    /// Record an engine-reported state. Unknown identifiers are inserted.
    pub fn apply_state(
        &mut self,
        identifier: &str,
        state: ModelDownloadState,
    ) -> &ModelDownloadState {
        self.states
            .entry(identifier.to_string())
            .or_default()
            .apply(state)
    }

    /// Current state, inserting the default if the model has never been seen
    pub fn state_or_default(&mut self, identifier: &str) -> &ModelDownloadState {
        self.states.entry(identifier.to_string()).or_default()
    }

    pub fn state(&self, identifier: &str) -> Option<&ModelDownloadState> {
        self.states.get(identifier)
    }

    pub fn info(&self, identifier: &str) -> Option<&ModelInfo> {
        self.info.get(identifier)
    }

    pub fn states(&self) -> &HashMap<String, ModelDownloadState> {
        &self.states
    }

    pub fn models(&self) -> &HashMap<String, ModelInfo> {
        &self.info
    }

    pub fn len(&self) -> usize {
        self.info.len()
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }

    /// Identifiers sorted for stable presentation
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.info.keys().cloned().collect();
        ids.sort();
        ids
    }
}
