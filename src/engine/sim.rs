//! In-memory engine
//!
//! Stands in for the native bindings on platforms without them and in tests.
//! Downloads either advance on a worker thread (auto mode) or only move when
//! a state is pushed with [`SimulatedEngine::emit_state`] (manual mode).

use super::{
    CatalogHandler, LicenseStatusHandler, ModelStateHandler, NativeEngine, NativeSession,
};
use crate::config::{SimulatedModel, SimulationConfig};
use crate::error::{EngineError, EngineErrorKind};
use crate::license::LicenseStatus;
use crate::models::{ModelDownloadState, ModelKind, ModelRef, ModelSummary};
use crate::session::{
    ContextMode, FinishReason, GrammarConfig, Input, Output, OutputStats, RunConfig, SessionConfig,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct SimModel {
    seed: SimulatedModel,
    state: ModelDownloadState,
    downloaded_bytes: u64,
    /// Bumped whenever a running worker must stop
    worker_epoch: u64,
}

impl SimModel {
    fn new(seed: SimulatedModel) -> Self {
        let state = match seed.kind {
            ModelKind::Local => ModelDownloadState::not_downloaded(Some(seed.size_bytes)),
            ModelKind::Cloud => ModelDownloadState::downloaded(0),
        };
        Self {
            seed,
            state,
            downloaded_bytes: 0,
            worker_epoch: 0,
        }
    }

    fn summary(&self) -> ModelSummary {
        let mut summary = self.seed.summary();
        summary.state = self.state.clone();
        summary
    }

    fn total(&self) -> u64 {
        self.seed.size_bytes
    }
}

#[derive(Default)]
struct Handlers {
    license: Vec<Arc<dyn LicenseStatusHandler>>,
    state: Vec<Arc<dyn ModelStateHandler>>,
    catalog: Vec<Arc<dyn CatalogHandler>>,
}

#[derive(Debug, Clone, Copy)]
struct AutoDownload {
    steps: u32,
    chunk_delay: Duration,
}

struct Inner {
    valid_keys: RwLock<HashSet<String>>,
    grace_keys: RwLock<HashSet<String>>,
    license: Mutex<LicenseStatus>,
    models: Mutex<BTreeMap<String, SimModel>>,
    /// Listing returned by the next registry refresh
    upstream: Mutex<Option<Vec<SimulatedModel>>>,
    registry_error: Mutex<Option<EngineError>>,
    handlers: RwLock<Handlers>,
    download_requests: Mutex<HashMap<String, usize>>,
    session_requests: AtomicUsize,
    auto: Mutex<Option<AutoDownload>>,
    token_delay: Mutex<Duration>,
}

/// Engine implementation backed by in-memory tables
#[derive(Clone)]
pub struct SimulatedEngine {
    inner: Arc<Inner>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEngine {
    /// Empty engine in manual download mode
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                valid_keys: RwLock::new(HashSet::new()),
                grace_keys: RwLock::new(HashSet::new()),
                license: Mutex::new(LicenseStatus::NotActivated),
                models: Mutex::new(BTreeMap::new()),
                upstream: Mutex::new(None),
                registry_error: Mutex::new(None),
                handlers: RwLock::new(Handlers::default()),
                download_requests: Mutex::new(HashMap::new()),
                session_requests: AtomicUsize::new(0),
                auto: Mutex::new(None),
                token_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        let engine = Self::new()
            .with_token_delay(Duration::from_millis(config.token_delay_ms));
        for key in &config.valid_keys {
            engine.inner.valid_keys.write().insert(key.clone());
        }
        for key in &config.grace_keys {
            engine.inner.grace_keys.write().insert(key.clone());
        }
        for model in &config.catalog {
            engine.add_model(model.clone());
        }
        if config.auto_downloads {
            engine.with_auto_downloads(config.download_steps, Duration::from_millis(config.chunk_delay_ms))
        } else {
            engine
        }
    }

    #[must_use]
    pub fn with_valid_key(self, key: impl Into<String>) -> Self {
        self.inner.valid_keys.write().insert(key.into());
        self
    }

    #[must_use]
    pub fn with_grace_key(self, key: impl Into<String>) -> Self {
        self.inner.grace_keys.write().insert(key.into());
        self
    }

    #[must_use]
    pub fn with_model(self, model: SimulatedModel) -> Self {
        self.add_model(model);
        self
    }

    /// Local model with generic metadata
    #[must_use]
    pub fn with_local_model(self, identifier: &str, size_bytes: u64) -> Self {
        self.with_model(SimulatedModel::local(identifier, size_bytes))
    }

    #[must_use]
    pub fn with_cloud_model(self, identifier: &str) -> Self {
        self.with_model(SimulatedModel::cloud(identifier))
    }

    #[must_use]
    pub fn with_reply(self, identifier: &str, reply: impl Into<String>) -> Self {
        if let Some(model) = self.inner.models.lock().get_mut(identifier) {
            model.seed.reply = Some(reply.into());
        }
        self
    }

    /// Thinking emitted before the reply of runs that enable it
    #[must_use]
    pub fn with_reasoning(self, identifier: &str, reasoning: impl Into<String>) -> Self {
        if let Some(model) = self.inner.models.lock().get_mut(identifier) {
            model.seed.reasoning = Some(reasoning.into());
        }
        self
    }

    #[must_use]
    pub fn with_unloadable(self, identifier: &str) -> Self {
        if let Some(model) = self.inner.models.lock().get_mut(identifier) {
            model.seed.unloadable = true;
        }
        self
    }

    /// Advance downloads on a worker thread in `steps` equal chunks
    #[must_use]
    pub fn with_auto_downloads(self, steps: u32, chunk_delay: Duration) -> Self {
        *self.inner.auto.lock() = Some(AutoDownload {
            steps: steps.max(1),
            chunk_delay,
        });
        self
    }

    #[must_use]
    pub fn with_token_delay(self, delay: Duration) -> Self {
        *self.inner.token_delay.lock() = delay;
        self
    }

    fn add_model(&self, seed: SimulatedModel) {
        self.inner
            .models
            .lock()
            .insert(seed.identifier.clone(), SimModel::new(seed));
    }

    // ------------------------------------------------------------------------
    // Scripting hooks
    // ------------------------------------------------------------------------

    /// Push a state transition as if the native layer reported it
    pub fn emit_state(&self, identifier: &str, state: ModelDownloadState) {
        let mut models = self.inner.models.lock();
        if let Some(model) = models.get_mut(identifier) {
            model.state = state.clone();
            model.downloaded_bytes = state.downloaded_bytes();
        }
        self.inner.notify_state(identifier, state);
    }

    /// Push a license status change without an activation call
    pub fn emit_license(&self, status: LicenseStatus) {
        *self.inner.license.lock() = status;
        self.inner.notify_license(status);
    }

    /// Push an incremental catalog update, upserting into the registry
    pub fn emit_catalog(&self, models: Vec<SimulatedModel>) {
        let summaries = {
            let mut table = self.inner.models.lock();
            models
                .into_iter()
                .map(|seed| {
                    let entry = table
                        .entry(seed.identifier.clone())
                        .or_insert_with(|| SimModel::new(seed.clone()));
                    entry.seed = seed;
                    entry.summary()
                })
                .collect::<Vec<_>>()
        };
        let handlers = self.inner.handlers.read().catalog.clone();
        for handler in handlers {
            handler.on_catalog(summaries.clone());
        }
    }

    /// Listing the next `update_registry` call returns
    pub fn set_upstream(&self, models: Vec<SimulatedModel>) {
        *self.inner.upstream.lock() = Some(models);
    }

    /// Make registry refreshes fail until cleared
    pub fn set_registry_error(&self, error: Option<EngineError>) {
        *self.inner.registry_error.lock() = error;
    }

    /// How many times `download` was called for an identifier
    pub fn download_requests(&self, identifier: &str) -> usize {
        self.inner
            .download_requests
            .lock()
            .get(identifier)
            .copied()
            .unwrap_or(0)
    }

    /// How many sessions were requested from the engine
    pub fn session_requests(&self) -> usize {
        self.inner.session_requests.load(Ordering::SeqCst)
    }

    pub fn current_license(&self) -> LicenseStatus {
        *self.inner.license.lock()
    }

    fn spawn_worker(&self, identifier: &str, epoch: u64, auto: AutoDownload) {
        let inner = self.inner.clone();
        let identifier = identifier.to_string();
        std::thread::spawn(move || inner.download_worker(&identifier, epoch, auto));
    }
}

impl Inner {
    fn notify_license(&self, status: LicenseStatus) {
        let handlers = self.handlers.read().license.clone();
        for handler in handlers {
            handler.on_status(status);
        }
    }

    // Called with the model table locked so transitions reach handlers in the
    // order they were applied. Handlers must not call back into the engine.
    fn notify_state(&self, identifier: &str, state: ModelDownloadState) {
        let handlers = self.handlers.read().state.clone();
        for handler in handlers {
            handler.on_state(identifier, state.clone());
        }
    }

    fn download_worker(&self, identifier: &str, epoch: u64, auto: AutoDownload) {
        tracing::debug!(identifier, "Simulated download worker started");
        loop {
            std::thread::sleep(auto.chunk_delay);

            let mut models = self.models.lock();
            let Some(model) = models.get_mut(identifier) else {
                return;
            };
            if model.worker_epoch != epoch || !model.state.is_downloading() {
                return;
            }

            let total = model.total();
            let chunk = (total / u64::from(auto.steps)).max(1);
            model.downloaded_bytes = (model.downloaded_bytes + chunk).min(total);

            let state = if model.downloaded_bytes >= total {
                ModelDownloadState::downloaded(total)
            } else {
                ModelDownloadState::downloading(model.downloaded_bytes, total)
            };
            model.state = state.clone();
            let done = state.is_downloaded();
            self.notify_state(identifier, state);

            if done {
                tracing::debug!(identifier, "Simulated download finished");
                return;
            }
        }
    }
}

#[async_trait]
impl NativeEngine for SimulatedEngine {
    async fn activate(&self, api_key: &str) -> Result<LicenseStatus, EngineError> {
        let status = if self.inner.valid_keys.read().contains(api_key) {
            LicenseStatus::Activated
        } else if self.inner.grace_keys.read().contains(api_key) {
            LicenseStatus::GracePeriodActive
        } else {
            LicenseStatus::InvalidApiKey
        };
        tracing::debug!(status = %status, "Simulated activation");
        self.emit_license(status);
        Ok(status)
    }

    fn register_license_status_handler(&self, handler: Arc<dyn LicenseStatusHandler>) {
        self.inner.handlers.write().license.push(handler);
    }

    fn register_model_state_handler(&self, handler: Arc<dyn ModelStateHandler>) {
        self.inner.handlers.write().state.push(handler);
    }

    fn register_catalog_handler(&self, handler: Arc<dyn CatalogHandler>) {
        self.inner.handlers.write().catalog.push(handler);
    }

    fn models(&self) -> Vec<ModelSummary> {
        self.inner
            .models
            .lock()
            .values()
            .map(SimModel::summary)
            .collect()
    }

    async fn update_registry(&self) -> Result<Vec<ModelSummary>, EngineError> {
        if let Some(error) = self.inner.registry_error.lock().clone() {
            return Err(error);
        }

        if let Some(upstream) = self.inner.upstream.lock().take() {
            let mut models = self.inner.models.lock();
            let mut next = BTreeMap::new();
            for seed in upstream {
                let entry = match models.remove(&seed.identifier) {
                    Some(mut existing) => {
                        existing.seed = seed;
                        existing
                    }
                    None => SimModel::new(seed),
                };
                next.insert(entry.seed.identifier.clone(), entry);
            }
            // Dropped models stop any running worker with them
            *models = next;
        }

        Ok(self.models())
    }

    fn download(&self, identifier: &str) -> Result<(), EngineError> {
        *self
            .inner
            .download_requests
            .lock()
            .entry(identifier.to_string())
            .or_default() += 1;

        let auto = *self.inner.auto.lock();
        let mut models = self.inner.models.lock();
        let model = models.get_mut(identifier).ok_or_else(|| {
            EngineError::new(
                EngineErrorKind::ModelNotFound,
                format!("Unknown model: {}", identifier),
            )
        })?;

        if model.seed.kind == ModelKind::Cloud {
            return Err(EngineError::new(
                EngineErrorKind::Download,
                format!("Cloud model {} has nothing to download", identifier),
            ));
        }
        if model.state.is_downloading() || model.state.is_downloaded() {
            return Ok(());
        }

        // Manual mode: the caller scripts every transition
        let Some(auto) = auto else {
            return Ok(());
        };

        model.worker_epoch += 1;
        let epoch = model.worker_epoch;
        let state = ModelDownloadState::downloading(model.downloaded_bytes, model.total());
        model.state = state.clone();
        self.inner.notify_state(identifier, state);
        drop(models);

        self.spawn_worker(identifier, epoch, auto);
        Ok(())
    }

    fn pause(&self, identifier: &str) {
        let mut models = self.inner.models.lock();
        if let Some(model) = models.get_mut(identifier)
            && model.state.is_downloading()
        {
            model.worker_epoch += 1;
            model.downloaded_bytes = model.state.downloaded_bytes();
            let state = ModelDownloadState::paused(model.downloaded_bytes, model.total());
            model.state = state.clone();
            self.inner.notify_state(identifier, state);
        }
    }

    fn resume(&self, identifier: &str) {
        let auto = *self.inner.auto.lock();
        let mut models = self.inner.models.lock();
        let Some(model) = models.get_mut(identifier) else {
            return;
        };
        if !matches!(model.state, ModelDownloadState::Paused { .. }) {
            return;
        }

        model.worker_epoch += 1;
        let epoch = model.worker_epoch;
        let state = ModelDownloadState::downloading(model.downloaded_bytes, model.total());
        model.state = state.clone();
        self.inner.notify_state(identifier, state);
        drop(models);

        if let Some(auto) = auto {
            self.spawn_worker(identifier, epoch, auto);
        }
    }

    fn stop(&self, identifier: &str) {
        let mut models = self.inner.models.lock();
        if let Some(model) = models.get_mut(identifier)
            && (model.state.is_downloading() || matches!(model.state, ModelDownloadState::Paused { .. }))
        {
            model.worker_epoch += 1;
            model.downloaded_bytes = 0;
            let state = ModelDownloadState::not_downloaded(Some(model.total()));
            model.state = state.clone();
            self.inner.notify_state(identifier, state);
        }
    }

    fn delete(&self, identifier: &str) {
        let mut models = self.inner.models.lock();
        if let Some(model) = models.get_mut(identifier)
            && model.seed.kind == ModelKind::Local
        {
            model.worker_epoch += 1;
            model.downloaded_bytes = 0;
            let state = ModelDownloadState::not_downloaded(Some(model.total()));
            model.state = state.clone();
            self.inner.notify_state(identifier, state);
        }
    }

    fn create_session(&self, model: &ModelRef) -> Result<Box<dyn NativeSession>, EngineError> {
        self.inner.session_requests.fetch_add(1, Ordering::SeqCst);
        let models = self.inner.models.lock();
        let entry = models.get(model.identifier()).ok_or_else(|| {
            EngineError::new(
                EngineErrorKind::ModelNotFound,
                format!("Unknown model: {}", model.identifier()),
            )
        })?;

        let reply = entry.seed.reply.clone().unwrap_or_else(|| {
            format!(
                "Hello from {}. This reply was produced by the simulated engine.",
                entry.seed.name
            )
        });

        Ok(Box::new(SimulatedSession {
            identifier: entry.seed.identifier.clone(),
            reply,
            reasoning: entry.seed.reasoning.clone(),
            unloadable: entry.seed.unloadable,
            token_delay: *self.inner.token_delay.lock(),
            loaded: Mutex::new(None),
            history_tokens: Mutex::new(0),
        }))
    }
}

/// Session replaying a canned reply one word at a time
struct SimulatedSession {
    identifier: String,
    reply: String,
    reasoning: Option<String>,
    unloadable: bool,
    token_delay: Duration,
    loaded: Mutex<Option<SessionConfig>>,
    /// Tokens held in a dynamic context
    history_tokens: Mutex<u64>,
}

impl SimulatedSession {
    fn reply_for(&self, config: &RunConfig) -> String {
        match &config.grammar {
            Some(GrammarConfig::JsonSchema(_)) => {
                serde_json::json!({ "model": self.identifier, "text": self.reply }).to_string()
            }
            None => self.reply.clone(),
        }
    }

    /// Tokens generated in order, thinking first when enabled
    fn tokens_for(&self, config: &RunConfig) -> Vec<String> {
        let mut tokens = Vec::new();
        if config.enable_thinking
            && let Some(reasoning) = &self.reasoning
        {
            tokens.push("<think>".to_string());
            tokens.extend(reasoning.split_whitespace().map(str::to_string));
            tokens.push("</think>".to_string());
        }
        tokens.extend(self.reply_for(config).split_whitespace().map(str::to_string));
        tokens
    }
}

fn count_words(input: &Input) -> u64 {
    let words = match input {
        Input::Text(text) => text.split_whitespace().count(),
        Input::Messages(messages) => messages
            .iter()
            .map(|m| m.content.split_whitespace().count())
            .sum(),
    };
    words as u64
}

impl NativeSession for SimulatedSession {
    fn load(&self, config: &SessionConfig) -> Result<(), EngineError> {
        if self.unloadable {
            return Err(EngineError::new(
                EngineErrorKind::Unavailable,
                format!("Model {} cannot be loaded on this device", self.identifier),
            ));
        }
        *self.loaded.lock() = Some(config.clone());
        *self.history_tokens.lock() = 0;
        Ok(())
    }

    fn run(
        &self,
        input: &Input,
        config: &RunConfig,
        on_partial: &mut dyn FnMut(&Output) -> bool,
    ) -> Result<Output, EngineError> {
        let Some(loaded) = self.loaded.lock().clone() else {
            return Err(EngineError::new(
                EngineErrorKind::Generation,
                format!("Model {} is not loaded", self.identifier),
            ));
        };

        let started = Instant::now();
        let limit = usize::try_from(config.tokens_limit).unwrap_or(0);
        let tokens = self.tokens_for(config);
        let context_tokens = match &loaded.context_mode {
            ContextMode::None => 0,
            ContextMode::Static { input } => count_words(input),
            ContextMode::Dynamic => *self.history_tokens.lock(),
        };
        let tokens_in = count_words(input);

        let mut output = Output {
            stats: OutputStats {
                tokens_count_input: context_tokens + tokens_in,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut finish = FinishReason::Stop;

        for word in &tokens {
            if output.stats.tokens_count_output as usize >= limit {
                finish = FinishReason::Length;
                break;
            }
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }

            output.text.push_str(word);
            output.text.push(' ');
            output.stats.tokens_count_output += 1;
            output.stats.duration_secs = started.elapsed().as_secs_f64();

            if !on_partial(&output) {
                finish = FinishReason::Cancelled;
                break;
            }
        }

        output.text = output.text.trim_end().to_string();
        output.stats.duration_secs = started.elapsed().as_secs_f64();
        output.finish_reason = Some(finish);

        if loaded.context_mode == ContextMode::Dynamic {
            *self.history_tokens.lock() += tokens_in + output.stats.tokens_count_output;
        }
        Ok(output)
    }
}
