//! Application-facing runtime
//!
//! Wires a [`NativeEngine`] to the event bridge and exposes license, catalog,
//! download and session operations on top of the bridged state.

use crate::bridge::EventBridge;
use crate::engine::{LicenseStatusHandler, NativeEngine};
use crate::error::{DownloadResult, EngineError, LicenseError, SessionError, SessionResult};
use crate::license::LicenseStatus;
use crate::models::{
    Catalog, CatalogDiff, DownloadHandle, ModelDownloadState, ModelInfo, ModelKind, ModelRef,
    ModelSummary, ProgressUpdate,
};
use crate::session::{Session, SessionConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

pub struct Runtime {
    engine: Arc<dyn NativeEngine>,
    bridge: EventBridge,
    shutdown: CancellationToken,
    _shutdown_guard: DropGuard,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("license", &self.license_status())
            .field("models", &self.bridge.catalog().len())
            .finish()
    }
}

impl Runtime {
    /// Register the bridge with the engine and spawn its owning task.
    ///
    /// Must be called from within a tokio runtime. The bridge task stops when
    /// the returned runtime is dropped or [`Runtime::shutdown`] is called.
    pub fn start(engine: Arc<dyn NativeEngine>) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let catalog = Catalog::from_models(engine.models());
        tracing::info!(models = catalog.len(), "Starting engine bridge");

        let bridge = EventBridge::spawn(catalog, shutdown.clone());
        engine.register_license_status_handler(Arc::new(bridge.clone()));
        engine.register_model_state_handler(Arc::new(bridge.clone()));
        engine.register_catalog_handler(Arc::new(bridge.clone()));

        Arc::new(Self {
            engine,
            bridge,
            _shutdown_guard: shutdown.clone().drop_guard(),
            shutdown,
        })
    }

    pub fn shutdown(&self) {
        tracing::info!("Shutting down engine bridge");
        self.shutdown.cancel();
    }

    pub fn bridge(&self) -> &EventBridge {
        &self.bridge
    }

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.engine
    }

    /// Wait until every event pushed so far is reflected in snapshots
    pub async fn flush(&self) {
        self.bridge.flush().await;
    }

    // ------------------------------------------------------------------------
    // License
    // ------------------------------------------------------------------------

    /// Activate the engine license.
    ///
    /// Returns the status the engine reported, usable or not; the observable
    /// status has been updated by the time this returns. Only a failure of the
    /// activation call itself is an error.
    pub async fn activate(&self, api_key: &str) -> Result<LicenseStatus, LicenseError> {
        let status = self.engine.activate(api_key).await.map_err(|e| {
            tracing::error!(error = %e, "License activation failed");
            LicenseError::Engine(e)
        })?;

        self.bridge.on_status(status);
        self.bridge.flush().await;

        if status.is_usable() {
            tracing::info!(status = %status, "License activated");
        } else {
            tracing::warn!(status = %status, "License not usable");
        }
        Ok(status)
    }

    pub fn license_status(&self) -> LicenseStatus {
        self.bridge.license_status()
    }

    pub fn is_license_usable(&self) -> bool {
        self.license_status().is_usable()
    }

    pub fn subscribe_license(&self) -> watch::Receiver<LicenseStatus> {
        self.bridge.watch_license()
    }

    // ------------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------------

    pub fn catalog(&self) -> Catalog {
        self.bridge.catalog()
    }

    pub fn subscribe_catalog(&self) -> watch::Receiver<Catalog> {
        self.bridge.watch_catalog()
    }

    pub fn states(&self) -> HashMap<String, ModelDownloadState> {
        self.bridge.catalog().states().clone()
    }

    pub fn state(&self, identifier: &str) -> ModelDownloadState {
        self.bridge.state(identifier).unwrap_or_default()
    }

    pub fn info(&self, identifier: &str) -> Option<ModelInfo> {
        self.bridge.catalog().info(identifier).cloned()
    }

    /// Catalogued models as summaries, sorted by identifier
    pub fn models(&self) -> Vec<ModelSummary> {
        let catalog = self.bridge.catalog();
        catalog
            .identifiers()
            .into_iter()
            .filter_map(|identifier| {
                let info = catalog.info(&identifier)?.clone();
                let state = catalog.state(&identifier).cloned().unwrap_or_default();
                Some(ModelSummary {
                    identifier,
                    info,
                    state,
                })
            })
            .collect()
    }

    /// Full registry refresh. Models missing upstream are dropped.
    pub async fn sync(&self) -> Result<CatalogDiff, EngineError> {
        let models = self.engine.update_registry().await.map_err(|e| {
            tracing::warn!(error = %e, "Registry refresh failed");
            e
        })?;
        let diff = self.bridge.replace_catalog(models).await;
        tracing::info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            retained = diff.retained.len(),
            "Catalog synchronized"
        );
        Ok(diff)
    }

    /// [`Self::sync`] returning the refreshed listing
    pub async fn update_registry(&self) -> Result<Vec<ModelSummary>, EngineError> {
        self.sync().await?;
        Ok(self.models())
    }

    // ------------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------------

    pub fn download_handle(&self, identifier: &str) -> DownloadHandle {
        DownloadHandle::new(identifier.to_string(), self.engine.clone(), self.bridge.clone())
    }

    /// Start a download and wait for it to finish
    pub async fn download_model(&self, identifier: &str) -> DownloadResult<ProgressUpdate> {
        self.download_handle(identifier).start_and_wait().await
    }

    pub fn pause(&self, identifier: &str) {
        self.download_handle(identifier).pause();
    }

    pub fn resume(&self, identifier: &str) {
        self.download_handle(identifier).resume();
    }

    pub fn stop(&self, identifier: &str) {
        self.download_handle(identifier).stop();
    }

    pub fn delete(&self, identifier: &str) {
        self.download_handle(identifier).delete();
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Create a session for a catalogued model, loading it when a config is given.
    ///
    /// Checked in order: license, catalog membership, model kind, local
    /// materialization. The engine is only reached once all of them pass.
    pub fn create_session(
        &self,
        model: &ModelRef,
        config: Option<SessionConfig>,
    ) -> SessionResult<Arc<Session>> {
        if let Some(err) = LicenseError::from_status(self.license_status()) {
            tracing::warn!(identifier = %model.identifier(), status = %self.license_status(), "Session rejected by license gate");
            return Err(err.into());
        }

        let identifier = model.identifier();
        let catalog = self.bridge.catalog();
        let info = catalog
            .info(identifier)
            .ok_or_else(|| SessionError::ModelNotFound(identifier.to_string()))?;

        if info.kind != model.kind() {
            return Err(SessionError::UnexpectedModelType {
                identifier: identifier.to_string(),
                expected: model.kind(),
                actual: info.kind,
            });
        }

        if info.kind == ModelKind::Local
            && !catalog.state(identifier).is_some_and(ModelDownloadState::is_downloaded)
        {
            return Err(SessionError::NotDownloaded(identifier.to_string()));
        }

        let native = self
            .engine
            .create_session(model)
            .map_err(SessionError::EngineUnavailable)?;
        let session = Arc::new(Session::new(identifier, info.kind, native));
        tracing::info!(identifier, kind = %info.kind, "Session created");

        if let Some(config) = config {
            session.load(config)?;
        }
        Ok(session)
    }
}
