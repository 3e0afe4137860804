//! Capability surface of the native inference engine
//!
//! The engine owns activation, download transport and model execution. This
//! layer only sees it through these traits, so production bindings and the
//! in-memory [`sim::SimulatedEngine`] are interchangeable.

pub mod sim;

use crate::error::EngineError;
use crate::license::LicenseStatus;
use crate::models::{ModelDownloadState, ModelRef, ModelSummary};
use crate::session::{Input, Output, RunConfig, SessionConfig};
use async_trait::async_trait;
use std::sync::Arc;

// ============================================================================
// Push handlers
// ============================================================================

/// Receives license status changes. May be invoked from any thread.
pub trait LicenseStatusHandler: Send + Sync {
    fn on_status(&self, status: LicenseStatus);
}

/// Receives per-model download state transitions. May be invoked from any thread.
pub trait ModelStateHandler: Send + Sync {
    fn on_state(&self, identifier: &str, state: ModelDownloadState);
}

/// Receives incremental catalog updates. May be invoked from any thread.
pub trait CatalogHandler: Send + Sync {
    fn on_catalog(&self, models: Vec<ModelSummary>);
}

// ============================================================================
// Engine and session
// ============================================================================

/// Commands and queries exposed by the native engine
#[async_trait]
pub trait NativeEngine: Send + Sync {
    /// Activate the license. The new status is also pushed to the license handler.
    async fn activate(&self, api_key: &str) -> Result<LicenseStatus, EngineError>;

    /// Handlers stay registered for the lifetime of the engine
    fn register_license_status_handler(&self, handler: Arc<dyn LicenseStatusHandler>);
    fn register_model_state_handler(&self, handler: Arc<dyn ModelStateHandler>);
    fn register_catalog_handler(&self, handler: Arc<dyn CatalogHandler>);

    /// Current registry listing
    fn models(&self) -> Vec<ModelSummary>;

    /// Refresh the registry from upstream and return the new listing
    async fn update_registry(&self) -> Result<Vec<ModelSummary>, EngineError>;

    /// Start or continue a download. Progress is observed through the state handler.
    fn download(&self, identifier: &str) -> Result<(), EngineError>;
    fn pause(&self, identifier: &str);
    fn resume(&self, identifier: &str);
    fn stop(&self, identifier: &str);
    fn delete(&self, identifier: &str);

    fn create_session(&self, model: &ModelRef) -> Result<Box<dyn NativeSession>, EngineError>;
}

/// One model instance inside the engine
pub trait NativeSession: Send + Sync {
    fn load(&self, config: &SessionConfig) -> Result<(), EngineError>;

    /// Blocking generation call.
    ///
    /// `on_partial` is called synchronously with the cumulative output so far;
    /// returning `false` asks the engine to stop early.
    fn run(
        &self,
        input: &Input,
        config: &RunConfig,
        on_partial: &mut dyn FnMut(&Output) -> bool,
    ) -> Result<Output, EngineError>;
}
