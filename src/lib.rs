//! Engine Bridge - async runtime layer over a callback-driven inference engine
//!
//! Turns engine push callbacks (license status, download state, catalog
//! updates) into snapshots and pull-based streams owned by a single task, and
//! exposes resumable downloads and cancellable streaming generation sessions.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod license;
pub mod metrics;
pub mod models;
pub mod runtime;
pub mod session;

pub use bridge::{EventBridge, StateSubscription};
pub use config::BridgeConfig;
pub use engine::sim::SimulatedEngine;
pub use engine::{NativeEngine, NativeSession};
pub use error::{
    DownloadError, DownloadResult, EngineError, EngineErrorKind, LicenseError, SessionError,
    SessionResult,
};
pub use license::LicenseStatus;
pub use models::{
    Catalog, CatalogDiff, DownloadHandle, ModelDownloadState, ModelInfo, ModelKind, ModelRef,
    ModelSummary, ProgressUpdate,
};
pub use runtime::Runtime;
pub use session::{
    GenerationEvent, GenerationStream, Input, Output, RunConfig, Session, SessionConfig,
    SessionPhase,
};
