//! Model management module
//!
//! Provides:
//! - Download lifecycle state and progress projections
//! - The catalog of known models and its reconciliation rules
//! - Per-model download handles

pub mod catalog;
pub mod download;
pub mod state;

pub use catalog::{Catalog, CatalogDiff, ModelInfo, ModelKind, ModelRef, ModelSummary};
pub use download::{DownloadHandle, ProgressStream};
pub use state::{DownloadPhase, ModelDownloadState, ProgressUpdate};
