//! Download lifecycle state for a single model
//!
//! Byte counts are the source of truth. Fractional progress is always derived
//! from them and never stored.

use serde::{Deserialize, Serialize};

/// Local materialization state of a model, as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelDownloadState {
    /// Nothing on disk yet. Total size is known once the registry reports it.
    NotDownloaded { total_bytes: Option<u64> },
    Downloading { downloaded_bytes: u64, total_bytes: u64 },
    Paused { downloaded_bytes: u64, total_bytes: u64 },
    Downloaded { total_bytes: u64 },
    /// Download is running elsewhere or a precondition is not met
    Locked,
    Error { message: String },
}

/// Coarse phase of a download, without byte counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPhase {
    NotDownloaded,
    Downloading,
    Paused,
    Downloaded,
    Locked,
    Error,
}

impl std::fmt::Display for DownloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDownloaded => write!(f, "not_downloaded"),
            Self::Downloading => write!(f, "downloading"),
            Self::Paused => write!(f, "paused"),
            Self::Downloaded => write!(f, "downloaded"),
            Self::Locked => write!(f, "locked"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl Default for ModelDownloadState {
    fn default() -> Self {
        Self::NotDownloaded { total_bytes: None }
    }
}

impl ModelDownloadState {
    pub fn not_downloaded(total_bytes: Option<u64>) -> Self {
        Self::NotDownloaded { total_bytes }
    }

    pub fn downloading(downloaded_bytes: u64, total_bytes: u64) -> Self {
        Self::Downloading {
            downloaded_bytes,
            total_bytes,
        }
    }

    pub fn paused(downloaded_bytes: u64, total_bytes: u64) -> Self {
        Self::Paused {
            downloaded_bytes,
            total_bytes,
        }
    }

    pub fn downloaded(total_bytes: u64) -> Self {
        Self::Downloaded { total_bytes }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Replace the current state with the engine-reported one.
    ///
    /// The reported state always wins; nothing from the previous state is
    /// carried over.
    pub fn apply(&mut self, event: ModelDownloadState) -> &ModelDownloadState {
        *self = event;
        self
    }

    pub fn phase(&self) -> DownloadPhase {
        match self {
            Self::NotDownloaded { .. } => DownloadPhase::NotDownloaded,
            Self::Downloading { .. } => DownloadPhase::Downloading,
            Self::Paused { .. } => DownloadPhase::Paused,
            Self::Downloaded { .. } => DownloadPhase::Downloaded,
            Self::Locked => DownloadPhase::Locked,
            Self::Error { .. } => DownloadPhase::Error,
        }
    }

    /// Completed fraction in `[0, 1]`. Zero when the total is unknown or zero.
    pub fn progress(&self) -> f64 {
        match self {
            Self::Downloading {
                downloaded_bytes,
                total_bytes,
            }
            | Self::Paused {
                downloaded_bytes,
                total_bytes,
            } => fraction(*downloaded_bytes, *total_bytes),
            Self::Downloaded { .. } => 1.0,
            _ => 0.0,
        }
    }

    /// Bytes on disk, never above the total
    pub fn downloaded_bytes(&self) -> u64 {
        match self {
            Self::Downloading {
                downloaded_bytes,
                total_bytes,
            }
            | Self::Paused {
                downloaded_bytes,
                total_bytes,
            } => (*downloaded_bytes).min(*total_bytes),
            Self::Downloaded { total_bytes } => *total_bytes,
            _ => 0,
        }
    }

    pub fn total_bytes(&self) -> Option<u64> {
        match self {
            Self::NotDownloaded { total_bytes } => *total_bytes,
            Self::Downloading { total_bytes, .. }
            | Self::Paused { total_bytes, .. }
            | Self::Downloaded { total_bytes } => Some(*total_bytes),
            Self::Locked | Self::Error { .. } => None,
        }
    }

    pub fn is_downloading(&self) -> bool {
        matches!(self, Self::Downloading { .. })
    }

    pub fn is_downloaded(&self) -> bool {
        matches!(self, Self::Downloaded { .. })
    }

    /// A progress sequence ends once one of these is observed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Downloaded { .. } | Self::Error { .. })
    }
}

fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64).clamp(0.0, 1.0)
}

/// Point-in-time snapshot of a download, as yielded by progress sequences
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub completed_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    pub progress: f64,
}

impl From<&ModelDownloadState> for ProgressUpdate {
    fn from(state: &ModelDownloadState) -> Self {
        Self {
            completed_bytes: state.downloaded_bytes(),
            total_bytes: state.total_bytes(),
            progress: state.progress(),
        }
    }
}
