//! Error types surfaced to callers
//!
//! Native engine errors are carried through as [`EngineError`] without
//! reinterpretation. The event bridge has no error type: it accepts every
//! well-formed event.

use crate::license::LicenseStatus;
use crate::models::ModelKind;
use serde::{Deserialize, Serialize};

/// Category of a native engine failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    License,
    ModelNotFound,
    /// Weights missing, incompatible hardware or unsupported platform
    Unavailable,
    Download,
    Network,
    Generation,
    Internal,
}

/// Error reported by the native engine, passed through unmodified
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// License activation failures and license-gated rejections
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LicenseError {
    #[error("License not activated, please check your API key")]
    NotActivated,
    #[error("The API key was rejected")]
    InvalidApiKey,
    #[error("Payment is required to use this license")]
    PaymentRequired,
    #[error("License server unreachable ({0})")]
    Network(LicenseStatus),
    #[error("License signature does not match")]
    SignatureMismatch,
    #[error("Activation failed: {0}")]
    Engine(#[from] EngineError),
}

impl LicenseError {
    /// Map a non-usable status to the error a gated operation reports.
    /// Returns `None` for usable statuses.
    pub fn from_status(status: LicenseStatus) -> Option<Self> {
        match status {
            LicenseStatus::Activated | LicenseStatus::GracePeriodActive => None,
            LicenseStatus::NotActivated => Some(Self::NotActivated),
            LicenseStatus::InvalidApiKey => Some(Self::InvalidApiKey),
            LicenseStatus::PaymentRequired => Some(Self::PaymentRequired),
            LicenseStatus::NetworkError | LicenseStatus::HttpError | LicenseStatus::Timeout => {
                Some(Self::Network(status))
            }
            LicenseStatus::SignatureMismatch => Some(Self::SignatureMismatch),
        }
    }
}

/// Download command and progress failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    License(#[from] LicenseError),
    #[error("Download of '{identifier}' failed: {message}")]
    Failed { identifier: String, message: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Progress for '{0}' ended before the download finished")]
    Interrupted(String),
}

/// Session creation, load and run failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    License(#[from] LicenseError),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    #[error("Unexpected model type for '{identifier}': expected {expected}, found {actual}")]
    UnexpectedModelType {
        identifier: String,
        expected: ModelKind,
        actual: ModelKind,
    },
    #[error("Model '{0}' is not downloaded")]
    NotDownloaded(String),
    #[error("Session is already loaded with a different configuration")]
    AlreadyLoaded,
    #[error("Session is not loaded")]
    NotLoaded,
    #[error("Session is busy")]
    Busy,
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(EngineError),
    #[error("Session failed to load and must be recreated")]
    Unusable,
    #[error(transparent)]
    Engine(EngineError),
    #[error("Generation task aborted: {0}")]
    Aborted(String),
}

pub type DownloadResult<T> = Result<T, DownloadError>;
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_license_error_from_status() {
        assert_eq!(LicenseError::from_status(LicenseStatus::Activated), None);
        assert_eq!(
            LicenseError::from_status(LicenseStatus::GracePeriodActive),
            None
        );
        assert_eq!(
            LicenseError::from_status(LicenseStatus::InvalidApiKey),
            Some(LicenseError::InvalidApiKey)
        );
        assert_eq!(
            LicenseError::from_status(LicenseStatus::Timeout),
            Some(LicenseError::Network(LicenseStatus::Timeout))
        );
    }

    #[test]
    fn test_engine_error_passthrough_message() {
        let err = EngineError::new(EngineErrorKind::Unavailable, "weights missing");
        assert_eq!(err.to_string(), "weights missing");

        let err = SessionError::Engine(err);
        assert_eq!(err.to_string(), "weights missing");
    }

    #[test]
    fn test_user_facing_messages() {
        assert_eq!(
            LicenseError::NotActivated.to_string(),
            "License not activated, please check your API key"
        );
        assert_eq!(
            SessionError::ModelNotFound("m1".to_string()).to_string(),
            "Model not found: m1"
        );
        let err = SessionError::UnexpectedModelType {
            identifier: "m1".to_string(),
            expected: ModelKind::Local,
            actual: ModelKind::Cloud,
        };
        assert!(err.to_string().contains("expected local, found cloud"));
    }
}
