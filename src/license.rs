//! License status reported by the engine

use serde::{Deserialize, Serialize};

/// Activation state of the engine license
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    #[default]
    NotActivated,
    Activated,
    GracePeriodActive,
    InvalidApiKey,
    PaymentRequired,
    NetworkError,
    HttpError,
    SignatureMismatch,
    Timeout,
}

impl LicenseStatus {
    /// Whether gated operations (sessions, downloads) may proceed
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Activated | Self::GracePeriodActive)
    }
}

impl std::fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotActivated => write!(f, "not_activated"),
            Self::Activated => write!(f, "activated"),
            Self::GracePeriodActive => write!(f, "grace_period_active"),
            Self::InvalidApiKey => write!(f, "invalid_api_key"),
            Self::PaymentRequired => write!(f, "payment_required"),
            Self::NetworkError => write!(f, "network_error"),
            Self::HttpError => write!(f, "http_error"),
            Self::SignatureMismatch => write!(f, "signature_mismatch"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}
