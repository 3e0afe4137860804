//! Per-model download handle
//!
//! Commands go straight to the engine and return immediately. Their effect is
//! only visible through the progress sequence, which is fed by the event
//! bridge.

use super::state::{ModelDownloadState, ProgressUpdate};
use crate::bridge::{EventBridge, StateSubscription};
use crate::engine::NativeEngine;
use crate::error::{DownloadError, DownloadResult, LicenseError};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Progress sequence of one download.
///
/// Yields the current state first, then every later change. Ends after the
/// 100% update once the model is downloaded, or with an error item if the
/// engine reports a failure. A paused download keeps the sequence open, and so
/// does a replayed error from an earlier attempt.
pub type ProgressStream = BoxStream<'static, DownloadResult<ProgressUpdate>>;

/// Caller-facing controller for one model's resumable download
#[derive(Clone)]
pub struct DownloadHandle {
    identifier: String,
    engine: Arc<dyn NativeEngine>,
    bridge: EventBridge,
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl DownloadHandle {
    pub(crate) fn new(identifier: String, engine: Arc<dyn NativeEngine>, bridge: EventBridge) -> Self {
        Self {
            identifier,
            engine,
            bridge,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Last state applied by the bridge
    pub fn state(&self) -> ModelDownloadState {
        self.bridge.state(&self.identifier).unwrap_or_default()
    }

    /// Start the download.
    ///
    /// No-op while already downloading or once downloaded; in the latter case
    /// the progress sequence completes on its first item.
    pub fn start(&self) -> DownloadResult<()> {
        if let Some(err) = LicenseError::from_status(self.bridge.license_status()) {
            return Err(err.into());
        }

        let state = self.state();
        if state.is_downloading() || state.is_downloaded() {
            tracing::debug!(identifier = %self.identifier, phase = %state.phase(), "Download already started");
            return Ok(());
        }

        self.engine.download(&self.identifier)?;
        crate::metrics::record_download_started(&self.identifier);
        tracing::info!(identifier = %self.identifier, "Download started");
        Ok(())
    }

    pub fn pause(&self) {
        tracing::debug!(identifier = %self.identifier, "Pausing download");
        self.engine.pause(&self.identifier);
    }

    pub fn resume(&self) {
        tracing::debug!(identifier = %self.identifier, "Resuming download");
        self.engine.resume(&self.identifier);
    }

    pub fn stop(&self) {
        tracing::debug!(identifier = %self.identifier, "Stopping download");
        self.engine.stop(&self.identifier);
    }

    pub fn delete(&self) {
        tracing::info!(identifier = %self.identifier, "Deleting model files");
        self.engine.delete(&self.identifier);
    }

    /// Lazily subscribed progress sequence.
    ///
    /// Nothing is registered with the bridge until the stream is first polled.
    /// Dropping the stream deregisters it without touching the download.
    pub fn progress(&self) -> ProgressStream {
        let bridge = self.bridge.clone();
        let identifier = self.identifier.clone();

        async_stream::stream! {
            let mut subscription = bridge.subscribe_state(&identifier);
            let mut replay = true;
            while let Some(state) = subscription.recv().await {
                let replayed = std::mem::replace(&mut replay, false);
                if let ModelDownloadState::Error { message } = &state {
                    if replayed {
                        // Left over from an earlier attempt; a retry may still succeed
                        tracing::debug!(identifier = %identifier, error = %message, "Replaying previous download error");
                        yield Ok(ProgressUpdate::from(&state));
                        continue;
                    }
                    tracing::warn!(identifier = %identifier, error = %message, "Download failed");
                    yield Err(DownloadError::Failed {
                        identifier: identifier.clone(),
                        message: message.clone(),
                    });
                    break;
                }

                let done = state.is_downloaded();
                yield Ok(ProgressUpdate::from(&state));
                if done {
                    tracing::info!(identifier = %identifier, "Download complete");
                    break;
                }
            }
        }
        .boxed()
    }

    /// Fraction-only view of [`Self::progress`], for consumers that only draw a bar
    pub fn progress_fractions(&self) -> BoxStream<'static, DownloadResult<f64>> {
        self.progress()
            .map(|update| update.map(|u| u.progress))
            .boxed()
    }

    /// Wait for the download to reach a terminal state.
    ///
    /// An error left over from an earlier attempt does not count; only a
    /// failure reported after this call ends the wait with an error.
    pub async fn wait(&self) -> DownloadResult<ProgressUpdate> {
        self.wait_on(self.bridge.subscribe_state(&self.identifier)).await
    }

    /// Start the download and wait for it.
    ///
    /// Subscribes before issuing the command, so a failure of this attempt is
    /// never mistaken for a replay of an earlier one.
    pub async fn start_and_wait(&self) -> DownloadResult<ProgressUpdate> {
        let subscription = self.bridge.subscribe_state(&self.identifier);
        self.start()?;
        self.wait_on(subscription).await
    }

    async fn wait_on(&self, mut subscription: StateSubscription) -> DownloadResult<ProgressUpdate> {
        let mut replay = true;
        while let Some(state) = subscription.recv().await {
            let replayed = std::mem::replace(&mut replay, false);
            match state {
                ModelDownloadState::Downloaded { .. } => return Ok(ProgressUpdate::from(&state)),
                ModelDownloadState::Error { message } if !replayed => {
                    return Err(DownloadError::Failed {
                        identifier: self.identifier.clone(),
                        message,
                    });
                }
                _ => {}
            }
        }
        Err(DownloadError::Interrupted(self.identifier.clone()))
    }
}
