//! Session controller: one loaded model, one generation at a time

use super::config::{RunConfig, SessionConfig};
use super::io::{Input, Output};
use super::stream::{GenerationEvent, GenerationStream};
use crate::engine::NativeSession;
use crate::error::{SessionError, SessionResult};
use crate::models::ModelKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a session.
///
/// `Unloaded -> Loading -> Ready <-> Generating`. A failed load moves to
/// `Failed` and the session has to be recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Unloaded,
    Loading,
    Ready,
    Generating,
    Failed,
}

/// Session statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub loaded_at: Option<DateTime<Utc>>,
    pub runs: u64,
    pub cancelled_runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

struct SessionInner {
    phase: SessionPhase,
    config: Option<SessionConfig>,
    stats: SessionStats,
}

/// A loaded, runnable model instance
pub struct Session {
    identifier: String,
    kind: ModelKind,
    native: Box<dyn NativeSession>,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identifier", &self.identifier)
            .field("kind", &self.kind)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Returns the session to `Ready` when a run ends, including by panic
struct RunGuard<'a> {
    session: &'a Session,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.session.release();
    }
}

impl Session {
    pub fn new(identifier: impl Into<String>, kind: ModelKind, native: Box<dyn NativeSession>) -> Self {
        Self {
            identifier: identifier.into(),
            kind,
            native,
            inner: Mutex::new(SessionInner {
                phase: SessionPhase::Unloaded,
                config: None,
                stats: SessionStats::default(),
            }),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.lock().phase
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self.phase(),
            SessionPhase::Loading | SessionPhase::Generating
        )
    }

    pub fn config(&self) -> Option<SessionConfig> {
        self.inner.lock().config.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.lock().stats.clone()
    }

    /// Load the model with `config`.
    ///
    /// Loading again with the active configuration is a no-op. A different
    /// configuration fails with [`SessionError::AlreadyLoaded`].
    pub fn load(&self, config: SessionConfig) -> SessionResult<()> {
        {
            let mut inner = self.inner.lock();
            match inner.phase {
                SessionPhase::Unloaded => inner.phase = SessionPhase::Loading,
                SessionPhase::Ready if inner.config.as_ref() == Some(&config) => return Ok(()),
                SessionPhase::Ready => return Err(SessionError::AlreadyLoaded),
                SessionPhase::Loading | SessionPhase::Generating => return Err(SessionError::Busy),
                SessionPhase::Failed => return Err(SessionError::Unusable),
            }
        }

        tracing::debug!(identifier = %self.identifier, config = ?config, "Loading session");
        let result = self.native.load(&config);

        let mut inner = self.inner.lock();
        match result {
            Ok(()) => {
                inner.phase = SessionPhase::Ready;
                inner.config = Some(config);
                inner.stats.loaded_at = Some(Utc::now());
                tracing::info!(identifier = %self.identifier, "Session loaded");
                Ok(())
            }
            Err(e) => {
                inner.phase = SessionPhase::Failed;
                tracing::warn!(identifier = %self.identifier, error = %e, "Session failed to load");
                Err(SessionError::EngineUnavailable(e))
            }
        }
    }

    /// Blocking generation.
    ///
    /// `on_partial` receives the cumulative output and returns `false` to stop
    /// early. Only one run may be in flight; a concurrent call fails with
    /// [`SessionError::Busy`].
    pub fn run<F>(&self, input: &Input, config: &RunConfig, mut on_partial: F) -> SessionResult<Output>
    where
        F: FnMut(&Output) -> bool,
    {
        self.run_with_cancel(input, config, &CancellationToken::new(), &mut on_partial)
    }

    /// Blocking generation that stops at the next partial once `cancel` fires
    pub fn run_with_cancel(
        &self,
        input: &Input,
        config: &RunConfig,
        cancel: &CancellationToken,
        on_partial: &mut dyn FnMut(&Output) -> bool,
    ) -> SessionResult<Output> {
        self.acquire()?;
        let _guard = RunGuard { session: self };
        self.execute(input, config, cancel, on_partial)
    }

    /// Run on the blocking pool and await the final output.
    ///
    /// Cancelling `cancel`, or dropping the returned future, makes the next
    /// partial callback return `false`. A cancelled run still resolves to the
    /// engine's final output, with `FinishReason::Cancelled`.
    pub async fn run_async<F>(
        self: &Arc<Self>,
        input: Input,
        config: RunConfig,
        cancel: CancellationToken,
        mut on_partial: F,
    ) -> SessionResult<Output>
    where
        F: FnMut(&Output) -> bool + Send + 'static,
    {
        self.acquire()?;
        let drop_guard = cancel.clone().drop_guard();

        let session = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _guard = RunGuard { session: &session };
            session.execute(&input, &config, &token, &mut on_partial)
        });

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                if e.is_cancelled() {
                    // The closure never ran, so its guard never released the session
                    self.release();
                }
                Err(SessionError::Aborted(e.to_string()))
            }
        };
        drop_guard.disarm();
        result
    }

    /// Stream partial outputs followed by the final result.
    ///
    /// Busy and not-loaded errors are returned immediately. Dropping the
    /// stream cancels the generation cooperatively. Must be called from
    /// within a Tokio runtime.
    pub fn stream(self: &Arc<Self>, input: Input, config: RunConfig) -> SessionResult<GenerationStream> {
        self.acquire()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let session = Arc::clone(self);
        let token = cancel.clone();
        tokio::task::spawn_blocking(move || {
            // Released before the final event, so a consumer that sees it can run again
            let result = {
                let _guard = RunGuard { session: &session };
                let mut forward = |partial: &Output| {
                    tx.send(GenerationEvent::Partial(partial.clone())).is_ok()
                };
                session.execute(&input, &config, &token, &mut forward)
            };
            let _ = tx.send(GenerationEvent::Finished(result));
        });

        Ok(GenerationStream::new(rx, cancel))
    }

    /// Mark the session busy, failing if it cannot run right now
    fn acquire(&self) -> SessionResult<()> {
        let mut inner = self.inner.lock();
        match inner.phase {
            SessionPhase::Ready => {
                inner.phase = SessionPhase::Generating;
                inner.stats.runs += 1;
                inner.stats.last_run_at = Some(Utc::now());
                Ok(())
            }
            SessionPhase::Generating | SessionPhase::Loading => Err(SessionError::Busy),
            SessionPhase::Unloaded => Err(SessionError::NotLoaded),
            SessionPhase::Failed => Err(SessionError::Unusable),
        }
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.phase == SessionPhase::Generating {
            inner.phase = SessionPhase::Ready;
        }
    }

    fn execute(
        &self,
        input: &Input,
        config: &RunConfig,
        cancel: &CancellationToken,
        on_partial: &mut dyn FnMut(&Output) -> bool,
    ) -> SessionResult<Output> {
        crate::metrics::record_run_started(&self.identifier);
        tracing::debug!(identifier = %self.identifier, tokens_limit = config.tokens_limit, "Run started");

        let mut checkpoint = |partial: &Output| {
            // Cancellation wins over whatever the caller's callback would say
            if cancel.is_cancelled() {
                return false;
            }
            on_partial(partial)
        };
        let result = self.native.run(input, config, &mut checkpoint);

        match &result {
            Ok(output) if output.was_cancelled() => {
                self.inner.lock().stats.cancelled_runs += 1;
                crate::metrics::record_run_cancelled(&self.identifier);
                tracing::info!(identifier = %self.identifier, "Run stopped early");
            }
            Ok(output) => {
                tracing::debug!(
                    identifier = %self.identifier,
                    tokens = output.stats.tokens_count_output,
                    finish_reason = ?output.finish_reason,
                    "Run finished"
                );
            }
            Err(e) => {
                tracing::warn!(identifier = %self.identifier, error = %e, "Run failed");
            }
        }

        result.map_err(SessionError::Engine)
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
