//! Streaming view of a generation running on the blocking pool

use super::io::Output;
use crate::error::{SessionError, SessionResult};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

/// One step of a streamed generation
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// Cumulative output so far
    Partial(Output),
    /// Authoritative final result. Always the last event.
    Finished(SessionResult<Output>),
}

/// Partial outputs of an in-flight run, then its final result.
///
/// Dropping the stream cancels the run at its next partial callback.
#[derive(Debug)]
pub struct GenerationStream {
    inner: UnboundedReceiverStream<GenerationEvent>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl GenerationStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<GenerationEvent>, cancel: CancellationToken) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            _guard: cancel.clone().drop_guard(),
            cancel,
        }
    }

    /// Request a cooperative stop. The stream still delivers the final result.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Skip partials and wait for the final result
    pub async fn finish(mut self) -> SessionResult<Output> {
        use futures::StreamExt;

        while let Some(event) = self.next().await {
            if let GenerationEvent::Finished(result) = event {
                return result;
            }
        }
        Err(SessionError::Aborted(
            "generation ended without a final result".to_string(),
        ))
    }
}

impl Stream for GenerationStream {
    type Item = GenerationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
