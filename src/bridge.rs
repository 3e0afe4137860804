//! Event bridge between engine callbacks and observable state
//!
//! The engine calls handlers from threads it owns. Each callback is turned into
//! a unit of work and queued to a single owning task, which is the only writer
//! of the license status and catalog snapshots. Consumers read snapshots from
//! `watch` channels and never see a half-applied callback.
//!
//! The queue is unbounded and FIFO, so events of one kind are applied in the
//! order the engine delivered them. Nothing is ever rejected: a state for an
//! unknown identifier is inserted.

use crate::engine::{CatalogHandler, LicenseStatusHandler, ModelStateHandler};
use crate::license::LicenseStatus;
use crate::models::{Catalog, CatalogDiff, ModelDownloadState, ModelSummary};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Work queued onto the owning task
enum BridgeEvent {
    License(LicenseStatus),
    ModelState {
        identifier: String,
        state: ModelDownloadState,
    },
    Catalog(Vec<ModelSummary>),
    ReplaceCatalog {
        models: Vec<ModelSummary>,
        reply: oneshot::Sender<CatalogDiff>,
    },
    Subscribe {
        identifier: String,
        subscriber: Subscriber,
    },
    Flush(oneshot::Sender<()>),
}

impl BridgeEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::License(_) => "license",
            Self::ModelState { .. } => "model_state",
            Self::Catalog(_) => "catalog",
            Self::ReplaceCatalog { .. } => "catalog_sync",
            Self::Subscribe { .. } => "subscribe",
            Self::Flush(_) => "flush",
        }
    }
}

/// Receiving side of one per-identifier state subscription
struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<ModelDownloadState>,
}

type Subscribers = Arc<DashMap<String, Vec<Subscriber>>>;

/// Handler object registered with the engine.
///
/// Cheap to clone. Every callback is forwarded to the owning task.
#[derive(Clone)]
pub struct EventBridge {
    tx: mpsc::UnboundedSender<BridgeEvent>,
    license: watch::Receiver<LicenseStatus>,
    catalog: watch::Receiver<Catalog>,
    subscribers: Subscribers,
    next_subscriber: Arc<AtomicU64>,
}

impl EventBridge {
    /// Create the bridge and spawn its owning task on the current runtime.
    ///
    /// The task stops when `shutdown` is cancelled or every bridge clone is dropped.
    pub fn spawn(initial: Catalog, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (license_tx, license_rx) = watch::channel(LicenseStatus::default());
        let (catalog_tx, catalog_rx) = watch::channel(initial);
        let subscribers: Subscribers = Arc::new(DashMap::new());

        let owner = BridgeOwner {
            license: license_tx,
            catalog: catalog_tx,
            subscribers: subscribers.clone(),
        };
        tokio::spawn(owner.run(rx, shutdown));

        Self {
            tx,
            license: license_rx,
            catalog: catalog_rx,
            subscribers,
            next_subscriber: Arc::new(AtomicU64::new(1)),
        }
    }

    fn post(&self, event: BridgeEvent) {
        let kind = event.kind();
        crate::metrics::record_bridged_event(kind);
        if self.tx.send(event).is_err() {
            tracing::debug!(kind, "Event bridge stopped, event discarded");
        }
    }

    /// Wait until every event queued before this call has been applied
    pub async fn flush(&self) {
        let (reply, done) = oneshot::channel();
        self.post(BridgeEvent::Flush(reply));
        let _ = done.await;
    }

    /// Replace the catalog with a full listing and report what changed
    pub async fn replace_catalog(&self, models: Vec<ModelSummary>) -> CatalogDiff {
        let (reply, diff) = oneshot::channel();
        self.post(BridgeEvent::ReplaceCatalog { models, reply });
        diff.await.unwrap_or_default()
    }

    /// Subscribe to state changes of one model.
    ///
    /// The current state is delivered first, then every later state event for
    /// the identifier. Both happen on the owning task, so no event falls
    /// between the replay and the live feed. The channel closes after a
    /// terminal state is received, or right after a replayed `Downloaded`.
    pub fn subscribe_state(&self, identifier: &str) -> StateSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.post(BridgeEvent::Subscribe {
            identifier: identifier.to_string(),
            subscriber: Subscriber { id, tx },
        });
        StateSubscription {
            identifier: identifier.to_string(),
            id,
            rx,
            subscribers: self.subscribers.clone(),
        }
    }

    pub fn license_status(&self) -> LicenseStatus {
        *self.license.borrow()
    }

    pub fn watch_license(&self) -> watch::Receiver<LicenseStatus> {
        self.license.clone()
    }

    pub fn catalog(&self) -> Catalog {
        self.catalog.borrow().clone()
    }

    pub fn state(&self, identifier: &str) -> Option<ModelDownloadState> {
        self.catalog.borrow().state(identifier).cloned()
    }

    pub fn watch_catalog(&self) -> watch::Receiver<Catalog> {
        self.catalog.clone()
    }

    /// Live subscriptions for an identifier
    pub fn subscriber_count(&self, identifier: &str) -> usize {
        self.subscribers
            .get(identifier)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl LicenseStatusHandler for EventBridge {
    fn on_status(&self, status: LicenseStatus) {
        self.post(BridgeEvent::License(status));
    }
}

impl ModelStateHandler for EventBridge {
    fn on_state(&self, identifier: &str, state: ModelDownloadState) {
        self.post(BridgeEvent::ModelState {
            identifier: identifier.to_string(),
            state,
        });
    }
}

impl CatalogHandler for EventBridge {
    fn on_catalog(&self, models: Vec<ModelSummary>) {
        self.post(BridgeEvent::Catalog(models));
    }
}

/// Consumer side of [`EventBridge::subscribe_state`].
///
/// Dropping it deregisters from the bridge. The download itself is unaffected.
pub struct StateSubscription {
    identifier: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<ModelDownloadState>,
    subscribers: Subscribers,
}

impl StateSubscription {
    pub async fn recv(&mut self) -> Option<ModelDownloadState> {
        self.rx.recv().await
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        if let Some(mut subs) = self.subscribers.get_mut(&self.identifier) {
            subs.retain(|s| s.id != self.id);
        }
        self.subscribers
            .remove_if(&self.identifier, |_, subs| subs.is_empty());
        tracing::trace!(identifier = %self.identifier, subscriber = self.id, "State subscription dropped");
    }
}

// ============================================================================
// Owning task
// ============================================================================

/// Sole writer of the observable state
struct BridgeOwner {
    license: watch::Sender<LicenseStatus>,
    catalog: watch::Sender<Catalog>,
    subscribers: Subscribers,
}

impl BridgeOwner {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<BridgeEvent>, shutdown: CancellationToken) {
        tracing::debug!("Event bridge started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }
        self.subscribers.clear();
        tracing::debug!("Event bridge stopped");
    }

    fn handle(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::License(status) => {
                let previous = self.license.send_replace(status);
                if previous != status {
                    tracing::info!(from = %previous, to = %status, "License status changed");
                }
            }
            BridgeEvent::ModelState { identifier, state } => {
                tracing::debug!(identifier = %identifier, state = ?state, "Model state changed");
                self.catalog.send_modify(|catalog| {
                    catalog.apply_state(&identifier, state.clone());
                });
                self.dispatch(&identifier, &state);
            }
            BridgeEvent::Catalog(models) => {
                tracing::debug!(count = models.len(), "Catalog update");
                self.catalog.send_modify(|catalog| catalog.upsert(models));
                crate::metrics::update_catalog_size(self.catalog.borrow().len());
            }
            BridgeEvent::ReplaceCatalog { models, reply } => {
                let mut diff = CatalogDiff::default();
                self.catalog.send_modify(|catalog| diff = catalog.replace(models));
                tracing::info!(
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    retained = diff.retained.len(),
                    "Catalog synchronized"
                );
                crate::metrics::update_catalog_size(self.catalog.borrow().len());
                let _ = reply.send(diff);
            }
            BridgeEvent::Subscribe {
                identifier,
                subscriber,
            } => self.subscribe(identifier, subscriber),
            BridgeEvent::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn subscribe(&self, identifier: String, subscriber: Subscriber) {
        if subscriber.tx.is_closed() {
            return;
        }

        // First handle request for an unknown model creates its default state
        self.catalog.send_if_modified(|catalog| {
            if catalog.state(&identifier).is_some() {
                return false;
            }
            catalog.state_or_default(&identifier);
            true
        });
        let current = self
            .catalog
            .borrow()
            .state(&identifier)
            .cloned()
            .unwrap_or_default();

        // A stored error belongs to an earlier attempt, so only a downloaded
        // replay ends the subscription
        if subscriber.tx.send(current.clone()).is_err() || current.is_downloaded() {
            return;
        }
        tracing::trace!(identifier = %identifier, subscriber = subscriber.id, "State subscription added");
        self.subscribers
            .entry(identifier)
            .or_default()
            .push(subscriber);
    }

    fn dispatch(&self, identifier: &str, state: &ModelDownloadState) {
        let terminal = state.is_terminal();
        if let Some(mut subs) = self.subscribers.get_mut(identifier) {
            subs.retain(|s| s.tx.send(state.clone()).is_ok() && !terminal);
        }
        self.subscribers
            .remove_if(identifier, |_, subs| subs.is_empty());
    }
}
