//! Autoupdate orchestrator.
//!
//! Multiplexes many logical subscriptions onto few physical streams:
//!
//! ```text
//! subscribe() --> pending queue --(trailing debounce)--> one Stream per batch
//!                                                             |
//!                     store <-- StoreUpdateService <-- demux --+
//! ```
//!
//! Subscriptions issued within one quiescence window ride the same
//! connection; each incoming delta is matched against the owning
//! subscriptions' full-list-tracked relations to decide which collections
//! need deletion inference before the patch is applied.

pub mod request;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::update::{IdReconciliation, ReconcileScope, StoreUpdateService};
use crate::store::{decode_delta, relation_of_key, Id};
use crate::streaming::service::StreamService;
use crate::streaming::stream::StreamEvent;
use crate::streaming::Stream;

pub use request::{FieldDescriptor, FieldSet, ModelRequest, TrackedRelation};

/// Endpoint name the orchestrator opens its streams against.
pub const AUTOUPDATE_ENDPOINT: &str = "autoupdate";

/// Quiescence window for coalescing concurrently issued subscriptions.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(5);

pub type SubscriptionId = u64;
pub type StreamId = u64;

/// Query parameters merged into every newly opened stream URL.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub position: Option<u64>,
    pub single: Option<u64>,
    pub compress: bool,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            position: None,
            single: None,
            compress: true,
        }
    }
}

impl StreamParams {
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(position) = self.position {
            params.push(("position".to_string(), position.to_string()));
        }
        if let Some(single) = self.single {
            params.push(("single".to_string(), single.to_string()));
        }
        let compress = if self.compress { "1" } else { "0" };
        params.push(("compress".to_string(), compress.to_string()));
        params
    }
}

/// An intention to subscribe, queued until the debounce window flushes.
#[derive(Debug, Clone)]
pub struct PendingSubscription {
    pub id: SubscriptionId,
    pub request: ModelRequest,
    pub description: String,
}

struct ActiveSubscription {
    request: ModelRequest,
    description: String,
    stream_id: StreamId,
    /// Id-list relations this request follows, keyed by wire position.
    relations: HashMap<(String, String), TrackedRelation>,
    /// Most recent reported id set per target collection.
    authoritative: HashMap<String, BTreeSet<Id>>,
}

struct StreamEntry {
    stream: Arc<Stream>,
    subscribers: HashSet<SubscriptionId>,
    #[allow(dead_code)]
    demux: JoinHandle<()>,
}

/// Handle returned to a subscriber. `close()` detaches the subscription and
/// closes its physical stream once the last subscriber is gone; dropping the
/// handle without closing keeps the subscription alive.
pub struct ModelSubscription {
    id: SubscriptionId,
    service: Weak<Inner>,
}

impl ModelSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stop listening. Client-side only; the server notices when the last
    /// subscriber's connection goes away.
    pub fn close(&self) {
        if let Some(inner) = self.service.upgrade() {
            inner.close_subscription(self.id);
        }
    }
}

pub struct SyncService {
    inner: Arc<Inner>,
}

struct Inner {
    stream_service: Arc<StreamService>,
    store_update: Arc<StoreUpdateService>,
    pending: Mutex<Vec<PendingSubscription>>,
    subscriptions: Mutex<HashMap<SubscriptionId, ActiveSubscription>>,
    streams: Mutex<HashMap<StreamId, StreamEntry>>,
    params: Mutex<StreamParams>,
    next_subscription: AtomicU64,
    next_stream: AtomicU64,
    enqueue_tx: mpsc::UnboundedSender<()>,
}

impl SyncService {
    pub fn new(stream_service: Arc<StreamService>, store_update: Arc<StoreUpdateService>) -> Self {
        let (enqueue_tx, enqueue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            stream_service,
            store_update,
            pending: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            params: Mutex::new(StreamParams::default()),
            next_subscription: AtomicU64::new(0),
            next_stream: AtomicU64::new(0),
            enqueue_tx,
        });
        tokio::spawn(run_flusher(Arc::downgrade(&inner), enqueue_rx));
        Self { inner }
    }

    /// Register a subscription and return its handle immediately; the
    /// network round-trip happens after the debounce window flushes.
    pub fn subscribe(&self, request: ModelRequest, description: &str) -> ModelSubscription {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.pending.lock().unwrap().push(PendingSubscription {
            id,
            request,
            description: description.to_string(),
        });
        let _ = self.inner.enqueue_tx.send(());
        ModelSubscription {
            id,
            service: Arc::downgrade(&self.inner),
        }
    }

    /// Replace the query parameters used for newly opened streams.
    pub fn set_params(&self, params: StreamParams) {
        *self.inner.params.lock().unwrap() = params;
    }

    /// Close every physical stream and re-issue all active subscriptions
    /// under their existing ids, so caller-held handles stay valid.
    pub fn reconnect(&self, params: Option<StreamParams>) {
        if let Some(params) = params {
            self.set_params(params);
        }
        self.inner.reissue_all();
    }

    pub fn stream_count(&self) -> usize {
        self.inner.streams.lock().unwrap().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().unwrap().len()
    }
}

impl Inner {
    fn close_subscription(&self, id: SubscriptionId) {
        self.pending.lock().unwrap().retain(|pending| pending.id != id);
        let stream_id = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.remove(&id).map(|sub| sub.stream_id)
        };
        let Some(stream_id) = stream_id else {
            return;
        };

        let mut streams = self.streams.lock().unwrap();
        let Some(entry) = streams.get_mut(&stream_id) else {
            return;
        };
        entry.subscribers.remove(&id);
        if entry.subscribers.is_empty() {
            if let Some(entry) = streams.remove(&stream_id) {
                tracing::debug!(stream_id, "last subscriber gone, closing stream");
                entry.stream.close();
            }
        }
    }

    fn drop_stream(&self, stream_id: StreamId, drop_subscribers: bool) {
        let entry = self.streams.lock().unwrap().remove(&stream_id);
        let Some(entry) = entry else {
            return;
        };
        entry.stream.close();
        if drop_subscribers {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            for id in &entry.subscribers {
                subscriptions.remove(id);
            }
        }
    }

    fn reissue_all(&self) {
        let entries: Vec<StreamEntry> = self
            .streams
            .lock()
            .unwrap()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &entries {
            entry.stream.close();
        }

        let mut reissued: Vec<PendingSubscription> = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .drain()
                .map(|(id, sub)| PendingSubscription {
                    id,
                    request: sub.request,
                    description: sub.description,
                })
                .collect()
        };
        if reissued.is_empty() {
            return;
        }
        reissued.sort_by_key(|pending| pending.id);
        self.pending.lock().unwrap().extend(reissued);
        let _ = self.enqueue_tx.send(());
    }
}

async fn run_flusher(inner: Weak<Inner>, mut enqueued: mpsc::UnboundedReceiver<()>) {
    while enqueued.recv().await.is_some() {
        // trailing debounce: every further enqueue restarts the window
        loop {
            tokio::select! {
                _ = tokio::time::sleep(DEBOUNCE_WINDOW) => break,
                poke = enqueued.recv() => {
                    if poke.is_none() {
                        break;
                    }
                }
            }
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        flush(&inner).await;
    }
}

async fn flush(inner: &Arc<Inner>) {
    let batch: Vec<PendingSubscription> = {
        let mut pending = inner.pending.lock().unwrap();
        pending.drain(..).collect()
    };
    if batch.is_empty() {
        return;
    }

    let requests: Vec<&ModelRequest> = batch.iter().map(|pending| &pending.request).collect();
    let body = match serde_json::to_string(&requests) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "cannot serialize model requests");
            return;
        }
    };
    let params = inner.params.lock().unwrap().to_query();

    let stream = match inner
        .stream_service
        .open(AUTOUPDATE_ENDPOINT, Some(body), &params)
    {
        Ok(stream) => Arc::new(stream),
        Err(e) => {
            tracing::error!(error = %e, "cannot open autoupdate stream");
            return;
        }
    };
    let stream_id = inner.next_stream.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::debug!(stream_id, subscriptions = batch.len(), "opening autoupdate stream");

    let mut subscribers = HashSet::new();
    {
        let mut subscriptions = inner.subscriptions.lock().unwrap();
        for pending in batch {
            tracing::trace!(
                id = pending.id,
                description = %pending.description,
                "subscription active"
            );
            subscribers.insert(pending.id);
            subscriptions.insert(
                pending.id,
                ActiveSubscription {
                    relations: pending.request.list_relations(),
                    request: pending.request,
                    description: pending.description,
                    stream_id,
                    authoritative: HashMap::new(),
                },
            );
        }
    }

    let Some(events) = stream.take_events() else {
        tracing::error!(stream_id, "stream events already taken");
        stream.close();
        return;
    };
    let demux = tokio::spawn(run_demux(Arc::downgrade(inner), stream_id, events));
    inner.streams.lock().unwrap().insert(
        stream_id,
        StreamEntry {
            stream,
            subscribers,
            demux,
        },
    );
}

async fn run_demux(
    inner: Weak<Inner>,
    stream_id: StreamId,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            StreamEvent::Message(value) => handle_message(&inner, stream_id, value).await,
            StreamEvent::Error(err) => {
                tracing::warn!(stream_id, reason = %err.reason, "autoupdate stream gave up");
                inner.drop_stream(stream_id, true);
                return;
            }
            StreamEvent::Closed => {
                tracing::debug!(stream_id, "autoupdate stream closed by server");
                inner.drop_stream(stream_id, false);
                return;
            }
        }
    }
}

async fn handle_message(inner: &Arc<Inner>, stream_id: StreamId, value: Value) {
    let patch = decode_delta(&value);

    let mut changed: HashMap<String, IdReconciliation> = HashMap::new();
    {
        let mut subscriptions = inner.subscriptions.lock().unwrap();
        for (key, field_value) in value.as_object().into_iter().flatten() {
            let Some((owner, field)) = relation_of_key(key) else {
                continue;
            };
            let Some(ids) = id_list(field_value) else {
                continue;
            };
            let relation = (owner.to_string(), field.to_string());
            for subscription in subscriptions
                .values_mut()
                .filter(|sub| sub.stream_id == stream_id)
            {
                let Some(tracked) = subscription.relations.get(&relation) else {
                    continue;
                };
                let previous = subscription
                    .authoritative
                    .insert(tracked.collection.clone(), ids.clone());
                let entry = changed
                    .entry(tracked.collection.clone())
                    .and_modify(|rec| {
                        // an entity must stay in every list that tracks it
                        rec.ids.retain(|id| ids.contains(id));
                    })
                    .or_insert_with(|| {
                        if tracked.full_list {
                            IdReconciliation::full(ids.clone())
                        } else {
                            // partial relation: diff against the set last
                            // reported for it, not the whole collection
                            IdReconciliation::relation(
                                previous.clone().unwrap_or_default(),
                                ids.clone(),
                            )
                        }
                    });
                if tracked.full_list {
                    entry.scope = ReconcileScope::FullCollection;
                }
            }
        }
    }

    if let Err(e) = inner
        .store_update
        .apply(patch, changed, HashMap::new())
        .await
    {
        tracing::error!(stream_id, error = %e, "failed to apply delta");
    }
}

fn id_list(value: &Value) -> Option<BTreeSet<Id>> {
    let array = value.as_array()?;
    let mut ids = BTreeSet::new();
    for entry in array {
        ids.insert(entry.as_u64()?);
    }
    Some(ids)
}
