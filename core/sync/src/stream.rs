//! Streaming: coalesced commits of pushed changes and the subscription
//! registry.
//!
//! Backends push changes synchronously through a [`StreamSink`]. Changes
//! are buffered per document id (last one wins) and committed to the
//! local store only while the collection is not write-locked, so a
//! notification that predates an optimistic write is superseded rather
//! than applied over it.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use lodestar_common::{ActionName, ChangeKind, DocChange, Error, ModulePath, Result};
use lodestar_storage::{ChangeSink, LocalStore, StreamRequest, StreamSink};

use crate::config::{Effective, OnError};
use crate::engine::{EngineInner, Invocation};
use crate::hooks::{EventContext, EventKind, HookSet, ResponseMeta};
use crate::lock::WriteLockManager;

/// Buffered changes, one per document id, in first-seen order.
#[derive(Debug, Default)]
struct PendingChanges {
    order: VecDeque<String>,
    changes: HashMap<String, DocChange>,
}

impl PendingChanges {
    fn merge(&mut self, change: DocChange) {
        if !self.changes.contains_key(&change.id) {
            self.order.push_back(change.id.clone());
        }
        self.changes.insert(change.id.clone(), change);
    }

    fn take(&mut self) -> Vec<DocChange> {
        let changes = &mut self.changes;
        self.order
            .drain(..)
            .filter_map(|id| changes.remove(&id))
            .collect()
    }

    fn len(&self) -> usize {
        self.changes.len()
    }

    fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.changes.clear();
    }
}

#[derive(Debug, Default)]
struct CoalescerState {
    pending: PendingChanges,
    draining: bool,
    stopped: bool,
}

/// Buffers pushed changes for one subscription and commits them once
/// the collection's write lock is released.
pub(crate) struct StreamCoalescer {
    collection: ModulePath,
    local: Arc<dyn LocalStore>,
    locks: WriteLockManager,
    hooks: HookSet,
    state: Mutex<CoalescerState>,
}

impl StreamCoalescer {
    pub fn new(
        collection: ModulePath,
        local: Arc<dyn LocalStore>,
        locks: WriteLockManager,
        hooks: HookSet,
    ) -> Arc<Self> {
        Arc::new(Self {
            collection,
            local,
            locks,
            hooks,
            state: Mutex::new(CoalescerState::default()),
        })
    }

    /// Buffer a change and make sure a drain is running.
    pub fn push(self: &Arc<Self>, change: DocChange) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                trace!("Dropping change to {} after stop", change.id);
                return;
            }
            state.pending.merge(change);
            if state.draining {
                return;
            }
            state.draining = true;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let this = self.clone();
                handle.spawn(async move { this.drain().await });
            }
            Err(_) => {
                warn!("Stream change for {} pushed outside a runtime; left buffered", self.collection);
                self.state.lock().draining = false;
            }
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            self.locks.await_if_locked(&self.collection).await;

            let batch = {
                let mut state = self.state.lock();
                if state.stopped {
                    state.pending.clear();
                    state.draining = false;
                    return;
                }
                if state.pending.is_empty() {
                    state.draining = false;
                    return;
                }
                // A write may have started since the wait resolved.
                if self.locks.is_locked(&self.collection) {
                    None
                } else {
                    Some(state.pending.take())
                }
            };
            let Some(batch) = batch else {
                continue;
            };

            trace!("Committing {} streamed change(s) to {}", batch.len(), self.collection);
            for change in batch {
                if self.state.lock().stopped {
                    return;
                }
                self.commit(change);
            }
        }
    }

    fn commit(&self, change: DocChange) {
        let meta = ResponseMeta {
            id: &change.id,
            collection: &self.collection,
        };
        match change.kind {
            ChangeKind::Added | ChangeKind::Modified => {
                let Some(data) = change.data.clone() else {
                    return;
                };
                match self.hooks.apply_response(change.kind, data, &meta) {
                    Some(data) => self.local.apply(
                        &self.collection,
                        DocChange {
                            kind: change.kind,
                            id: change.id.clone(),
                            data: Some(data),
                        },
                    ),
                    None => debug!("Streamed {} discarded by response hook", change.id),
                }
            }
            ChangeKind::Removed => {
                let known = self
                    .collection
                    .join(&change.id)
                    .ok()
                    .and_then(|path| self.local.doc(&path))
                    .unwrap_or_default();
                if self
                    .hooks
                    .apply_response(ChangeKind::Removed, known, &meta)
                    .is_some()
                {
                    self.local
                        .apply(&self.collection, DocChange::removed(change.id.clone()));
                } else {
                    debug!("Streamed removal of {} discarded by response hook", change.id);
                }
            }
        }
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.pending.clear();
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

struct CoalescerSink(Arc<StreamCoalescer>);

impl ChangeSink for CoalescerSink {
    fn push(&self, change: DocChange) {
        self.0.push(change);
    }
}

type StopFn = Box<dyn FnOnce() + Send>;

struct SubscriptionInner {
    id: Uuid,
    path: ModulePath,
    key: String,
    coalescer: Arc<StreamCoalescer>,
    stops: Mutex<Vec<StopFn>>,
    stop_signal: watch::Sender<bool>,
    finished: Shared<BoxFuture<'static, Result<()>>>,
}

/// An open stream on a collection or document. Cheap to clone; every
/// clone controls the same subscription.
#[derive(Clone)]
pub struct StreamSubscription {
    inner: Arc<SubscriptionInner>,
}

impl StreamSubscription {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn path(&self) -> &ModulePath {
        &self.inner.path
    }

    /// Close every backend subscription. Buffered changes are discarded.
    pub fn stop(&self) {
        self.inner.coalescer.stop();
        let stops = std::mem::take(&mut *self.inner.stops.lock());
        if !stops.is_empty() {
            debug!("Closing stream on {}", self.inner.path);
        }
        for stop in stops {
            stop();
        }
        self.inner.stop_signal.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop_signal.borrow()
    }

    /// Resolves when every backend stream has finished or the
    /// subscription is stopped; rejects if a backend stream fails.
    pub async fn finished(&self) -> Result<()> {
        self.inner.finished.clone().await
    }

    /// Changes received but not yet committed.
    pub fn pending(&self) -> usize {
        self.inner.coalescer.pending()
    }
}

impl fmt::Debug for StreamSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("key", &self.inner.key)
            .finish()
    }
}

/// Open subscriptions keyed by path and payload. Cheap to clone.
#[derive(Clone, Default)]
pub(crate) struct StreamRegistry {
    open: Arc<Mutex<HashMap<(ModulePath, String), StreamSubscription>>>,
}

impl StreamRegistry {
    pub fn get(&self, path: &ModulePath, key: &str) -> Option<StreamSubscription> {
        self.open.lock().get(&(path.clone(), key.to_string())).cloned()
    }

    /// Register `sub`, or return the one that got there first.
    fn insert_or_existing(&self, sub: StreamSubscription) -> StreamSubscription {
        let mut open = self.open.lock();
        let key = (sub.inner.path.clone(), sub.inner.key.clone());
        open.entry(key).or_insert(sub).clone()
    }

    fn remove(&self, sub: &StreamSubscription) {
        let mut open = self.open.lock();
        let key = (sub.inner.path.clone(), sub.inner.key.clone());
        if matches!(open.get(&key), Some(existing) if existing.id() == sub.id()) {
            open.remove(&key);
        }
    }

    /// Stop and forget the subscription opened with `payload`.
    pub fn close(&self, path: &ModulePath, payload: &serde_json::Value) -> Result<bool> {
        let key = (path.clone(), serde_json::to_string(payload)?);
        let removed = self.open.lock().remove(&key);
        Ok(match removed {
            Some(sub) => {
                sub.stop();
                true
            }
            None => false,
        })
    }

    /// Stop and forget every subscription on `path`.
    pub fn close_all(&self, path: &ModulePath) -> usize {
        let closed: Vec<StreamSubscription> = {
            let mut open = self.open.lock();
            let keys: Vec<(ModulePath, String)> =
                open.keys().filter(|(p, _)| p == path).cloned().collect();
            keys.iter().filter_map(|key| open.remove(key)).collect()
        };
        for sub in &closed {
            sub.stop();
        }
        closed.len()
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }
}

/// Open a stream on `inv.path`, or return the open one with the same
/// payload.
pub(crate) async fn dispatch_stream(
    engine: &Arc<EngineInner>,
    inv: Invocation,
) -> Result<StreamSubscription> {
    let action = ActionName::Stream;
    let path = inv.path.clone();
    let key = serde_json::to_string(&inv.payload)?;
    if let Some(existing) = engine.streams.get(&path, &key) {
        debug!("Reusing open stream on {}", path);
        return Ok(existing);
    }

    let eff = Effective::resolve(action, &engine.config, &inv.module, &inv.config)?;
    let backends = engine.registry.resolve_order(&eff.order)?;
    let collection = path.collection_path();
    let payload = eff.hooks.apply_payload(action, inv.payload, path.doc_id());

    let coalescer = StreamCoalescer::new(
        collection.clone(),
        engine.local.clone(),
        engine.locks.clone(),
        eff.hooks.clone(),
    );
    let sink = StreamSink::new(Arc::new(CoalescerSink(coalescer.clone())));

    let mut stops: Vec<StopFn> = Vec::new();
    let mut streamings: Vec<BoxFuture<'static, Result<()>>> = Vec::new();

    for backend in &backends {
        let name = backend.name();
        let Some(streamer) = backend.streamer() else {
            continue;
        };

        let aborted = eff
            .hooks
            .emit(&EventContext::new(EventKind::Before, name, action, &path, &payload));
        if aborted {
            break;
        }

        let options = eff.options_for(name);
        let result = streamer
            .stream(StreamRequest {
                payload: &payload,
                collection: &collection,
                doc_id: path.doc_id(),
                options: &options,
                sink: sink.clone(),
            })
            .await;

        match result {
            Ok(handle) => {
                debug!("Backend '{}' streaming {}", name, path);
                let (stop, streaming) = handle.into_parts();
                stops.push(stop);
                let backend_name = name.to_string();
                streamings.push(
                    streaming
                        .map(move |r| r.map_err(|err| Error::backend_failed(backend_name, action, err)))
                        .boxed(),
                );
                let aborted = eff
                    .hooks
                    .emit(&EventContext::new(EventKind::Success, name, action, &path, &payload));
                if aborted {
                    break;
                }
            }
            Err(err) => {
                eff.hooks.emit(
                    &EventContext::new(EventKind::Error, name, action, &path, &payload)
                        .with_error(&err),
                );
                let failure = Error::backend_failed(name, action, err);
                if eff.on_error == OnError::Continue {
                    warn!("{}; continuing", failure);
                    continue;
                }
                warn!("{}; closing already opened streams", failure);
                coalescer.stop();
                for stop in stops {
                    stop();
                }
                return Err(failure);
            }
        }
    }

    let (stop_signal, mut stopped) = watch::channel(false);
    let on_error = eff.on_error;
    let finished: BoxFuture<'static, Result<()>> = Box::pin(async move {
        let all = async move {
            if on_error == OnError::Continue {
                for result in futures::future::join_all(streamings).await {
                    if let Err(err) = result {
                        warn!("{}; continuing", err);
                    }
                }
                Ok(())
            } else {
                futures::future::try_join_all(streamings).await.map(|_| ())
            }
        };
        let signal = async move {
            while !*stopped.borrow_and_update() {
                if stopped.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            result = all => result,
            _ = signal => Ok(()),
        }
    });

    let subscription = StreamSubscription {
        inner: Arc::new(SubscriptionInner {
            id: Uuid::new_v4(),
            path,
            key,
            coalescer,
            stops: Mutex::new(stops),
            stop_signal,
            finished: finished.shared(),
        }),
    };

    let registered = engine.streams.insert_or_existing(subscription.clone());
    if registered.id() != subscription.id() {
        debug!("Concurrent stream on {} won; closing duplicate", registered.path());
        subscription.stop();
        return Ok(registered);
    }

    let watcher = subscription.clone();
    let streams = engine.streams.clone();
    tokio::spawn(async move {
        if let Err(err) = watcher.finished().await {
            warn!("Stream on {} ended: {}", watcher.path(), err);
        }
        watcher.stop();
        streams.remove(&watcher);
    });

    Ok(subscription)
}
