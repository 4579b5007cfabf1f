//! Shared fixtures: a scriptable remote backend and engine setup.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use lodestar_common::{ChangeKind, DocChange, DocData, Error, ModulePath, Result};
use lodestar_storage::{
    AggregateHandler, Backend, CountHandler, DocSink, FetchHandler, FetchOutcome, FetchResponse,
    FetchedDoc, LocalStore, MemoryStore, ReadRequest, RevertHandler, RevertRequest, StreamHandle,
    StreamHandler, StreamRequest, StreamSink, WriteHandler, WriteOutcome, WriteRequest,
};
use lodestar_sync::{EventKind, HookSet, SyncConfig, SyncEngine};

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().clone()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn doc(value: Value) -> DocData {
    value.as_object().cloned().unwrap_or_default()
}

/// Hooks that record every lifecycle event as `backend:event`.
pub fn recording_hooks(log: &Log) -> HookSet {
    let mut hooks = HookSet::new();
    for (kind, label) in [
        (EventKind::Before, "before"),
        (EventKind::Success, "success"),
        (EventKind::Error, "error"),
        (EventKind::Revert, "revert"),
    ] {
        let log = log.clone();
        hooks = hooks.on(kind, move |ctx| {
            log.lock().push(format!("{}:{}", ctx.backend, label));
        });
    }
    hooks
}

pub fn as_backend<B: Backend + 'static>(backend: &Arc<B>) -> Arc<dyn Backend> {
    backend.clone()
}

/// Engine with a "cache" local store plus `backends`.
pub fn engine(config: SyncConfig, backends: Vec<Arc<dyn Backend>>) -> (SyncEngine, Arc<MemoryStore>) {
    init_tracing();
    let cache = Arc::new(MemoryStore::new());
    let mut builder = SyncEngine::builder().local_store(cache.clone()).config(config);
    for backend in backends {
        builder = builder.backend(backend);
    }
    (builder.build().expect("engine builds"), cache)
}

/// A remote backend backed by its own memory store, with scriptable
/// latency and failures.
pub struct MockRemote {
    name: String,
    store: MemoryStore,
    delay: Duration,
    fail_writes: bool,
    fail_on_key: Option<String>,
    fail_reads: bool,
    fail_revert: bool,
    count: Option<u64>,
    aggregate: Option<DocData>,
    missing: Vec<String>,
    deferred: Option<Log>,
    revert_log: Log,
    timeline: Log,
    pub payloads: Mutex<Vec<Value>>,
    pub fetches: AtomicUsize,
    sink: Mutex<Option<StreamSink>>,
    stream_ends: Mutex<Vec<oneshot::Sender<Result<()>>>>,
    pub stream_stopped: Arc<AtomicBool>,
}

impl MockRemote {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            store: MemoryStore::named(name),
            delay: Duration::ZERO,
            fail_writes: false,
            fail_on_key: None,
            fail_reads: false,
            fail_revert: false,
            count: None,
            aggregate: None,
            missing: Vec::new(),
            deferred: None,
            revert_log: log(),
            timeline: log(),
            payloads: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            sink: Mutex::new(None),
            stream_ends: Mutex::new(Vec::new()),
            stream_stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    /// Fail every write whose payload has `key` at the top level.
    pub fn failing_writes_with(mut self, key: &str) -> Self {
        self.fail_on_key = Some(key.to_string());
        self
    }

    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    pub fn failing_revert(mut self) -> Self {
        self.fail_revert = true;
        self
    }

    pub fn count(mut self, n: u64) -> Self {
        self.count = Some(n);
        self
    }

    pub fn aggregate(mut self, result: Value) -> Self {
        self.aggregate = Some(doc(result));
        self
    }

    /// Report `id` as not existing on every fetch.
    pub fn missing(mut self, id: &str) -> Self {
        self.missing.push(id.to_string());
        self
    }

    /// Answer fetches with a sink recording every id later backends return.
    pub fn deferring(mut self, seen: &Log) -> Self {
        self.deferred = Some(seen.clone());
        self
    }

    pub fn revert_log(mut self, log: &Log) -> Self {
        self.revert_log = log.clone();
        self
    }

    pub fn timeline(mut self, log: &Log) -> Self {
        self.timeline = log.clone();
        self
    }

    /// Put a document into the remote's own state.
    pub fn seed(&self, collection: &str, id: &str, data: Value) {
        let collection = ModulePath::parse(collection).expect("valid collection");
        self.store.apply(&collection, DocChange::added(id, doc(data)));
    }

    pub fn journal_len(&self) -> usize {
        self.store.journal_len()
    }

    pub fn stored(&self, path: &str) -> Option<DocData> {
        self.store.doc(&ModulePath::parse(path).expect("valid path"))
    }

    pub fn push(&self, kind: ChangeKind, id: &str, data: Value) {
        if let Some(sink) = self.sink.lock().as_ref() {
            match kind {
                ChangeKind::Removed => sink.removed(id),
                ChangeKind::Added => sink.added(id, doc(data)),
                ChangeKind::Modified => sink.modified(id, doc(data)),
            }
        }
    }

    /// Finish every open stream with `result`.
    pub fn end_streams(&self, result: Result<()>) {
        for end in self.stream_ends.lock().drain(..) {
            let _ = end.send(result.clone());
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn offline(&self) -> Error {
        Error::Backend(format!("{} offline", self.name))
    }

    async fn latency(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

impl Backend for MockRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn writer(&self) -> Option<&dyn WriteHandler> {
        Some(self)
    }

    fn fetcher(&self) -> Option<&dyn FetchHandler> {
        Some(self)
    }

    fn counter(&self) -> Option<&dyn CountHandler> {
        Some(self)
    }

    fn aggregator(&self) -> Option<&dyn AggregateHandler> {
        Some(self)
    }

    fn streamer(&self) -> Option<&dyn StreamHandler> {
        Some(self)
    }

    fn reverter(&self) -> Option<&dyn RevertHandler> {
        Some(self)
    }
}

#[async_trait]
impl WriteHandler for MockRemote {
    async fn write(&self, req: WriteRequest<'_>) -> Result<WriteOutcome> {
        self.timeline
            .lock()
            .push(format!("{}:{}", self.name, req.action));
        self.payloads.lock().push(req.payload.clone());
        self.latency().await;
        let rejected = self
            .fail_on_key
            .as_deref()
            .is_some_and(|key| req.payload.get(key).is_some());
        if self.fail_writes || rejected {
            return Err(self.offline());
        }
        WriteHandler::write(&self.store, req).await
    }
}

#[async_trait]
impl RevertHandler for MockRemote {
    async fn revert(&self, req: RevertRequest<'_>) -> Result<()> {
        self.revert_log.lock().push(self.name.clone());
        if self.fail_revert {
            return Err(Error::Backend(format!("{} cannot revert", self.name)));
        }
        RevertHandler::revert(&self.store, req).await
    }

    fn commit(&self, collection: &ModulePath, doc_id: &str) {
        RevertHandler::commit(&self.store, collection, doc_id);
    }
}

#[async_trait]
impl FetchHandler for MockRemote {
    async fn fetch(&self, req: ReadRequest<'_>) -> Result<FetchOutcome> {
        self.timeline.lock().push(format!("{}:fetch", self.name));
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.latency().await;
        if self.fail_reads {
            return Err(self.offline());
        }
        if let Some(seen) = &self.deferred {
            let seen = seen.clone();
            let sink: DocSink = Arc::new(move |doc: &FetchedDoc| seen.lock().push(doc.id.clone()));
            return Ok(FetchOutcome::Deferred(sink));
        }
        let mut response = match FetchHandler::fetch(&self.store, req).await? {
            FetchOutcome::Response(response) => response,
            FetchOutcome::Deferred(_) => FetchResponse::default(),
        };
        response
            .docs
            .extend(self.missing.iter().map(|id| FetchedDoc::missing(id.clone())));
        Ok(FetchOutcome::Response(response))
    }
}

#[async_trait]
impl CountHandler for MockRemote {
    async fn fetch_count(&self, req: ReadRequest<'_>) -> Result<u64> {
        self.latency().await;
        if self.fail_reads {
            return Err(self.offline());
        }
        match self.count {
            Some(n) => Ok(n),
            None => CountHandler::fetch_count(&self.store, req).await,
        }
    }
}

#[async_trait]
impl AggregateHandler for MockRemote {
    async fn fetch_aggregate(&self, req: ReadRequest<'_>) -> Result<DocData> {
        self.latency().await;
        match &self.aggregate {
            Some(result) => Ok(result.clone()),
            None => AggregateHandler::fetch_aggregate(&self.store, req).await,
        }
    }
}

#[async_trait]
impl StreamHandler for MockRemote {
    async fn stream(&self, req: StreamRequest<'_>) -> Result<StreamHandle> {
        if self.fail_reads {
            return Err(self.offline());
        }
        *self.sink.lock() = Some(req.sink.clone());
        let (end, ended) = oneshot::channel();
        self.stream_ends.lock().push(end);
        let stopped = self.stream_stopped.clone();
        Ok(StreamHandle::new(
            Box::new(move || stopped.store(true, Ordering::SeqCst)),
            Box::pin(async move { ended.await.unwrap_or(Ok(())) }),
        ))
    }
}
