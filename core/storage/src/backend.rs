//! Backend adapter contract.
//!
//! A backend is a named adapter that exposes an optional handler per
//! action family. The engine only ever talks to backends through these
//! traits; concrete adapters (a local cache, a remote document database)
//! own their state exclusively.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use lodestar_common::{ActionName, DocChange, DocData, Error, ModulePath, Result};

/// Arguments handed to a write handler.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
    /// One of insert, merge, assign, replace, deleteProp, delete.
    pub action: ActionName,
    /// Payload after hooks and per-backend splitting.
    pub payload: &'a Value,
    /// Collection the document lives in.
    pub collection: &'a ModulePath,
    /// Target document; `None` only for an insert that needs an id.
    pub doc_id: Option<&'a str>,
    /// Options configured for this backend on the module.
    pub options: &'a Value,
}

/// Result of a write handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Applied; nothing to report.
    Done,
    /// Insert without id: the backend generated this one.
    Inserted { id: String },
}

/// Arguments handed to fetch, count and aggregate handlers.
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest<'a> {
    pub action: ActionName,
    pub payload: &'a Value,
    pub collection: &'a ModulePath,
    /// Set for document-scoped reads.
    pub doc_id: Option<&'a str>,
    pub options: &'a Value,
    /// Whether the caller demanded a round-trip.
    pub force: bool,
}

/// One document in a fetch response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedDoc {
    pub id: String,
    pub data: DocData,
    /// `false` when the backend confirms the document does not exist.
    pub exists: bool,
}

impl FetchedDoc {
    pub fn new(id: impl Into<String>, data: DocData) -> Self {
        Self {
            id: id.into(),
            data,
            exists: true,
        }
    }

    pub fn missing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: DocData::new(),
            exists: false,
        }
    }
}

/// A completed fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub docs: Vec<FetchedDoc>,
    pub reached_end: Option<bool>,
    pub cursor: Option<Value>,
}

/// Callback run once per document fetched by later backends.
pub type DocSink = Arc<dyn Fn(&FetchedDoc) + Send + Sync>;

/// Result of a fetch handler.
pub enum FetchOutcome {
    /// The backend answered with documents.
    Response(FetchResponse),
    /// The backend does not answer itself but wants to observe every
    /// document later backends produce.
    Deferred(DocSink),
}

impl fmt::Debug for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response(resp) => f.debug_tuple("Response").field(resp).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Receiver of pushed changes; implemented by the engine.
pub trait ChangeSink: Send + Sync {
    fn push(&self, change: DocChange);
}

/// Handle a streaming backend uses to report changes.
///
/// Cheap to clone; calls are synchronous and never block on the engine.
#[derive(Clone)]
pub struct StreamSink {
    target: Arc<dyn ChangeSink>,
}

impl StreamSink {
    pub fn new(target: Arc<dyn ChangeSink>) -> Self {
        Self { target }
    }

    pub fn added(&self, id: impl Into<String>, data: DocData) {
        self.target.push(DocChange::added(id, data));
    }

    pub fn modified(&self, id: impl Into<String>, data: DocData) {
        self.target.push(DocChange::modified(id, data));
    }

    pub fn removed(&self, id: impl Into<String>) {
        self.target.push(DocChange::removed(id));
    }

    pub fn push(&self, change: DocChange) {
        self.target.push(change);
    }
}

impl fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamSink")
    }
}

/// Arguments handed to a stream handler.
#[derive(Debug, Clone)]
pub struct StreamRequest<'a> {
    pub payload: &'a Value,
    pub collection: &'a ModulePath,
    pub doc_id: Option<&'a str>,
    pub options: &'a Value,
    pub sink: StreamSink,
}

/// A running backend subscription.
pub struct StreamHandle {
    stop: Box<dyn FnOnce() + Send>,
    streaming: BoxFuture<'static, Result<()>>,
}

impl StreamHandle {
    /// `stop` detaches the subscription; `streaming` resolves once the
    /// backend considers the stream finished.
    pub fn new(stop: Box<dyn FnOnce() + Send>, streaming: BoxFuture<'static, Result<()>>) -> Self {
        Self { stop, streaming }
    }

    pub fn into_parts(self) -> (Box<dyn FnOnce() + Send>, BoxFuture<'static, Result<()>>) {
        (self.stop, self.streaming)
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamHandle")
    }
}

/// Arguments handed to a revert handler.
#[derive(Debug, Clone, Copy)]
pub struct RevertRequest<'a> {
    /// Payload the backend originally received.
    pub payload: &'a Value,
    pub action: ActionName,
    /// The failure that triggered the revert.
    pub error: &'a Error,
    pub collection: &'a ModulePath,
    pub doc_id: Option<&'a str>,
    pub options: &'a Value,
}

#[async_trait]
pub trait WriteHandler: Send + Sync {
    /// Apply a write action.
    ///
    /// # Postconditions
    /// - For an insert without `doc_id`, returns `Inserted` with the id used
    ///
    /// # Errors
    /// - Any adapter failure; the engine applies the caller's error policy
    async fn write(&self, req: WriteRequest<'_>) -> Result<WriteOutcome>;
}

#[async_trait]
pub trait FetchHandler: Send + Sync {
    async fn fetch(&self, req: ReadRequest<'_>) -> Result<FetchOutcome>;
}

#[async_trait]
pub trait CountHandler: Send + Sync {
    async fn fetch_count(&self, req: ReadRequest<'_>) -> Result<u64>;
}

#[async_trait]
pub trait AggregateHandler: Send + Sync {
    async fn fetch_aggregate(&self, req: ReadRequest<'_>) -> Result<DocData>;
}

#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Open a subscription that reports through `req.sink`.
    async fn stream(&self, req: StreamRequest<'_>) -> Result<StreamHandle>;
}

#[async_trait]
pub trait RevertHandler: Send + Sync {
    /// Undo the effect of an earlier successful write.
    async fn revert(&self, req: RevertRequest<'_>) -> Result<()>;

    /// The write this backend applied to `doc_id` in `collection` stands
    /// and will not be reverted. Drop whatever was kept to undo it.
    fn commit(&self, _collection: &ModulePath, _doc_id: &str) {}
}

/// A named store adapter.
///
/// Every capability is optional: a backend returning `None` for an action
/// family is skipped when that family runs.
pub trait Backend: Send + Sync {
    /// Name used in execution orders (e.g., "cache", "remote").
    fn name(&self) -> &str;

    fn writer(&self) -> Option<&dyn WriteHandler> {
        None
    }

    fn fetcher(&self) -> Option<&dyn FetchHandler> {
        None
    }

    fn counter(&self) -> Option<&dyn CountHandler> {
        None
    }

    fn aggregator(&self) -> Option<&dyn AggregateHandler> {
        None
    }

    fn streamer(&self) -> Option<&dyn StreamHandler> {
        None
    }

    fn reverter(&self) -> Option<&dyn RevertHandler> {
        None
    }
}
