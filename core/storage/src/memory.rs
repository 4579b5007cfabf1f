//! In-memory store adapter.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

use lodestar_common::{ActionName, ChangeKind, DocChange, DocData, Error, ModulePath, Result};

use crate::backend::{
    AggregateHandler, Backend, CountHandler, FetchHandler, FetchOutcome, FetchResponse,
    FetchedDoc, ReadRequest, RevertHandler, RevertRequest, WriteHandler, WriteOutcome,
    WriteRequest,
};
use crate::document::{as_object, assign, deep_merge, delete_props, number_at, prop_paths};
use crate::local::LocalStore;

/// Snapshots kept per document for reverts.
const REVERT_DEPTH: usize = 32;

/// In-memory store adapter.
///
/// Serves as the local authoritative copy (`LocalStore`) and as the cache
/// backend in execution orders. All data is held in memory and lost on
/// drop. Every write remembers the document's previous state so a later
/// failure elsewhere can be reverted.
pub struct MemoryStore {
    name: String,
    /// Collection key -> doc id -> document.
    docs: RwLock<BTreeMap<String, BTreeMap<String, DocData>>>,
    /// Doc key -> previous states, most recent last.
    journal: Mutex<HashMap<String, VecDeque<Option<DocData>>>>,
}

impl MemoryStore {
    /// Create an empty store registered as "cache".
    pub fn new() -> Self {
        Self::named("cache")
    }

    /// Create an empty store with a custom backend name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: RwLock::new(BTreeMap::new()),
            journal: Mutex::new(HashMap::new()),
        }
    }

    /// Total number of documents across all collections.
    pub fn len(&self) -> usize {
        self.docs.read().values().map(|c| c.len()).sum()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Documents with a write still waiting to be committed or reverted.
    pub fn journal_len(&self) -> usize {
        self.journal.lock().len()
    }

    fn remember(&self, doc_key: String, before: Option<DocData>) {
        let mut journal = self.journal.lock();
        let history = journal.entry(doc_key).or_default();
        if history.len() == REVERT_DEPTH {
            history.pop_front();
        }
        history.push_back(before);
    }

    fn forget_latest(&self, doc_key: &str) -> Option<Option<DocData>> {
        let mut journal = self.journal.lock();
        let history = journal.get_mut(doc_key)?;
        let before = history.pop_back();
        if history.is_empty() {
            journal.remove(doc_key);
        }
        before
    }

    fn docs_for(&self, collection: &ModulePath, doc_id: Option<&str>) -> Vec<FetchedDoc> {
        let docs = self.docs.read();
        let Some(coll) = docs.get(&collection.as_key()) else {
            return Vec::new();
        };
        match doc_id {
            Some(id) => coll
                .get(id)
                .map(|data| vec![FetchedDoc::new(id, data.clone())])
                .unwrap_or_default(),
            None => coll
                .iter()
                .map(|(id, data)| FetchedDoc::new(id.clone(), data.clone()))
                .collect(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryStore {
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

    fn reverter(&self) -> Option<&dyn RevertHandler> {
        Some(self)
    }
}

#[async_trait]
impl WriteHandler for MemoryStore {
    async fn write(&self, req: WriteRequest<'_>) -> Result<WriteOutcome> {
        let (id, generated) = match req.doc_id {
            Some(id) => (id.to_string(), false),
            None if req.action == ActionName::Insert => (Uuid::new_v4().to_string(), true),
            None => {
                return Err(Error::InvalidTargetKind(format!(
                    "{} requires a document id in {}",
                    req.action, req.collection
                )))
            }
        };

        // Validate before touching anything.
        let body = match req.action {
            ActionName::DeleteProp | ActionName::Delete => None,
            _ => Some(as_object(req.payload)?),
        };
        let props = if req.action == ActionName::DeleteProp {
            prop_paths(req.payload)?
        } else {
            Vec::new()
        };

        let before = {
            let mut docs = self.docs.write();
            let coll = docs.entry(req.collection.as_key()).or_default();
            let before = coll.get(&id).cloned();

            match (req.action, body) {
                (ActionName::Insert | ActionName::Replace, Some(body)) => {
                    coll.insert(id.clone(), body);
                }
                (ActionName::Merge, Some(body)) => {
                    deep_merge(coll.entry(id.clone()).or_default(), &body);
                }
                (ActionName::Assign, Some(body)) => {
                    assign(coll.entry(id.clone()).or_default(), &body);
                }
                (ActionName::DeleteProp, _) => {
                    if let Some(doc) = coll.get_mut(&id) {
                        delete_props(doc, &props);
                    }
                }
                (ActionName::Delete, _) => {
                    coll.remove(&id);
                }
                (other, _) => {
                    return Err(Error::InvalidInput(format!("{} is not a write action", other)));
                }
            }
            before
        };

        let doc_key = req.collection.join(&id)?.as_key();
        debug!("{} applied {} to {}", self.name, req.action, doc_key);
        self.remember(doc_key, before);

        Ok(if generated {
            WriteOutcome::Inserted { id }
        } else {
            WriteOutcome::Done
        })
    }
}

#[async_trait]
impl RevertHandler for MemoryStore {
    async fn revert(&self, req: RevertRequest<'_>) -> Result<()> {
        let Some(id) = req.doc_id else {
            return Ok(());
        };
        let path = req.collection.join(id)?;
        match self.forget_latest(&path.as_key()) {
            Some(before) => {
                debug!("{} reverting {} on {}", self.name, req.action, path);
                self.restore(&path, before);
            }
            None => {
                debug!("{} has nothing to revert for {}", self.name, path);
            }
        }
        Ok(())
    }

    fn commit(&self, collection: &ModulePath, doc_id: &str) {
        if let Ok(path) = collection.join(doc_id) {
            self.forget_latest(&path.as_key());
        }
    }
}

#[async_trait]
impl FetchHandler for MemoryStore {
    async fn fetch(&self, req: ReadRequest<'_>) -> Result<FetchOutcome> {
        Ok(FetchOutcome::Response(FetchResponse {
            docs: self.docs_for(req.collection, req.doc_id),
            reached_end: Some(true),
            cursor: None,
        }))
    }
}

#[async_trait]
impl CountHandler for MemoryStore {
    async fn fetch_count(&self, req: ReadRequest<'_>) -> Result<u64> {
        Ok(self.docs_for(req.collection, req.doc_id).len() as u64)
    }
}

#[async_trait]
impl AggregateHandler for MemoryStore {
    /// Answers `{"sum": [..fields], "average": [..fields]}`.
    async fn fetch_aggregate(&self, req: ReadRequest<'_>) -> Result<DocData> {
        let docs = self.docs_for(req.collection, req.doc_id);
        let mut result = Map::new();

        for (op, average) in [("sum", false), ("average", true)] {
            let Some(fields) = req.payload.get(op) else {
                continue;
            };
            let fields = prop_paths(fields)?;
            let mut out = Map::new();
            for field in fields {
                let values: Vec<f64> = docs.iter().filter_map(|d| number_at(&d.data, &field)).collect();
                let total: f64 = values.iter().sum();
                let value = if average {
                    if values.is_empty() {
                        0.0
                    } else {
                        total / values.len() as f64
                    }
                } else {
                    total
                };
                out.insert(field, Value::from(value));
            }
            result.insert(op.to_string(), Value::Object(out));
        }

        Ok(result)
    }
}

impl LocalStore for MemoryStore {
    fn doc(&self, path: &ModulePath) -> Option<DocData> {
        let id = path.doc_id()?;
        self.docs
            .read()
            .get(&path.collection_path().as_key())
            .and_then(|coll| coll.get(id).cloned())
    }

    fn collection(&self, path: &ModulePath) -> BTreeMap<String, DocData> {
        self.docs
            .read()
            .get(&path.as_key())
            .cloned()
            .unwrap_or_default()
    }

    fn apply(&self, collection: &ModulePath, change: DocChange) {
        let mut docs = self.docs.write();
        let coll = docs.entry(collection.as_key()).or_default();
        match (change.kind, change.data) {
            (ChangeKind::Added | ChangeKind::Modified, Some(data)) => {
                coll.insert(change.id, data);
            }
            (ChangeKind::Removed, _) => {
                coll.remove(&change.id);
            }
            (kind, None) => {
                debug!("{} ignoring {:?} for {} without data", self.name, kind, change.id);
            }
        }
    }

    fn restore(&self, path: &ModulePath, snapshot: Option<DocData>) {
        let Some(id) = path.doc_id() else {
            return;
        };
        let mut docs = self.docs.write();
        let coll = docs.entry(path.collection_path().as_key()).or_default();
        match snapshot {
            Some(data) => {
                coll.insert(id.to_string(), data);
            }
            None => {
                coll.remove(id);
            }
        }
    }
}
