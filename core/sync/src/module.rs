//! Collection and document references.
//!
//! A reference binds a path to module configuration and exposes the
//! actions valid for its kind of path.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use lodestar_common::{ActionName, DocData, Error, ModulePath, Result};

use crate::config::{ActionConfig, ModuleConfig};
use crate::engine::{invoke, ActionOutcome, EngineInner, Invocation};
use crate::stream::StreamSubscription;

fn unexpected(action: ActionName, outcome: &ActionOutcome) -> Error {
    Error::InvalidInput(format!("{} resolved with unexpected outcome {:?}", action, outcome))
}

/// A collection path plus its module configuration.
#[derive(Clone)]
pub struct CollectionRef {
    engine: Arc<EngineInner>,
    path: ModulePath,
    config: Arc<ModuleConfig>,
}

impl CollectionRef {
    pub(crate) fn new(engine: Arc<EngineInner>, path: ModulePath, config: Arc<ModuleConfig>) -> Self {
        Self {
            engine,
            path,
            config,
        }
    }

    pub fn path(&self) -> &ModulePath {
        &self.path
    }

    /// Last path segment.
    pub fn id(&self) -> &str {
        self.path.segments().last().map(String::as_str).unwrap_or_default()
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Reference a document of this collection, sharing its configuration.
    pub fn doc(&self, id: &str) -> Result<DocRef> {
        Ok(DocRef::new(
            self.engine.clone(),
            self.path.join(id)?,
            self.config.clone(),
        ))
    }

    /// Local documents, keyed by id.
    pub fn data(&self) -> BTreeMap<String, DocData> {
        self.engine.local.collection(&self.path)
    }

    fn invocation(&self, action: ActionName, payload: Value, config: ActionConfig) -> Invocation {
        Invocation::new(action, self.path.clone())
            .payload(payload)
            .config(config)
            .module_config(self.config.clone())
    }

    async fn run(&self, action: ActionName, payload: Value, config: ActionConfig) -> Result<ActionOutcome> {
        invoke(&self.engine, self.invocation(action, payload, config)).await
    }

    /// Insert a new document. The id comes from the first backend that
    /// generates one.
    pub async fn insert(&self, payload: Value, config: ActionConfig) -> Result<DocRef> {
        match self.run(ActionName::Insert, payload, config).await? {
            ActionOutcome::Written { path, .. } => {
                Ok(DocRef::new(self.engine.clone(), path, self.config.clone()))
            }
            other => Err(unexpected(ActionName::Insert, &other)),
        }
    }

    /// Fetch documents. Without `force`, the first backend that answers
    /// ends the fetch.
    ///
    /// A fetch with the same path and payload that is already running is
    /// joined, whichever reference started it. Its execution order and
    /// response hooks are the ones that shape the result.
    pub async fn fetch(&self, payload: Value, config: ActionConfig) -> Result<BTreeMap<String, DocData>> {
        match self.run(ActionName::Fetch, payload, config).await? {
            ActionOutcome::Docs(docs) => Ok(docs),
            other => Err(unexpected(ActionName::Fetch, &other)),
        }
    }

    pub async fn fetch_count(&self, payload: Value, config: ActionConfig) -> Result<u64> {
        match self.run(ActionName::FetchCount, payload, config).await? {
            ActionOutcome::Count(n) => Ok(n),
            other => Err(unexpected(ActionName::FetchCount, &other)),
        }
    }

    pub async fn fetch_aggregate(&self, payload: Value, config: ActionConfig) -> Result<DocData> {
        match self.run(ActionName::FetchAggregate, payload, config).await? {
            ActionOutcome::Aggregate(agg) => Ok(agg),
            other => Err(unexpected(ActionName::FetchAggregate, &other)),
        }
    }

    pub async fn stream(&self, payload: Value, config: ActionConfig) -> Result<StreamSubscription> {
        match self.run(ActionName::Stream, payload, config).await? {
            ActionOutcome::Stream(sub) => Ok(sub),
            other => Err(unexpected(ActionName::Stream, &other)),
        }
    }

    /// Close the stream opened with `payload`. Returns whether one was open.
    pub fn close_stream(&self, payload: &Value) -> Result<bool> {
        self.engine.streams.close(&self.path, payload)
    }

    /// Close every stream on this collection.
    pub fn close_all_streams(&self) -> usize {
        self.engine.streams.close_all(&self.path)
    }
}

impl fmt::Debug for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionRef")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish()
    }
}

/// A document path plus its module configuration.
#[derive(Clone)]
pub struct DocRef {
    engine: Arc<EngineInner>,
    path: ModulePath,
    config: Arc<ModuleConfig>,
}

impl DocRef {
    pub(crate) fn new(engine: Arc<EngineInner>, path: ModulePath, config: Arc<ModuleConfig>) -> Self {
        Self {
            engine,
            path,
            config,
        }
    }

    pub fn path(&self) -> &ModulePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.doc_id().unwrap_or_default()
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// The collection this document lives in, sharing its configuration.
    pub fn collection(&self) -> CollectionRef {
        CollectionRef::new(
            self.engine.clone(),
            self.path.collection_path(),
            self.config.clone(),
        )
    }

    /// Reference a sub-collection of this document.
    pub fn sub_collection(&self, name: &str) -> Result<CollectionRef> {
        Ok(CollectionRef::new(
            self.engine.clone(),
            self.path.join(name)?,
            self.config.clone(),
        ))
    }

    /// Local state.
    pub fn data(&self) -> Option<DocData> {
        self.engine.local.doc(&self.path)
    }

    async fn write(&self, action: ActionName, payload: Value, config: ActionConfig) -> Result<Option<DocData>> {
        let inv = Invocation::new(action, self.path.clone())
            .payload(payload)
            .config(config)
            .module_config(self.config.clone());
        match invoke(&self.engine, inv).await? {
            ActionOutcome::Written { data, .. } => Ok(data),
            other => Err(unexpected(action, &other)),
        }
    }

    /// Insert under this document's id. Resolves with the local state.
    pub async fn insert(&self, payload: Value, config: ActionConfig) -> Result<Option<DocData>> {
        self.write(ActionName::Insert, payload, config).await
    }

    /// Deep-merge `payload` into the document.
    pub async fn merge(&self, payload: Value, config: ActionConfig) -> Result<Option<DocData>> {
        self.write(ActionName::Merge, payload, config).await
    }

    /// Shallow-assign `payload`'s top-level fields.
    pub async fn assign(&self, payload: Value, config: ActionConfig) -> Result<Option<DocData>> {
        self.write(ActionName::Assign, payload, config).await
    }

    /// Replace the whole document.
    pub async fn replace(&self, payload: Value, config: ActionConfig) -> Result<Option<DocData>> {
        self.write(ActionName::Replace, payload, config).await
    }

    /// Delete one or more dot-separated properties (`"a.b"` or `["a", "c.d"]`).
    pub async fn delete_prop(&self, props: Value, config: ActionConfig) -> Result<Option<DocData>> {
        self.write(ActionName::DeleteProp, props, config).await
    }

    pub async fn delete(&self, config: ActionConfig) -> Result<()> {
        self.write(ActionName::Delete, Value::Null, config).await.map(|_| ())
    }

    /// Fetch the document. Without `force` a locally known document is
    /// returned without contacting any backend.
    ///
    /// Joins a running fetch of the same path and payload like
    /// [`CollectionRef::fetch`].
    pub async fn fetch(&self, payload: Value, config: ActionConfig) -> Result<Option<DocData>> {
        let inv = Invocation::new(ActionName::Fetch, self.path.clone())
            .payload(payload)
            .config(config)
            .module_config(self.config.clone());
        match invoke(&self.engine, inv).await? {
            ActionOutcome::Doc(data) => Ok(data),
            other => Err(unexpected(ActionName::Fetch, &other)),
        }
    }

    pub async fn stream(&self, payload: Value, config: ActionConfig) -> Result<StreamSubscription> {
        let inv = Invocation::new(ActionName::Stream, self.path.clone())
            .payload(payload)
            .config(config)
            .module_config(self.config.clone());
        match invoke(&self.engine, inv).await? {
            ActionOutcome::Stream(sub) => Ok(sub),
            other => Err(unexpected(ActionName::Stream, &other)),
        }
    }

    pub fn close_stream(&self, payload: &Value) -> Result<bool> {
        self.engine.streams.close(&self.path, payload)
    }

    pub fn close_all_streams(&self) -> usize {
        self.engine.streams.close_all(&self.path)
    }
}

impl fmt::Debug for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocRef")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ActionConfig, ExecutionOrder, SyncConfig};
    use crate::engine::SyncEngine;
    use lodestar_storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn engine() -> SyncEngine {
        SyncEngine::builder()
            .local_store(Arc::new(MemoryStore::new()))
            .config(SyncConfig {
                execution_order: ExecutionOrder::new().read(["cache"]).write(["cache"]),
                sync_debounce_ms: 0,
                ..SyncConfig::default()
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_doc_write_actions() {
        let engine = engine();
        let user = engine.doc("users/u1").unwrap();

        user.insert(json!({"name": "Luca", "stats": {"hp": 10, "atk": 3}}), ActionConfig::new())
            .await
            .unwrap();
        let data = user
            .merge(json!({"stats": {"hp": 12}}), ActionConfig::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data["stats"], json!({"hp": 12, "atk": 3}));

        let data = user
            .assign(json!({"stats": {"hp": 1}}), ActionConfig::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data["stats"], json!({"hp": 1}));

        let data = user
            .delete_prop(json!("stats.hp"), ActionConfig::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data["stats"], json!({}));

        let data = user
            .replace(json!({"name": "Lu"}), ActionConfig::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(serde_json::Value::Object(data), json!({"name": "Lu"}));

        user.delete(ActionConfig::new()).await.unwrap();
        assert!(user.data().is_none());
    }

    #[tokio::test]
    async fn test_collection_insert_returns_doc_ref() {
        let engine = engine();
        let users = engine.collection("users").unwrap();
        let luca = users.insert(json!({"name": "Luca"}), ActionConfig::new()).await.unwrap();

        assert_eq!(luca.collection().path(), users.path());
        assert!(!luca.id().is_empty());
        assert_eq!(users.data().len(), 1);
        assert_eq!(users.doc(luca.id()).unwrap().data().unwrap()["name"], "Luca");
    }

    #[test]
    fn test_sub_collection_paths() {
        let engine = engine();
        let posts = engine.doc("users/u1").unwrap().sub_collection("posts").unwrap();
        assert!(posts.path().is_collection());
        assert_eq!(posts.id(), "posts");
        assert_eq!(posts.doc("p1").unwrap().path().as_key(), "users/u1/posts/p1");
    }
}
