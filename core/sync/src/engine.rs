//! Core sync engine that routes actions across backends.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use lodestar_common::{ActionClass, ActionName, DocData, Error, ModulePath, Result};
use lodestar_storage::{Backend, BackendRegistry, LocalStore};

use crate::config::{ActionConfig, ModuleConfig, SyncConfig};
use crate::fetch::{dispatch_fetch, dispatch_fetch_aggregate, dispatch_fetch_count, FetchData, InFlightFetches};
use crate::lock::WriteLockManager;
use crate::module::{CollectionRef, DocRef};
use crate::stream::{dispatch_stream, StreamRegistry, StreamSubscription};
use crate::write::dispatch_write;

/// Shared state behind every engine handle and module reference.
pub(crate) struct EngineInner {
    pub registry: BackendRegistry,
    pub local: Arc<dyn LocalStore>,
    /// Backend name of the local store in execution orders.
    pub local_name: String,
    pub config: SyncConfig,
    pub locks: WriteLockManager,
    pub fetches: InFlightFetches,
    pub streams: StreamRegistry,
}

/// One action call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub action: ActionName,
    pub path: ModulePath,
    pub payload: Value,
    pub config: ActionConfig,
    /// Configuration of the module the call is made through.
    pub module: Arc<ModuleConfig>,
}

impl Invocation {
    pub fn new(action: ActionName, path: ModulePath) -> Self {
        Self {
            action,
            path,
            payload: Value::Null,
            config: ActionConfig::default(),
            module: Arc::new(ModuleConfig::default()),
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn config(mut self, config: ActionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn module_config(mut self, module: Arc<ModuleConfig>) -> Self {
        self.module = module;
        self
    }
}

/// What an action resolved with.
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    /// A write: the document it landed on and its local state afterwards.
    Written {
        path: ModulePath,
        data: Option<DocData>,
    },
    /// A document fetch: local state afterwards.
    Doc(Option<DocData>),
    /// A collection fetch: documents returned, keyed by id.
    Docs(BTreeMap<String, DocData>),
    Count(u64),
    Aggregate(DocData),
    Stream(StreamSubscription),
}

/// Main engine handle. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::default()
    }

    /// Reference a collection (odd number of segments).
    pub fn collection(&self, path: &str) -> Result<CollectionRef> {
        self.collection_with(path, ModuleConfig::default())
    }

    pub fn collection_with(&self, path: &str, config: ModuleConfig) -> Result<CollectionRef> {
        let path = ModulePath::parse(path)?;
        if !path.is_collection() {
            return Err(Error::InvalidTargetKind(format!(
                "'{}' is a document path, expected a collection",
                path
            )));
        }
        Ok(CollectionRef::new(self.inner.clone(), path, Arc::new(config)))
    }

    /// Reference a document (even number of segments).
    pub fn doc(&self, path: &str) -> Result<DocRef> {
        self.doc_with(path, ModuleConfig::default())
    }

    pub fn doc_with(&self, path: &str, config: ModuleConfig) -> Result<DocRef> {
        let path = ModulePath::parse(path)?;
        if !path.is_document() {
            return Err(Error::InvalidTargetKind(format!(
                "'{}' is a collection path, expected a document",
                path
            )));
        }
        Ok(DocRef::new(self.inner.clone(), path, Arc::new(config)))
    }

    /// Run any action.
    pub async fn invoke(&self, inv: Invocation) -> Result<ActionOutcome> {
        invoke(&self.inner, inv).await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The local store reads are served from.
    pub fn local_store(&self) -> Arc<dyn LocalStore> {
        self.inner.local.clone()
    }

    pub fn locks(&self) -> &WriteLockManager {
        &self.inner.locks
    }

    pub fn backends(&self) -> Vec<String> {
        self.inner.registry.backends()
    }

    pub fn in_flight_fetches(&self) -> usize {
        self.inner.fetches.len()
    }

    pub fn open_streams(&self) -> usize {
        self.inner.streams.len()
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("registry", &self.inner.registry)
            .field("local", &self.inner.local_name)
            .field("config", &self.inner.config)
            .finish()
    }
}

pub(crate) async fn invoke(engine: &Arc<EngineInner>, inv: Invocation) -> Result<ActionOutcome> {
    debug!("Invoking {} on {}", inv.action, inv.path);
    match inv.action {
        ActionName::Fetch => Ok(match dispatch_fetch(engine, inv).await? {
            FetchData::Doc(data) => ActionOutcome::Doc(data),
            FetchData::Collection(docs) => ActionOutcome::Docs(docs),
        }),
        ActionName::FetchCount => dispatch_fetch_count(engine, inv).await.map(ActionOutcome::Count),
        ActionName::FetchAggregate => dispatch_fetch_aggregate(engine, inv)
            .await
            .map(ActionOutcome::Aggregate),
        ActionName::Stream => dispatch_stream(engine, inv).await.map(ActionOutcome::Stream),
        action => {
            debug_assert!(matches!(action.class(), ActionClass::Write | ActionClass::Delete));
            let written = dispatch_write(engine, inv).await?;
            Ok(ActionOutcome::Written {
                path: written.path,
                data: written.data,
            })
        }
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    registry: BackendRegistry,
    local: Option<(String, Arc<dyn LocalStore>)>,
    config: SyncConfig,
    error: Option<Error>,
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self {
            registry: BackendRegistry::new(),
            local: None,
            config: SyncConfig::default(),
            error: None,
        }
    }
}

impl SyncEngineBuilder {
    /// Set the local store. It is also registered as a backend under its
    /// own name so execution orders can place it.
    pub fn local_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: Backend + LocalStore + 'static,
    {
        let name = store.name().to_string();
        self = self.backend(store.clone());
        let local: Arc<dyn LocalStore> = store;
        self.local = Some((name, local));
        self
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        if let Err(err) = self.registry.register(backend) {
            self.error.get_or_insert(err);
        }
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// # Errors
    /// - A backend name registered twice
    /// - No local store
    pub fn build(self) -> Result<SyncEngine> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let (local_name, local) = self
            .local
            .ok_or_else(|| Error::InvalidInput("A local store is required".to_string()))?;

        info!(
            "Sync engine ready: local '{}', backends {:?}",
            local_name,
            self.registry.backends()
        );

        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                registry: self.registry,
                local,
                local_name,
                config: self.config,
                locks: WriteLockManager::new(),
                fetches: InFlightFetches::default(),
                streams: StreamRegistry::default(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionOrder;
    use lodestar_storage::MemoryStore;
    use serde_json::json;

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

    #[test]
    fn test_build_requires_local_store() {
        let result = SyncEngine::builder().build();
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_duplicate_backend_rejected() {
        let result = SyncEngine::builder()
            .local_store(Arc::new(MemoryStore::new()))
            .backend(Arc::new(MemoryStore::new()))
            .build();
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_path_parity_is_checked() {
        let engine = engine();
        assert!(engine.collection("users").is_ok());
        assert!(engine.doc("users/u1").is_ok());
        assert!(matches!(engine.collection("users/u1"), Err(Error::InvalidTargetKind(_))));
        assert!(matches!(engine.doc("users"), Err(Error::InvalidTargetKind(_))));
        assert!(engine.backends().contains(&"cache".to_string()));
    }

    #[tokio::test]
    async fn test_invoke_routes_by_action() {
        let engine = engine();
        let users = ModulePath::parse("users").unwrap();

        let outcome = engine
            .invoke(Invocation::new(ActionName::Insert, users.clone()).payload(json!({"name": "Luca"})))
            .await
            .unwrap();
        let ActionOutcome::Written { path, data } = outcome else {
            panic!("expected a write outcome");
        };
        assert!(path.is_document());
        assert_eq!(data.unwrap()["name"], "Luca");

        let outcome = engine
            .invoke(Invocation::new(ActionName::FetchCount, users.clone()))
            .await
            .unwrap();
        assert!(matches!(outcome, ActionOutcome::Count(1)));

        let outcome = engine
            .invoke(Invocation::new(ActionName::Fetch, users).config(ActionConfig::new().force()))
            .await
            .unwrap();
        let ActionOutcome::Docs(docs) = outcome else {
            panic!("expected documents");
        };
        assert_eq!(docs.len(), 1);
    }
}
