//! Write dispatch: insert, merge, assign, replace, deleteProp, delete.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use lodestar_common::{ActionName, DocData, Error, ModulePath, Result};
use lodestar_storage::{document, Backend, WriteOutcome, WriteRequest};

use crate::config::{Effective, OnError};
use crate::engine::{EngineInner, Invocation};
use crate::hooks::{EventContext, EventKind};
use crate::revert::{commit_backends, revert_backends, RevertScope};

/// Payload key carrying per-backend overrides:
/// `{"name": "Luca", "$perBackend": {"remote": {"name": "LUCA"}}}`.
pub const PER_BACKEND_KEY: &str = "$perBackend";

/// A payload split into its canonical form and per-backend overrides.
#[derive(Debug, Clone)]
pub(crate) struct PayloadSplit {
    canonical: Value,
    overrides: Map<String, Value>,
}

impl PayloadSplit {
    pub fn new(payload: Value) -> Result<Self> {
        match payload {
            Value::Object(mut map) => {
                let overrides = match map.remove(PER_BACKEND_KEY) {
                    Some(Value::Object(overrides)) => overrides,
                    Some(other) => {
                        return Err(Error::InvalidInput(format!(
                            "'{}' must be an object keyed by backend name, got {}",
                            PER_BACKEND_KEY,
                            document::type_name(&other)
                        )))
                    }
                    None => Map::new(),
                };
                Ok(Self {
                    canonical: Value::Object(map),
                    overrides,
                })
            }
            canonical => Ok(Self {
                canonical,
                overrides: Map::new(),
            }),
        }
    }

    /// Payload one backend receives: the canonical payload with that
    /// backend's override assigned over it.
    pub fn for_backend(&self, backend: &str) -> Value {
        match (&self.canonical, self.overrides.get(backend)) {
            (Value::Object(base), Some(Value::Object(patch))) => {
                let mut merged = base.clone();
                document::assign(&mut merged, patch);
                Value::Object(merged)
            }
            (_, Some(other)) => other.clone(),
            (canonical, None) => canonical.clone(),
        }
    }
}

/// Document a write ended up targeting and its local state afterwards.
#[derive(Debug, Clone)]
pub(crate) struct WriteResult {
    pub path: ModulePath,
    pub data: Option<DocData>,
}

/// Run a write action through every backend of its execution order.
///
/// # Errors
/// - `InvalidTargetKind` for a non-insert on a collection path
/// - `NoBackendsConfigured` / `UnknownBackend` from order resolution
/// - `BackendActionFailed` under `stop` or `revert`
/// - `RevertFailed` when undoing an earlier backend fails
pub(crate) async fn dispatch_write(engine: &Arc<EngineInner>, inv: Invocation) -> Result<WriteResult> {
    let action = inv.action;
    if !action.is_write() {
        return Err(Error::InvalidInput(format!("{} is not a write action", action)));
    }
    if action != ActionName::Insert && !inv.path.is_document() {
        return Err(Error::InvalidTargetKind(format!(
            "{} needs a document path, '{}' is a collection",
            action, inv.path
        )));
    }

    let eff = Effective::resolve(action, &engine.config, &inv.module, &inv.config)?;
    let backends = engine.registry.resolve_order(&eff.order)?;
    let collection = inv.path.collection_path();

    // Writes on this collection run one at a time from here on.
    let _lock = engine
        .locks
        .acquire_exclusive(&collection, eff.debounce)
        .await;

    let payload = eff
        .hooks
        .apply_payload(action, inv.payload, inv.path.doc_id());
    let split = PayloadSplit::new(payload)?;

    let mut doc_id = inv.path.doc_id().map(String::from);
    let mut snapshot = doc_id
        .as_deref()
        .and_then(|id| collection.join(id).ok())
        .and_then(|path| engine.local.doc(&path));
    let mut succeeded: Vec<Arc<dyn Backend>> = Vec::new();
    let mut local_applied = false;

    info!("Dispatching {} on {} to {:?}", action, inv.path, eff.order);

    for backend in &backends {
        let name = backend.name();
        let Some(writer) = backend.writer() else {
            debug!("Backend '{}' has no write handler, skipping", name);
            continue;
        };

        let target = target_path(&collection, doc_id.as_deref());
        let backend_payload = split.for_backend(name);
        let aborted = eff.hooks.emit(&EventContext::new(
            EventKind::Before,
            name,
            action,
            &target,
            &backend_payload,
        ));
        if aborted {
            info!("{} on {} aborted before '{}'", action, target, name);
            break;
        }

        let options = eff.options_for(name);
        let result = writer
            .write(WriteRequest {
                action,
                payload: &backend_payload,
                collection: &collection,
                doc_id: doc_id.as_deref(),
                options: &options,
            })
            .await;

        match result {
            Ok(outcome) => {
                if let WriteOutcome::Inserted { id } = outcome {
                    if doc_id.is_none() {
                        debug!("Backend '{}' generated id {}", name, id);
                        doc_id = Some(id);
                    }
                }
                if name == engine.local_name {
                    local_applied = true;
                }
                succeeded.push(backend.clone());

                let target = target_path(&collection, doc_id.as_deref());
                let aborted = eff.hooks.emit(&EventContext::new(
                    EventKind::Success,
                    name,
                    action,
                    &target,
                    &backend_payload,
                ));
                if aborted {
                    info!("{} on {} aborted after '{}'", action, target, name);
                    break;
                }
            }
            Err(err) => {
                eff.hooks.emit(
                    &EventContext::new(EventKind::Error, name, action, &target, &backend_payload)
                        .with_error(&err),
                );
                let failure = Error::backend_failed(name, action, err);

                match eff.on_error {
                    OnError::Continue => {
                        warn!("{}; continuing", failure);
                        continue;
                    }
                    OnError::Stop => {
                        warn!("{}; stopping", failure);
                        commit_backends(&succeeded, scope(action, &collection, doc_id.as_deref()));
                        if local_applied {
                            if let Some(id) = doc_id.as_deref() {
                                let path = collection.join(id)?;
                                debug!("Restoring local state of {}", path);
                                engine.local.restore(&path, snapshot.take());
                            }
                        }
                        return Err(failure);
                    }
                    OnError::Revert => {
                        warn!("{}; reverting {} backend(s)", failure, succeeded.len());
                        let undo = scope(action, &collection, doc_id.as_deref());
                        revert_backends(&eff, &succeeded, &split, undo, &failure).await?;
                        return Err(failure);
                    }
                }
            }
        }
    }

    let doc_id = doc_id.ok_or_else(|| {
        Error::InvalidInput(format!(
            "insert into {} produced no document id; pass one or put a backend that generates ids in the order",
            collection
        ))
    })?;
    commit_backends(&succeeded, scope(action, &collection, Some(&doc_id)));
    let path = collection.join(&doc_id)?;
    let data = engine.local.doc(&path);
    Ok(WriteResult { path, data })
}

fn scope<'a>(action: ActionName, collection: &'a ModulePath, doc_id: Option<&'a str>) -> RevertScope<'a> {
    RevertScope {
        action,
        collection,
        doc_id,
    }
}

/// Path events report: the document once its id is known, else the
/// collection.
fn target_path(collection: &ModulePath, doc_id: Option<&str>) -> ModulePath {
    doc_id
        .and_then(|id| collection.join(id).ok())
        .unwrap_or_else(|| collection.clone())
}
