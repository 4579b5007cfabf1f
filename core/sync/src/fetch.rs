//! Read dispatch: fetch, fetchCount and fetchAggregate.
//!
//! Concurrent identical fetches share one round-trip. Reads wait for
//! pending writes on their collection before contacting any backend, and
//! every document a backend returns is committed to the local store.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use lodestar_common::{ActionName, ChangeKind, DocChange, DocData, Error, ModulePath, Result};
use lodestar_storage::{document, DocSink, FetchOutcome, FetchedDoc, ReadRequest};

use crate::config::{Effective, OnError};
use crate::engine::{EngineInner, Invocation};
use crate::hooks::{EventContext, EventKind, ResponseMeta};

/// What a fetch resolves with.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchData {
    /// Local state of the document after the fetch.
    Doc(Option<DocData>),
    /// Documents the backends returned, keyed by id.
    Collection(BTreeMap<String, DocData>),
}

type SharedFetch = Shared<BoxFuture<'static, Result<FetchData>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FetchKey {
    path: String,
    action: ActionName,
    payload: String,
}

/// Fetches currently running, keyed by path, action and payload.
#[derive(Default)]
pub(crate) struct InFlightFetches {
    entries: Mutex<HashMap<FetchKey, SharedFetch>>,
}

impl InFlightFetches {
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Fetch `inv.path`, joining an identical fetch already in flight.
pub(crate) async fn dispatch_fetch(engine: &Arc<EngineInner>, inv: Invocation) -> Result<FetchData> {
    let key = FetchKey {
        path: inv.path.as_key(),
        action: ActionName::Fetch,
        payload: serde_json::to_string(&inv.payload)?,
    };

    let shared = {
        let mut entries = engine.fetches.entries.lock();
        match entries.get(&key) {
            Some(existing) => {
                debug!("Joining in-flight fetch of {}", inv.path);
                existing.clone()
            }
            None => {
                let task_engine = engine.clone();
                let task_key = key.clone();
                // The task removes its own entry; it cannot run that far
                // before the entry is inserted below since it needs this lock.
                let handle = tokio::spawn(async move {
                    let result = run_fetch(&task_engine, inv).await;
                    task_engine.fetches.entries.lock().remove(&task_key);
                    result
                });
                let joined: BoxFuture<'static, Result<FetchData>> = Box::pin(async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(err) => Err(Error::Cancelled(format!("fetch task: {}", err))),
                    }
                });
                let shared = joined.shared();
                entries.insert(key, shared.clone());
                shared
            }
        }
    };

    shared.await
}

async fn run_fetch(engine: &Arc<EngineInner>, inv: Invocation) -> Result<FetchData> {
    let path = &inv.path;
    let is_doc = path.is_document();
    let force = inv.config.force || (is_doc && !engine.local.exists(path));

    if is_doc && !force {
        trace!("Serving {} from local state", path);
        return Ok(FetchData::Doc(engine.local.doc(path)));
    }

    let action = ActionName::Fetch;
    let eff = Effective::resolve(action, &engine.config, &inv.module, &inv.config)?;
    let backends = engine.registry.resolve_order(&eff.order)?;
    let collection = path.collection_path();

    wait_for_writes(engine, path).await;

    let payload = eff.hooks.apply_payload(action, inv.payload, path.doc_id());
    let mut results = BTreeMap::new();
    let mut sinks: Vec<DocSink> = Vec::new();

    for backend in &backends {
        let name = backend.name();
        let Some(fetcher) = backend.fetcher() else {
            debug!("Backend '{}' has no fetch handler, skipping", name);
            continue;
        };

        let aborted = eff
            .hooks
            .emit(&EventContext::new(EventKind::Before, name, action, path, &payload));
        if aborted {
            break;
        }

        let options = eff.options_for(name);
        let result = fetcher
            .fetch(ReadRequest {
                action,
                payload: &payload,
                collection: &collection,
                doc_id: path.doc_id(),
                options: &options,
                force,
            })
            .await;

        match result {
            Ok(FetchOutcome::Deferred(sink)) => {
                trace!("Backend '{}' deferred; collecting its sink", name);
                sinks.push(sink);
                let aborted = eff
                    .hooks
                    .emit(&EventContext::new(EventKind::Success, name, action, path, &payload));
                if aborted {
                    break;
                }
            }
            Ok(FetchOutcome::Response(response)) => {
                let is_local = name == engine.local_name;
                debug!("Backend '{}' returned {} doc(s) for {}", name, response.docs.len(), path);
                for doc in response.docs {
                    commit_fetched(engine, &eff, &collection, is_local, doc, &sinks, &mut results);
                }
                let aborted = eff
                    .hooks
                    .emit(&EventContext::new(EventKind::Success, name, action, path, &payload));
                if aborted || !force {
                    break;
                }
            }
            Err(err) => {
                eff.hooks.emit(
                    &EventContext::new(EventKind::Error, name, action, path, &payload)
                        .with_error(&err),
                );
                let failure = Error::backend_failed(name, action, err);
                if eff.on_error == OnError::Continue {
                    warn!("{}; continuing", failure);
                    continue;
                }
                warn!("{}; stopping", failure);
                return Err(failure);
            }
        }
    }

    Ok(if is_doc {
        FetchData::Doc(engine.local.doc(path))
    } else {
        FetchData::Collection(results)
    })
}

/// Take one fetched document into the local store and the result set.
fn commit_fetched(
    engine: &EngineInner,
    eff: &Effective,
    collection: &ModulePath,
    is_local: bool,
    doc: FetchedDoc,
    sinks: &[DocSink],
    results: &mut BTreeMap<String, DocData>,
) {
    // The local store's own answer is already local state.
    if is_local {
        if doc.exists {
            results.insert(doc.id, doc.data);
        }
        return;
    }

    let meta = ResponseMeta {
        id: &doc.id,
        collection,
    };

    if !doc.exists {
        let known = collection
            .join(&doc.id)
            .ok()
            .and_then(|path| engine.local.doc(&path))
            .unwrap_or_default();
        if eff.hooks.apply_response(ChangeKind::Removed, known, &meta).is_none() {
            debug!("Removal of {} discarded by response hook", doc.id);
            return;
        }
        engine
            .local
            .apply(collection, DocChange::removed(doc.id.clone()));
        for sink in sinks {
            sink(&doc);
        }
        results.remove(&doc.id);
        return;
    }

    let Some(data) = eff.hooks.apply_response(ChangeKind::Added, doc.data.clone(), &meta) else {
        debug!("Document {} discarded by response hook", doc.id);
        return;
    };
    let doc = FetchedDoc::new(doc.id, data);
    engine
        .local
        .apply(collection, DocChange::added(doc.id.clone(), doc.data.clone()));
    for sink in sinks {
        sink(&doc);
    }
    results.insert(doc.id, doc.data);
}

async fn wait_for_writes(engine: &EngineInner, path: &ModulePath) {
    if path.is_document() {
        engine.locks.await_if_locked(&path.collection_path()).await;
    } else {
        engine.locks.await_all_under(path).await;
    }
}

/// Count documents; the answer is the largest count any backend reports.
pub(crate) async fn dispatch_fetch_count(engine: &Arc<EngineInner>, inv: Invocation) -> Result<u64> {
    let action = ActionName::FetchCount;
    let path = &inv.path;
    let eff = Effective::resolve(action, &engine.config, &inv.module, &inv.config)?;
    let backends = engine.registry.resolve_order(&eff.order)?;
    let collection = path.collection_path();

    wait_for_writes(engine, path).await;

    let payload = eff.hooks.apply_payload(action, inv.payload, path.doc_id());
    let mut count: Option<u64> = None;

    for backend in &backends {
        let name = backend.name();
        let Some(counter) = backend.counter() else {
            continue;
        };

        let aborted = eff
            .hooks
            .emit(&EventContext::new(EventKind::Before, name, action, path, &payload));
        if aborted {
            break;
        }

        let options = eff.options_for(name);
        let result = counter
            .fetch_count(ReadRequest {
                action,
                payload: &payload,
                collection: &collection,
                doc_id: path.doc_id(),
                options: &options,
                force: inv.config.force,
            })
            .await;

        match result {
            Ok(n) => {
                debug!("Backend '{}' counted {} in {}", name, n, path);
                count = Some(count.map_or(n, |c| c.max(n)));
                let aborted = eff
                    .hooks
                    .emit(&EventContext::new(EventKind::Success, name, action, path, &payload));
                if aborted {
                    break;
                }
            }
            Err(err) => {
                eff.hooks.emit(
                    &EventContext::new(EventKind::Error, name, action, path, &payload)
                        .with_error(&err),
                );
                let failure = Error::backend_failed(name, action, err);
                if eff.on_error == OnError::Continue {
                    warn!("{}; continuing", failure);
                    continue;
                }
                return Err(failure);
            }
        }
    }

    Ok(count.unwrap_or(0))
}

/// Aggregate; later backends' results are deep-merged over earlier ones.
pub(crate) async fn dispatch_fetch_aggregate(
    engine: &Arc<EngineInner>,
    inv: Invocation,
) -> Result<DocData> {
    let action = ActionName::FetchAggregate;
    let path = &inv.path;
    let eff = Effective::resolve(action, &engine.config, &inv.module, &inv.config)?;
    let backends = engine.registry.resolve_order(&eff.order)?;
    let collection = path.collection_path();

    wait_for_writes(engine, path).await;

    let payload = eff.hooks.apply_payload(action, inv.payload, path.doc_id());
    let mut aggregate = DocData::new();

    for backend in &backends {
        let name = backend.name();
        let Some(aggregator) = backend.aggregator() else {
            continue;
        };

        let aborted = eff
            .hooks
            .emit(&EventContext::new(EventKind::Before, name, action, path, &payload));
        if aborted {
            break;
        }

        let options = eff.options_for(name);
        let result = aggregator
            .fetch_aggregate(ReadRequest {
                action,
                payload: &payload,
                collection: &collection,
                doc_id: path.doc_id(),
                options: &options,
                force: inv.config.force,
            })
            .await;

        match result {
            Ok(partial) => {
                document::deep_merge(&mut aggregate, &partial);
                let aborted = eff
                    .hooks
                    .emit(&EventContext::new(EventKind::Success, name, action, path, &payload));
                if aborted {
                    break;
                }
            }
            Err(err) => {
                eff.hooks.emit(
                    &EventContext::new(EventKind::Error, name, action, path, &payload)
                        .with_error(&err),
                );
                let failure = Error::backend_failed(name, action, err);
                if eff.on_error == OnError::Continue {
                    warn!("{}; continuing", failure);
                    continue;
                }
                return Err(failure);
            }
        }
    }

    Ok(aggregate)
}
