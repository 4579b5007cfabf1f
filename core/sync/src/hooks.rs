//! Hook pipelines: payload transforms, read-response transforms and
//! lifecycle callbacks, composed across global, module and invocation
//! configuration.

use serde_json::Value;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use lodestar_common::{ActionClass, ActionName, ChangeKind, DocData, Error, ModulePath};

/// Transforms a payload before any backend sees it. Receives the target
/// document id when known.
pub type PayloadHook = Arc<dyn Fn(Value, Option<&str>) -> Value + Send + Sync>;

/// Transforms a document coming back from a backend. Returning `None`
/// discards it (for removals: cancels the removal).
pub type ResponseHook = Arc<dyn Fn(DocData, &ResponseMeta<'_>) -> Option<DocData> + Send + Sync>;

/// Lifecycle callback.
pub type EventHook = Arc<dyn for<'a> Fn(&EventContext<'a>) + Send + Sync>;

/// Bucket a payload hook is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PayloadBucket {
    /// Every write-class and delete-class action.
    Write,
    /// Every read-class action.
    Read,
    /// One specific action.
    Action(ActionName),
}

/// Lifecycle events fired per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    Before,
    Success,
    Error,
    Revert,
}

/// What a response hook knows about the document it transforms.
#[derive(Debug, Clone, Copy)]
pub struct ResponseMeta<'a> {
    pub id: &'a str,
    pub collection: &'a ModulePath,
}

/// Argument of every lifecycle callback.
pub struct EventContext<'a> {
    pub kind: EventKind,
    pub backend: &'a str,
    pub action: ActionName,
    pub path: &'a ModulePath,
    pub payload: &'a Value,
    /// Set for `Error` and `Revert` events.
    pub error: Option<&'a Error>,
    aborted: Cell<bool>,
}

impl<'a> EventContext<'a> {
    pub fn new(
        kind: EventKind,
        backend: &'a str,
        action: ActionName,
        path: &'a ModulePath,
        payload: &'a Value,
    ) -> Self {
        Self {
            kind,
            backend,
            action,
            path,
            payload,
            error: None,
            aborted: Cell::new(false),
        }
    }

    pub fn with_error(mut self, error: &'a Error) -> Self {
        self.error = Some(error);
        self
    }

    /// Stop the backend loop after this event. Honored for `Before` and
    /// `Success`; the action then resolves with whatever has run so far.
    pub fn abort(&self) {
        self.aborted.set(true);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.get()
    }
}

/// Hooks registered at one configuration scope, or the composition of
/// several scopes.
#[derive(Clone, Default)]
pub struct HookSet {
    payload: BTreeMap<PayloadBucket, Vec<PayloadHook>>,
    response: BTreeMap<ChangeKind, Vec<ResponseHook>>,
    events: BTreeMap<EventKind, Vec<EventHook>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a payload transform (`modifyPayloadOn`).
    pub fn modify_payload_on<F>(mut self, bucket: PayloadBucket, hook: F) -> Self
    where
        F: Fn(Value, Option<&str>) -> Value + Send + Sync + 'static,
    {
        self.payload.entry(bucket).or_default().push(Arc::new(hook));
        self
    }

    /// Add a read-response transform (`modifyReadResponseOn`).
    pub fn modify_read_response_on<F>(mut self, kind: ChangeKind, hook: F) -> Self
    where
        F: Fn(DocData, &ResponseMeta<'_>) -> Option<DocData> + Send + Sync + 'static,
    {
        self.response.entry(kind).or_default().push(Arc::new(hook));
        self
    }

    /// Add a lifecycle callback (`on`).
    pub fn on<F>(mut self, kind: EventKind, hook: F) -> Self
    where
        F: for<'a> Fn(&EventContext<'a>) + Send + Sync + 'static,
    {
        self.events.entry(kind).or_default().push(Arc::new(hook));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty() && self.response.is_empty() && self.events.is_empty()
    }

    /// Payload pipeline for an action: the shared class bucket, then the
    /// action's own bucket.
    pub fn payload_pipeline(&self, action: ActionName) -> Vec<PayloadHook> {
        let shared = match action.class() {
            ActionClass::Read => PayloadBucket::Read,
            ActionClass::Write | ActionClass::Delete => PayloadBucket::Write,
        };
        [shared, PayloadBucket::Action(action)]
            .iter()
            .filter_map(|bucket| self.payload.get(bucket))
            .flatten()
            .cloned()
            .collect()
    }

    /// Run the payload pipeline once.
    pub fn apply_payload(&self, action: ActionName, payload: Value, doc_id: Option<&str>) -> Value {
        self.payload_pipeline(action)
            .iter()
            .fold(payload, |acc, hook| hook(acc, doc_id))
    }

    /// Run the response pipeline for one document.
    pub fn apply_response(
        &self,
        kind: ChangeKind,
        data: DocData,
        meta: &ResponseMeta<'_>,
    ) -> Option<DocData> {
        let Some(hooks) = self.response.get(&kind) else {
            return Some(data);
        };
        hooks.iter().try_fold(data, |acc, hook| hook(acc, meta))
    }

    /// Fire every callback registered for `ctx.kind`. Returns whether one
    /// of them aborted.
    pub fn emit(&self, ctx: &EventContext<'_>) -> bool {
        if let Some(hooks) = self.events.get(&ctx.kind) {
            for hook in hooks {
                hook(ctx);
            }
        }
        ctx.is_aborted()
    }

    fn extend(&mut self, other: &HookSet) {
        for (bucket, hooks) in &other.payload {
            self.payload.entry(*bucket).or_default().extend(hooks.iter().cloned());
        }
        for (kind, hooks) in &other.response {
            self.response.entry(*kind).or_default().extend(hooks.iter().cloned());
        }
        for (kind, hooks) in &other.events {
            self.events.entry(*kind).or_default().extend(hooks.iter().cloned());
        }
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = |lens: Vec<(String, usize)>| -> BTreeMap<String, usize> { lens.into_iter().collect() };
        f.debug_struct("HookSet")
            .field(
                "modify_payload_on",
                &counts(self.payload.iter().map(|(k, v)| (format!("{:?}", k), v.len())).collect()),
            )
            .field(
                "modify_read_response_on",
                &counts(self.response.iter().map(|(k, v)| (format!("{:?}", k), v.len())).collect()),
            )
            .field(
                "on",
                &counts(self.events.iter().map(|(k, v)| (format!("{:?}", k), v.len())).collect()),
            )
            .finish()
    }
}

/// Concatenate hook sets bucket by bucket, in the order given
/// (global, then module, then invocation).
pub fn compose<'a>(sources: impl IntoIterator<Item = &'a HookSet>) -> HookSet {
    let mut composed = HookSet::new();
    for source in sources {
        composed.extend(source);
    }
    composed
}
