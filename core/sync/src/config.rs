//! Engine, module and per-invocation configuration.
//!
//! Configuration exists at three scopes. Execution orders, error policy
//! and debounce resolve narrowest-first; hooks from all three scopes are
//! composed in global, module, invocation order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use lodestar_common::{ActionClass, ActionName, Error, Result};
use lodestar_storage::document;

use crate::hooks::{compose, HookSet};

/// Default write-lock debounce.
pub const DEFAULT_SYNC_DEBOUNCE_MS: u64 = 5000;

/// What happens when a backend fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnError {
    /// Abort the remaining backends and reject.
    #[default]
    Stop,
    /// Skip the failed backend and keep going.
    Continue,
    /// Undo every backend that already succeeded, then reject.
    Revert,
}

/// Backend names per action class, optionally overridden per action.
///
/// ```json
/// { "read": ["cache", "remote"], "write": ["cache", "remote"], "insert": ["remote", "cache"] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOrder {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write: Vec<String>,
    /// Falls back to `write` when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<String>,
    #[serde(flatten)]
    pub actions: BTreeMap<ActionName, Vec<String>>,
}

fn names<I, S>(backends: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    backends.into_iter().map(Into::into).collect()
}

impl ExecutionOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read = names(backends);
        self
    }

    pub fn write<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write = names(backends);
        self
    }

    pub fn delete<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.delete = names(backends);
        self
    }

    /// Order for one specific action.
    pub fn action<I, S>(mut self, action: ActionName, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // "delete" is both an action and a class key on the wire.
        if action == ActionName::Delete {
            self.delete = names(backends);
        } else {
            self.actions.insert(action, names(backends));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty()
            && self.write.is_empty()
            && self.delete.is_empty()
            && self.actions.values().all(Vec::is_empty)
    }

    /// Order configured at this scope: the action's own entry, else its
    /// class entry.
    pub fn lookup(&self, action: ActionName) -> Option<&[String]> {
        if let Some(order) = self.actions.get(&action).filter(|o| !o.is_empty()) {
            return Some(order.as_slice());
        }
        let class = match action.class() {
            ActionClass::Read => &self.read,
            ActionClass::Write => &self.write,
            ActionClass::Delete if self.delete.is_empty() => &self.write,
            ActionClass::Delete => &self.delete,
        };
        (!class.is_empty()).then_some(class.as_slice())
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Backends to contact per action and action class.
    pub execution_order: ExecutionOrder,
    /// What a failed backend does to the rest of the action.
    pub on_error: OnError,
    /// How long a collection stays write-locked after its last write.
    pub sync_debounce_ms: u64,
    /// Options handed to each backend, keyed by backend name.
    pub backend_options: BTreeMap<String, Value>,
    /// Hooks that run for every module.
    #[serde(skip)]
    pub hooks: HookSet,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            execution_order: ExecutionOrder::default(),
            on_error: OnError::default(),
            sync_debounce_ms: DEFAULT_SYNC_DEBOUNCE_MS,
            backend_options: BTreeMap::new(),
            hooks: HookSet::default(),
        }
    }
}

impl SyncConfig {
    /// Load from JSON. Hooks are code and never part of the file.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Configuration attached to one collection or document reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModuleConfig {
    /// Checked before the engine's order, entry by entry.
    pub execution_order: ExecutionOrder,
    /// Overrides the engine's error policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
    /// Overrides the engine's write lock debounce.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_debounce_ms: Option<u64>,
    /// Deep-merged over the engine's options for the same backend.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub backend_options: BTreeMap<String, Value>,
    /// Run after the engine's hooks.
    #[serde(skip)]
    pub hooks: HookSet,
}

impl ModuleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the module's execution order.
    pub fn execution_order(mut self, order: ExecutionOrder) -> Self {
        self.execution_order = order;
        self
    }

    /// Set the module's error policy.
    pub fn on_error(mut self, policy: OnError) -> Self {
        self.on_error = Some(policy);
        self
    }

    /// Set the module's write lock debounce.
    pub fn sync_debounce_ms(mut self, ms: u64) -> Self {
        self.sync_debounce_ms = Some(ms);
        self
    }

    /// Set the options for one backend.
    pub fn backend_options(mut self, backend: impl Into<String>, options: Value) -> Self {
        self.backend_options.insert(backend.into(), options);
        self
    }

    /// Set the module's hooks.
    pub fn hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Overrides for a single action call.
#[derive(Debug, Clone, Default)]
pub struct ActionConfig {
    /// Replaces every configured order for this call.
    pub execution_order: Option<Vec<String>>,
    /// Overrides the module's and engine's error policy.
    pub on_error: Option<OnError>,
    /// Overrides the write lock debounce for this call.
    pub sync_debounce_ms: Option<u64>,
    /// Fetch even when an optimistic read could be answered locally.
    pub force: bool,
    /// Run after the engine's and module's hooks.
    pub hooks: HookSet,
}

impl ActionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contact exactly `backends`, in order.
    pub fn execution_order<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.execution_order = Some(names(backends));
        self
    }

    /// Set the error policy for this call.
    pub fn on_error(mut self, policy: OnError) -> Self {
        self.on_error = Some(policy);
        self
    }

    /// Set the write lock debounce for this call.
    pub fn sync_debounce_ms(mut self, ms: u64) -> Self {
        self.sync_debounce_ms = Some(ms);
        self
    }

    /// Always contact the backends on a read.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Set hooks for this call.
    pub fn hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Settings in effect for one action call after resolving every scope.
#[derive(Debug, Clone)]
pub(crate) struct Effective {
    pub order: Vec<String>,
    pub on_error: OnError,
    pub debounce: Duration,
    pub hooks: HookSet,
    backend_options: BTreeMap<String, Value>,
}

impl Effective {
    /// Resolve settings for `action`.
    ///
    /// # Errors
    /// - `NoBackendsConfigured` when no scope names an order for the action
    pub fn resolve(
        action: ActionName,
        global: &SyncConfig,
        module: &ModuleConfig,
        invocation: &ActionConfig,
    ) -> Result<Self> {
        let order = invocation
            .execution_order
            .clone()
            .filter(|order| !order.is_empty())
            .or_else(|| module.execution_order.lookup(action).map(<[String]>::to_vec))
            .or_else(|| global.execution_order.lookup(action).map(<[String]>::to_vec))
            .ok_or(Error::NoBackendsConfigured { action })?;

        let on_error = invocation
            .on_error
            .or(module.on_error)
            .unwrap_or(global.on_error);

        let debounce_ms = invocation
            .sync_debounce_ms
            .or(module.sync_debounce_ms)
            .unwrap_or(global.sync_debounce_ms);

        let mut backend_options = global.backend_options.clone();
        for (backend, options) in &module.backend_options {
            let merged = match (backend_options.remove(backend), options) {
                (Some(Value::Object(mut base)), Value::Object(patch)) => {
                    document::deep_merge(&mut base, patch);
                    Value::Object(base)
                }
                (_, options) => options.clone(),
            };
            backend_options.insert(backend.clone(), merged);
        }

        debug!(
            "Resolved {} order {:?} (onError {:?}, debounce {}ms)",
            action, order, on_error, debounce_ms
        );

        Ok(Self {
            order,
            on_error,
            debounce: Duration::from_millis(debounce_ms),
            hooks: compose([&global.hooks, &module.hooks, &invocation.hooks]),
            backend_options,
        })
    }

    /// Options for one backend, `Null` when none are configured.
    pub fn options_for(&self, backend: &str) -> Value {
        self.backend_options
            .get(backend)
            .cloned()
            .unwrap_or(Value::Null)
    }
}
