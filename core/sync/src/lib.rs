//! Lodestar Sync Engine
//!
//! This module routes data actions on collection and document paths across
//! an ordered list of backends, including:
//! - Configurable execution orders per action, module and call
//! - Error policies: stop, continue, or revert already-applied backends
//! - Composable payload, read-response and lifecycle hooks
//! - Debounced per-collection write locks that hold back reads and streams
//! - Deduplication of identical in-flight fetches
//! - Coalesced stream commits that never regress optimistic writes

pub mod config;
pub mod engine;
pub mod fetch;
pub mod hooks;
pub mod lock;
pub mod module;
mod revert;
pub mod stream;
pub mod write;

// Re-export main types
pub use config::{ActionConfig, ExecutionOrder, ModuleConfig, OnError, SyncConfig};
pub use engine::{ActionOutcome, Invocation, SyncEngine, SyncEngineBuilder};
pub use fetch::FetchData;
pub use hooks::{EventContext, EventKind, HookSet, PayloadBucket, ResponseMeta};
pub use lock::{WriteLockGuard, WriteLockManager};
pub use module::{CollectionRef, DocRef};
pub use stream::StreamSubscription;
pub use write::PER_BACKEND_KEY;
