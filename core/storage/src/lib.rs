//! Store adapter abstraction for Lodestar.
//!
//! This module provides the trait-based contract every backend implements
//! (a local cache, a remote document database, ...), the local store
//! contract the engine commits into, a registry for resolving execution
//! orders by name, and an in-memory store.
//!
//! # Design Principles
//! - Backend isolation: no adapter-specific logic in the engine
//! - Capability gating: an unsupported action family is a `None`, not a runtime probe
//! - Async operations: every handler is async
//! - Unified error semantics: adapters report `lodestar_common::Error`

pub mod backend;
pub mod document;
pub mod local;
pub mod memory;
pub mod registry;

pub use backend::{
    AggregateHandler, Backend, ChangeSink, CountHandler, DocSink, FetchHandler, FetchOutcome,
    FetchResponse, FetchedDoc, ReadRequest, RevertHandler, RevertRequest, StreamHandle,
    StreamHandler, StreamRequest, StreamSink, WriteHandler, WriteOutcome, WriteRequest,
};
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use registry::BackendRegistry;
