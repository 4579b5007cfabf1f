//! Local authoritative store contract.

use std::collections::BTreeMap;

use lodestar_common::{DocChange, DocData, ModulePath};

/// The locally-held copy the engine reads from and commits into.
///
/// Implementations are synchronous and in-memory; the engine never holds
/// one of these calls across an await point.
pub trait LocalStore: Send + Sync {
    /// Local data for a document path.
    fn doc(&self, path: &ModulePath) -> Option<DocData>;

    /// All local documents of a collection path, keyed by id.
    fn collection(&self, path: &ModulePath) -> BTreeMap<String, DocData>;

    /// Whether a document is known locally.
    fn exists(&self, path: &ModulePath) -> bool {
        self.doc(path).is_some()
    }

    /// Commit a fetched or streamed change into `collection`.
    ///
    /// Added and modified changes replace the document body; removed
    /// changes delete it.
    fn apply(&self, collection: &ModulePath, change: DocChange);

    /// Put a document back to a previously observed state (`None` deletes).
    fn restore(&self, path: &ModulePath, snapshot: Option<DocData>);
}
