//! Common types used throughout Lodestar.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The body of a document: a JSON object.
pub type DocData = Map<String, Value>;

/// A collection or document path, independent of any backend.
///
/// Segments alternate collection / document / collection ..., so a path
/// with an odd number of segments (`users`, `users/u1/posts`) names a
/// collection and an even number (`users/u1`) names a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModulePath {
    segments: Vec<String>,
}

impl ModulePath {
    /// Create a path from segments.
    ///
    /// # Errors
    /// - No segments
    /// - An empty segment or one containing a separator
    pub fn from_segments(segments: Vec<String>) -> crate::Result<Self> {
        if segments.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Path must have at least one segment".to_string(),
            ));
        }
        for seg in &segments {
            if seg.is_empty() {
                return Err(crate::Error::InvalidInput(
                    "Path segment cannot be empty".to_string(),
                ));
            }
            if seg.contains('/') {
                return Err(crate::Error::InvalidInput(
                    "Path segment cannot contain separators".to_string(),
                ));
            }
        }
        Ok(Self { segments })
    }

    /// Parse a `/`-separated path. Leading and trailing slashes are ignored.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidInput(format!("Empty path: '{}'", path)));
        }
        Self::from_segments(trimmed.split('/').map(String::from).collect())
    }

    /// Whether this path names a collection.
    pub fn is_collection(&self) -> bool {
        self.segments.len() % 2 == 1
    }

    /// Whether this path names a document.
    pub fn is_document(&self) -> bool {
        !self.is_collection()
    }

    /// The document id, for document paths.
    pub fn doc_id(&self) -> Option<&str> {
        if self.is_document() {
            self.segments.last().map(|s| s.as_str())
        } else {
            None
        }
    }

    /// The collection this path belongs to: itself for collections, the
    /// parent for documents. Write locks are keyed on this.
    pub fn collection_path(&self) -> ModulePath {
        if self.is_collection() {
            self.clone()
        } else {
            let mut segments = self.segments.clone();
            segments.pop();
            Self { segments }
        }
    }

    /// Join a child segment (a doc id onto a collection, or a
    /// sub-collection name onto a document).
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        let mut segments = self.segments.clone();
        segments.push(child.to_string());
        Self::from_segments(segments)
    }

    /// Whether `other` is this path or nested somewhere beneath it.
    pub fn contains(&self, other: &ModulePath) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// `/`-joined form without leading slash, used as a map key.
    pub fn as_key(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

/// Every action a module reference can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionName {
    Insert,
    Merge,
    Assign,
    Replace,
    DeleteProp,
    Delete,
    Fetch,
    FetchCount,
    FetchAggregate,
    Stream,
}

/// Execution-order class an action falls back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionClass {
    Read,
    Write,
    Delete,
}

impl ActionName {
    /// All actions, in declaration order.
    pub const ALL: [ActionName; 10] = [
        ActionName::Insert,
        ActionName::Merge,
        ActionName::Assign,
        ActionName::Replace,
        ActionName::DeleteProp,
        ActionName::Delete,
        ActionName::Fetch,
        ActionName::FetchCount,
        ActionName::FetchAggregate,
        ActionName::Stream,
    ];

    pub fn class(&self) -> ActionClass {
        match self {
            Self::Insert | Self::Merge | Self::Assign | Self::Replace => ActionClass::Write,
            Self::DeleteProp | Self::Delete => ActionClass::Delete,
            Self::Fetch | Self::FetchCount | Self::FetchAggregate | Self::Stream => {
                ActionClass::Read
            }
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self.class(), ActionClass::Read)
    }

    /// Wire name, as used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Merge => "merge",
            Self::Assign => "assign",
            Self::Replace => "replace",
            Self::DeleteProp => "deleteProp",
            Self::Delete => "delete",
            Self::Fetch => "fetch",
            Self::FetchCount => "fetchCount",
            Self::FetchAggregate => "fetchAggregate",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of change a read response or stream notification carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change to commit into the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocChange {
    pub kind: ChangeKind,
    /// Document id within the collection.
    pub id: String,
    /// Full document body; `None` for removals.
    pub data: Option<DocData>,
}

impl DocChange {
    pub fn added(id: impl Into<String>, data: DocData) -> Self {
        Self {
            kind: ChangeKind::Added,
            id: id.into(),
            data: Some(data),
        }
    }

    pub fn modified(id: impl Into<String>, data: DocData) -> Self {
        Self {
            kind: ChangeKind::Modified,
            id: id.into(),
            data: Some(data),
        }
    }

    pub fn removed(id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Removed,
            id: id.into(),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_collection_and_document_parity() {
        let users = ModulePath::parse("users").unwrap();
        assert!(users.is_collection());
        assert_eq!(users.doc_id(), None);

        let user = ModulePath::parse("/users/u1/").unwrap();
        assert!(user.is_document());
        assert_eq!(user.doc_id(), Some("u1"));
        assert_eq!(user.collection_path(), users);

        let posts = user.join("posts").unwrap();
        assert!(posts.is_collection());
        assert_eq!(posts.as_key(), "users/u1/posts");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(ModulePath::parse("").is_err());
        assert!(ModulePath::parse("/").is_err());
        assert!(ModulePath::parse("users//u1").is_err());
    }

    #[test]
    fn test_contains() {
        let users = ModulePath::parse("users").unwrap();
        let posts = ModulePath::parse("users/u1/posts").unwrap();
        let other = ModulePath::parse("usersX").unwrap();
        assert!(users.contains(&posts));
        assert!(users.contains(&users));
        assert!(!users.contains(&other));
        assert!(!posts.contains(&users));
    }

    #[test]
    fn test_action_classes() {
        assert_eq!(ActionName::Insert.class(), ActionClass::Write);
        assert_eq!(ActionName::DeleteProp.class(), ActionClass::Delete);
        assert_eq!(ActionName::Stream.class(), ActionClass::Read);
        assert!(ActionName::Delete.is_write());
        assert!(!ActionName::FetchCount.is_write());
    }

    #[test]
    fn test_action_name_wire_format() {
        for action in ActionName::ALL {
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
        }
    }

    proptest! {
        #[test]
        fn prop_parse_roundtrips_key(segs in prop::collection::vec("[a-z0-9]{1,8}", 1..6)) {
            let path = ModulePath::parse(&segs.join("/")).unwrap();
            prop_assert_eq!(path.segments().len(), segs.len());
            prop_assert_eq!(path.is_collection(), segs.len() % 2 == 1);
            let reparsed = ModulePath::parse(&path.as_key()).unwrap();
            prop_assert_eq!(reparsed, path);
        }
    }
}
