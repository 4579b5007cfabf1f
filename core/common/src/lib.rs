//! Types shared by every Lodestar crate: the error enum, collection and
//! document paths, action names and the change records backends report.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ActionClass, ActionName, ChangeKind, DocChange, DocData, ModulePath};
