//! Undo chain for the `revert` error policy.

use std::sync::Arc;
use tracing::{debug, error, info, trace};

use lodestar_common::{ActionName, Error, ModulePath, Result};
use lodestar_storage::{Backend, RevertRequest};

use crate::config::Effective;
use crate::hooks::{EventContext, EventKind};
use crate::write::PayloadSplit;

/// Which write is being undone.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RevertScope<'a> {
    pub action: ActionName,
    pub collection: &'a ModulePath,
    pub doc_id: Option<&'a str>,
}

/// Undo `succeeded` in reverse order.
///
/// Every backend gets a `revert` event whether or not it has a revert
/// handler. A failing handler ends the chain, and the backends it did not
/// reach are committed instead.
///
/// # Errors
/// - `RevertFailed` wrapping the handler's error
pub(crate) async fn revert_backends(
    eff: &Effective,
    succeeded: &[Arc<dyn Backend>],
    split: &PayloadSplit,
    scope: RevertScope<'_>,
    failure: &Error,
) -> Result<()> {
    let target = match scope.doc_id {
        Some(id) => scope.collection.join(id)?,
        None => scope.collection.clone(),
    };

    for (undone, backend) in succeeded.iter().rev().enumerate() {
        let name = backend.name();
        let payload = split.for_backend(name);

        match backend.reverter() {
            Some(reverter) => {
                let options = eff.options_for(name);
                let result = reverter
                    .revert(RevertRequest {
                        payload: &payload,
                        action: scope.action,
                        error: failure,
                        collection: scope.collection,
                        doc_id: scope.doc_id,
                        options: &options,
                    })
                    .await;
                if let Err(err) = result {
                    error!("Revert of {} on '{}' failed: {}", scope.action, name, err);
                    // Nothing further back will be undone.
                    commit_backends(&succeeded[..succeeded.len() - undone], scope);
                    return Err(Error::RevertFailed {
                        backend: name.to_string(),
                        action: scope.action,
                        source: Box::new(err),
                    });
                }
                info!("Reverted {} on '{}'", scope.action, name);
            }
            None => debug!("Backend '{}' has no revert handler", name),
        }

        eff.hooks.emit(
            &EventContext::new(EventKind::Revert, name, scope.action, &target, &payload)
                .with_error(failure),
        );
    }
    Ok(())
}

/// Tell every backend in `succeeded` that its write stands.
pub(crate) fn commit_backends(succeeded: &[Arc<dyn Backend>], scope: RevertScope<'_>) {
    let Some(doc_id) = scope.doc_id else {
        return;
    };
    for backend in succeeded {
        if let Some(reverter) = backend.reverter() {
            trace!("Committing {} on '{}'", scope.action, backend.name());
            reverter.commit(scope.collection, doc_id);
        }
    }
}
