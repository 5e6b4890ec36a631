//! Replay of received edit batches
//!
//! [`ReplayEngine`] is the seam between the gossip layer and the document
//! model. [`PositionalReplay`] applies raw position-based operations in
//! arrival order; a sequence CRDT could implement the same trait without the
//! transport noticing.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::document::DocumentStore;
use super::operation::EditBatch;
use crate::error::{CollabError, CollabResult};
use crate::guard::{EditSource, FeedbackGuard};

/// What to do when a batch targets a document that does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingDocumentPolicy {
    /// Create an empty document and apply the batch to it
    #[default]
    Create,
    /// Drop the batch
    Skip,
}

/// Result of replaying one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Operations applied to the resolved document
    Applied {
        /// Resolved document path
        path: PathBuf,
        /// Number of operations applied
        operations: usize,
    },
    /// Batch originated here and was ignored
    SelfOriginated,
    /// Target document was missing and the policy says skip
    Skipped {
        /// Resolved document path
        path: PathBuf,
    },
}

/// Applies received batches to local documents
pub trait ReplayEngine: Send + Sync {
    /// Apply every operation of `batch`, in order.
    fn apply(&self, batch: &EditBatch) -> CollabResult<ReplayOutcome>;
}

/// Replays operations at their recorded positions
pub struct PositionalReplay {
    store: Arc<dyn DocumentStore>,
    guard: Arc<FeedbackGuard>,
    missing: MissingDocumentPolicy,
}

impl std::fmt::Debug for PositionalReplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionalReplay")
            .field("store", &"<DocumentStore>")
            .field("missing", &self.missing)
            .finish()
    }
}

impl PositionalReplay {
    /// Create a replay engine over `store`
    pub fn new(
        store: Arc<dyn DocumentStore>,
        guard: Arc<FeedbackGuard>,
        missing: MissingDocumentPolicy,
    ) -> Self {
        Self {
            store,
            guard,
            missing,
        }
    }

    /// Resolve a batch path against the workspace root.
    ///
    /// Absolute paths and `file://` URIs are used as-is. Relative paths are
    /// joined to the root and must not climb out of it.
    pub fn resolve(&self, document_path: &Path) -> CollabResult<PathBuf> {
        resolve_document_path(self.store.root(), document_path)
    }
}

/// Resolve `document_path` against `root`
pub fn resolve_document_path(root: &Path, document_path: &Path) -> CollabResult<PathBuf> {
    let raw = document_path.to_string_lossy();
    if let Some(stripped) = raw.strip_prefix("file://") {
        return Ok(PathBuf::from(stripped));
    }
    if document_path.is_absolute() {
        return Ok(document_path.to_path_buf());
    }

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in document_path.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(CollabError::PathOutsideWorkspace(raw.into_owned()));
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(CollabError::PathOutsideWorkspace(raw.into_owned()));
            }
        }
    }
    if depth == 0 {
        return Err(CollabError::InvalidOperation(format!(
            "Document path '{}' names the workspace root",
            raw
        )));
    }
    Ok(resolved)
}

impl ReplayEngine for PositionalReplay {
    fn apply(&self, batch: &EditBatch) -> CollabResult<ReplayOutcome> {
        if self.guard.is_self_originated(&batch.origin_client_id) {
            debug!(origin = %batch.origin_client_id, "Skipping self-originated batch");
            return Ok(ReplayOutcome::SelfOriginated);
        }

        let path = self.resolve(&batch.document_path)?;
        if !self.store.exists(&path) {
            match self.missing {
                MissingDocumentPolicy::Create => self.store.create(&path)?,
                MissingDocumentPolicy::Skip => {
                    info!(path = %path.display(), "Target document missing, batch dropped");
                    return Ok(ReplayOutcome::Skipped { path });
                }
            }
        }

        // Held for the whole batch so hosts that cannot tag writes still see
        // capture suspended.
        let _suspend = self.guard.suspend();
        let source = EditSource::Remote {
            origin: batch.origin_client_id.clone(),
        };
        for op in &batch.operations {
            self.store.apply(&path, op, source.clone())?;
        }

        debug!(
            path = %path.display(),
            ops = batch.operations.len(),
            origin = %batch.origin_client_id,
            "Replayed batch"
        );
        Ok(ReplayOutcome::Applied {
            path,
            operations: batch.operations.len(),
        })
    }
}
