//! Local change capture
//!
//! Turns one editor change notification into one [`EditBatch`], unless the
//! feedback guard says the change must not leave this peer.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use super::document::{ContentChange, DocumentChange};
use super::operation::{EditBatch, EditOperation};
use crate::guard::FeedbackGuard;

/// Builds outgoing batches from local document changes
#[derive(Debug, Clone)]
pub struct EditCapture {
    workspace_root: PathBuf,
    guard: Arc<FeedbackGuard>,
}

impl EditCapture {
    /// Create a capturer for the workspace at `workspace_root`
    pub fn new(workspace_root: impl Into<PathBuf>, guard: Arc<FeedbackGuard>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            guard,
        }
    }

    /// Build a batch for a change notification.
    ///
    /// Returns `None` when the change came from replay or resync, when
    /// capture is suspended, or when the change carries no operations.
    pub fn capture(&self, change: &DocumentChange) -> Option<EditBatch> {
        if !self.guard.should_capture(&change.source) {
            trace!(path = %change.path.display(), source = ?change.source, "Change not captured");
            return None;
        }

        let operations: Vec<EditOperation> = change
            .changes
            .iter()
            .flat_map(Self::operations_for)
            .collect();
        if operations.is_empty() {
            return None;
        }

        let document_path = self.relative_path(&change.path);
        debug!(
            path = %document_path.display(),
            ops = operations.len(),
            "Captured local change"
        );
        Some(EditBatch::new(
            document_path,
            operations,
            self.guard.local_client_id().clone(),
        ))
    }

    /// Operations for one contiguous change.
    ///
    /// A pure insertion or pure deletion maps to one operation. A replacement
    /// (text over a non-empty range) maps to a delete followed by an insert at
    /// the range start, which replays to the same text.
    fn operations_for(change: &ContentChange) -> Vec<EditOperation> {
        let mut ops = Vec::with_capacity(2);
        if change.range_length > 0 {
            ops.push(EditOperation::delete(change.range, change.range_length));
        }
        if !change.text.is_empty() {
            ops.push(EditOperation::insert(change.range.start, change.text.clone()));
        }
        ops
    }

    /// Path relative to the workspace root; paths outside it stay absolute
    pub fn relative_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.workspace_root) {
            Ok(rel) => rel
                .components()
                .filter(|c| !matches!(c, Component::CurDir))
                .collect(),
            Err(_) => path.to_path_buf(),
        }
    }
}
