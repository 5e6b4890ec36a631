//! Feedback-loop guard
//!
//! Two mechanisms keep a peer from re-broadcasting or re-applying its own
//! changes:
//!
//! - **Origin filtering**: every batch carries its origin [`ClientId`]; a
//!   received batch whose origin is the local id is never replayed.
//! - **Capture suspension**: every document write carries an [`EditSource`],
//!   and only `EditSource::Local` writes are captured. On top of that, a
//!   [`SuspendToken`] or [`SyncPermit`] suspends capture entirely while it is
//!   alive. Both reset on `Drop`, so the suspension ends on every exit path,
//!   including early returns and panics.
//!
//! ```text
//!   host edit ──► DocumentChange{source: Local} ──► capture ──► EditBatch
//!   replay    ──► DocumentChange{source: Remote} ─► capture ──► (ignored)
//!   resync    ──► SyncPermit alive              ─► capture ──► (ignored)
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::types::ClientId;

/// Where a document write came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditSource {
    /// A genuine edit by the local user
    Local,
    /// Replay of a batch received from a peer
    Remote {
        /// Client that produced the batch
        origin: ClientId,
    },
    /// File rewrite caused by an external resync
    Resync,
}

impl EditSource {
    /// Whether writes from this source may be captured and broadcast
    pub fn is_capturable(&self) -> bool {
        matches!(self, EditSource::Local)
    }
}

/// Shared guard state for one peer
#[derive(Debug)]
pub struct FeedbackGuard {
    local_client_id: ClientId,
    suspended: AtomicUsize,
    syncing: AtomicBool,
}

impl FeedbackGuard {
    /// Create a guard for the given local client
    pub fn new(local_client_id: ClientId) -> Arc<Self> {
        Arc::new(Self {
            local_client_id,
            suspended: AtomicUsize::new(0),
            syncing: AtomicBool::new(false),
        })
    }

    /// The local client id batches are tagged with
    pub fn local_client_id(&self) -> &ClientId {
        &self.local_client_id
    }

    /// Whether a batch with this origin was produced here
    pub fn is_self_originated(&self, origin: &ClientId) -> bool {
        origin == &self.local_client_id
    }

    /// Whether a change from `source` may be captured right now
    pub fn should_capture(&self, source: &EditSource) -> bool {
        source.is_capturable() && !self.is_suspended()
    }

    /// Whether capture is currently suspended for any reason
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) > 0 || self.syncing.load(Ordering::SeqCst)
    }

    /// Whether an external resync is running
    pub fn is_sync_in_progress(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Suspend capture until the returned token is dropped.
    ///
    /// Tokens nest: capture resumes only when the last one is gone.
    pub fn suspend(self: &Arc<Self>) -> SuspendToken {
        let depth = self.suspended.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(depth, "Capture suspended");
        SuspendToken {
            guard: Arc::clone(self),
        }
    }

    /// Try to enter the syncing state.
    ///
    /// Returns `None` when another resync already holds the permit; at most
    /// one permit exists per peer.
    pub fn try_begin_sync(self: &Arc<Self>) -> Option<SyncPermit> {
        match self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                debug!("Sync in progress, capture suspended");
                Some(SyncPermit {
                    guard: Arc::clone(self),
                })
            }
            Err(_) => None,
        }
    }
}

/// Suspends capture while alive
#[derive(Debug)]
#[must_use = "capture resumes as soon as the token is dropped"]
pub struct SuspendToken {
    guard: Arc<FeedbackGuard>,
}

impl Drop for SuspendToken {
    fn drop(&mut self) {
        let prev = self.guard.suspended.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            // Unbalanced drop would wrap the counter; restore and complain.
            self.guard.suspended.store(0, Ordering::SeqCst);
            warn!("Suspend counter underflow");
        }
    }
}

/// Exclusive right to run an external resync; clears the flag on drop
#[derive(Debug)]
#[must_use = "the sync flag is cleared as soon as the permit is dropped"]
pub struct SyncPermit {
    guard: Arc<FeedbackGuard>,
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.guard.syncing.store(false, Ordering::SeqCst);
        debug!("Sync finished, capture resumed");
    }
}
