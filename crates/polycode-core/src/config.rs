//! Node configuration
//!
//! Loaded from a JSON file; every field is optional and falls back to the
//! defaults below. The binary layers CLI flags on top.
//!
//! ```json
//! {
//!   "topic": "polycode",
//!   "workspace": "/home/me/project",
//!   "display_name": "me",
//!   "ttl": 3,
//!   "resync_grace_ms": 5000,
//!   "missing_documents": "create"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::edit::MissingDocumentPolicy;
use crate::error::{CollabError, CollabResult};
use crate::resync::CommandStep;
use crate::sync::envelope::DEFAULT_TTL;
use crate::types::DEFAULT_TOPIC_NAME;

/// Settings for one collaborating peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Discovery topic name
    pub topic: String,
    /// Workspace root documents are resolved against
    pub workspace: PathBuf,
    /// Display name announced to peers
    pub display_name: Option<String>,
    /// Hop budget for envelopes this peer originates
    pub ttl: u8,
    /// How long message ids are remembered (seconds)
    pub seen_retention_secs: u64,
    /// How often the seen-message cache is swept (seconds)
    pub seen_sweep_secs: u64,
    /// Diagnostic status log interval (seconds)
    pub status_interval_secs: u64,
    /// Bound on waiting for the topic join (seconds)
    pub join_timeout_secs: u64,
    /// Delay between a save notification and the resync (milliseconds)
    pub resync_grace_ms: u64,
    /// Steps run to pull a peer's saved work
    pub resync_steps: Vec<CommandStep>,
    /// Steps run to save and push local work
    pub save_steps: Vec<CommandStep>,
    /// What replay does with batches for missing documents
    pub missing_documents: MissingDocumentPolicy,
    /// Endpoint ids (hex) to join the topic through
    pub bootstrap: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC_NAME.to_string(),
            workspace: PathBuf::from("."),
            display_name: None,
            ttl: DEFAULT_TTL,
            seen_retention_secs: 5 * 60,
            seen_sweep_secs: 2 * 60,
            status_interval_secs: 5,
            join_timeout_secs: 10,
            resync_grace_ms: 5_000,
            resync_steps: default_resync_steps(),
            save_steps: default_save_steps(),
            missing_documents: MissingDocumentPolicy::default(),
            bootstrap: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> CollabResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CollabError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| CollabError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> CollabResult<()> {
        if self.topic.is_empty() {
            return Err(CollabError::Config("topic must not be empty".into()));
        }
        if self.seen_retention_secs == 0 {
            return Err(CollabError::Config("seen_retention_secs must be positive".into()));
        }
        if self.seen_sweep_secs == 0 || self.status_interval_secs == 0 {
            return Err(CollabError::Config("timer intervals must be positive".into()));
        }
        for step in self.resync_steps.iter().chain(&self.save_steps) {
            if step.program.is_empty() {
                return Err(CollabError::Config(format!("step '{}' has no program", step.name)));
            }
        }
        Ok(())
    }

    /// Seen-message retention window
    pub fn seen_retention(&self) -> Duration {
        Duration::from_secs(self.seen_retention_secs)
    }

    /// Seen-message sweep interval
    pub fn seen_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.seen_sweep_secs)
    }

    /// Diagnostic status interval
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    /// Topic join timeout
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    /// Resync grace delay
    pub fn resync_grace(&self) -> Duration {
        Duration::from_millis(self.resync_grace_ms)
    }
}

/// Fetch, hard-reset to the remote branch, then fast-forward
pub fn default_resync_steps() -> Vec<CommandStep> {
    vec![
        CommandStep::new("fetch", "git", ["fetch", "origin"]).required(),
        CommandStep::new("reset", "git", ["reset", "--hard", "origin/main"]),
        CommandStep::new("pull", "git", ["pull", "--ff-only"]),
    ]
}

/// Commit on a scratch branch, merge into main, push.
///
/// `{message}` in an argument is replaced by the commit message. Returning to
/// main and deleting the scratch branch run even when the commit fails, so a
/// save with nothing to commit leaves the workspace on main.
pub fn default_save_steps() -> Vec<CommandStep> {
    vec![
        CommandStep::new("branch", "git", ["checkout", "-B", "Saving"]).required(),
        CommandStep::new("add", "git", ["add", "."]).required(),
        CommandStep::new("commit", "git", ["commit", "-m", "{message}"]).required(),
        CommandStep::new("checkout", "git", ["checkout", "main"])
            .required()
            .always(),
        CommandStep::new("merge", "git", ["merge", "Saving"]).required(),
        CommandStep::new("cleanup", "git", ["branch", "-d", "Saving"]).always(),
        CommandStep::new("push", "git", ["push"]).required(),
    ]
}
