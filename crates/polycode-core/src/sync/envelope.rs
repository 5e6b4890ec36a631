//! Message envelopes exchanged between peers
//!
//! Every line written to an overlay connection is either a JSON-encoded
//! [`Envelope`] or a bare legacy trigger string. The envelope carries routing
//! fields (`messageId`, `ttl`, `forwardedBy`) next to a [`Payload`] whose
//! shape depends on `type`.
//!
//! ## Wire Format
//!
//! ```text
//! {"type":"crdt_update","timestamp":1700000000000,"messageId":"abc-1700000000000-x1y2z3",
//!  "ttl":3,"peerId":"9f2c...","clientId":"abc","document":"src/a.txt",
//!  "updates":[{"operation":"insert","position":{"line":2,"character":5},"text":"X"}],
//!  "originClientId":"abc","capturedAt":1700000000000}
//! ```

use std::path::PathBuf;

use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};

use crate::edit::{EditBatch, EditOperation};
use crate::error::CollabResult;
use crate::types::{now_millis, ClientId};

/// Hop budget a freshly created envelope starts with
pub const DEFAULT_TTL: u8 = 3;

/// Legacy plain-text trigger
pub const LEGACY_TRIGGER: &str = "I LOVE YOU";

/// Canned reply to [`LEGACY_TRIGGER`]
pub const LEGACY_REPLY: &str = "I LOVE YOU TOO";

/// Type-specific envelope content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// A captured edit batch
    #[serde(rename_all = "camelCase")]
    CrdtUpdate {
        /// Workspace-relative document path
        document: PathBuf,
        /// Operations in capture order
        updates: Vec<EditOperation>,
        /// Client that captured the edit
        origin_client_id: ClientId,
        /// When the edit was captured (ms)
        #[serde(default)]
        captured_at: u64,
    },
    /// A peer committed and pushed to the shared repository
    #[serde(rename_all = "camelCase")]
    GithubSave {
        /// Commit message used
        commit_message: String,
    },
    /// Liveness check
    #[serde(alias = "p2p_ping")]
    Ping {
        /// Free text
        #[serde(default)]
        message: String,
    },
    /// Reply to a ping
    #[serde(alias = "p2p_pong", rename_all = "camelCase")]
    Pong {
        /// Free text
        #[serde(default)]
        message: String,
        /// Timestamp of the ping being answered
        original_timestamp: u64,
        /// Client that sent the ping
        #[serde(default)]
        reply_to: Option<ClientId>,
    },
    /// Ask peers to resync from the repository
    SyncRequest {
        /// Free text
        #[serde(default)]
        message: String,
    },
    /// Display name announcement
    #[serde(rename_all = "camelCase")]
    UserNameUpdate {
        /// New display name
        user_name: String,
    },
    /// Direct identification sent once when a connection opens
    #[serde(rename_all = "camelCase")]
    Hello {
        /// Display name, if set
        #[serde(default)]
        display_name: Option<String>,
    },
}

impl Payload {
    /// Wire name of the payload type
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::CrdtUpdate { .. } => "crdt_update",
            Payload::GithubSave { .. } => "github_save",
            Payload::Ping { .. } => "ping",
            Payload::Pong { .. } => "pong",
            Payload::SyncRequest { .. } => "sync_request",
            Payload::UserNameUpdate { .. } => "user_name_update",
            Payload::Hello { .. } => "hello",
        }
    }

    /// Payload for an edit batch
    pub fn from_batch(batch: &EditBatch) -> Self {
        Payload::CrdtUpdate {
            document: batch.document_path.clone(),
            updates: batch.operations.clone(),
            origin_client_id: batch.origin_client_id.clone(),
            captured_at: batch.timestamp,
        }
    }
}

/// Wire-level unit exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Creation instant (ms since epoch)
    pub timestamp: u64,
    /// Globally unique id used for duplicate suppression
    pub message_id: String,
    /// Remaining hop budget
    pub ttl: u8,
    /// Client id of the last relay, if relayed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_by: Option<ClientId>,
    /// Transport identity of the origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Client id of the origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Type-specific content
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Create an envelope originating at `client_id`
    pub fn new(payload: Payload, client_id: &ClientId, peer_id: Option<String>, ttl: u8) -> Self {
        let timestamp = now_millis();
        Self {
            timestamp,
            message_id: generate_message_id(client_id, timestamp),
            ttl,
            forwarded_by: None,
            peer_id,
            client_id: Some(client_id.clone()),
            payload,
        }
    }

    /// Copy for relaying: one hop spent, relay recorded.
    ///
    /// Returns `None` once the budget is exhausted.
    pub fn forwarded(&self, relay: &ClientId) -> Option<Self> {
        if self.ttl == 0 {
            return None;
        }
        let mut copy = self.clone();
        copy.ttl -= 1;
        copy.forwarded_by = Some(relay.clone());
        Some(copy)
    }

    /// Whether this envelope arrived through a relay
    pub fn is_relayed(&self) -> bool {
        self.forwarded_by.is_some()
    }

    /// Wire name of the payload type
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// The edit batch carried by a `crdt_update`
    pub fn edit_batch(&self) -> Option<EditBatch> {
        match &self.payload {
            Payload::CrdtUpdate {
                document,
                updates,
                origin_client_id,
                captured_at,
            } => Some(EditBatch {
                document_path: document.clone(),
                timestamp: if *captured_at == 0 {
                    self.timestamp
                } else {
                    *captured_at
                },
                operations: updates.clone(),
                origin_client_id: origin_client_id.clone(),
            }),
            _ => None,
        }
    }

    /// Encode as one JSON line (no trailing newline)
    pub fn encode(&self) -> CollabResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from one JSON line
    pub fn decode(line: &str) -> CollabResult<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Unique message id: client id, timestamp, random suffix
pub fn generate_message_id(client_id: &ClientId, timestamp: u64) -> String {
    let suffix = Alphanumeric.sample_string(&mut rand::rng(), 9);
    format!("{}-{}-{}", client_id, timestamp, suffix.to_lowercase())
}

/// A decoded inbound line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Primary protocol
    Envelope(Box<Envelope>),
    /// Anything that is not an envelope
    PlainText(String),
}

impl Inbound {
    /// Classify a received line; malformed JSON falls back to plain text
    pub fn parse(line: &str) -> Self {
        match Envelope::decode(line) {
            Ok(envelope) if !envelope.message_id.is_empty() => Inbound::Envelope(Box::new(envelope)),
            _ => Inbound::PlainText(line.to_string()),
        }
    }

    /// Canned reply for a legacy trigger, if this is one
    pub fn legacy_reply(&self) -> Option<&'static str> {
        match self {
            Inbound::PlainText(text) if text == LEGACY_TRIGGER => Some(LEGACY_REPLY),
            _ => None,
        }
    }
}
