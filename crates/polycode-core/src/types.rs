//! Core types for Polycode

use std::time::{SystemTime, UNIX_EPOCH};

use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};

/// Length of a discovery topic in bytes
pub const TOPIC_LEN: usize = 32;

/// Topic name every peer joins unless configured otherwise
pub const DEFAULT_TOPIC_NAME: &str = "polycode";

/// Stable application-level identifier of one editor instance
///
/// Distinct from the transport identity (endpoint public key): the client id
/// tags every captured edit so that a peer can recognise its own changes when
/// they loop back through the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    /// Create a new random ClientId (26 lowercase alphanumerics)
    pub fn new() -> Self {
        let raw = Alphanumeric.sample_string(&mut rand::rng(), 26);
        Self(raw.to_lowercase())
    }

    /// Wrap an existing identifier
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow as str
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines and notifications
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Build the 32-byte discovery topic for a topic name.
///
/// The ASCII name is repeated until the buffer is full, so every peer that
/// uses the same name lands on the same topic. An empty name yields all zeros.
pub fn discovery_topic(name: &str) -> [u8; TOPIC_LEN] {
    let mut topic = [0u8; TOPIC_LEN];
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return topic;
    }
    for (i, slot) in topic.iter_mut().enumerate() {
        *slot = bytes[i % bytes.len()];
    }
    topic
}

/// Hex form of a topic, as printed for operators
pub fn topic_hex(name: &str) -> String {
    hex::encode(discovery_topic(name))
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 26);
        assert!(a.as_str().chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_client_id_short() {
        let id = ClientId::from_string("abcdefghijkl");
        assert_eq!(id.short(), "abcdefgh");

        let tiny = ClientId::from_string("abc");
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn test_client_id_serializes_as_string() {
        let id = ClientId::from_string("peer1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"peer1\"");
    }

    #[test]
    fn test_discovery_topic_repeats_name() {
        let topic = discovery_topic("polycode");
        assert_eq!(&topic[..8], b"polycode");
        assert_eq!(&topic[8..16], b"polycode");
        assert_eq!(&topic[24..32], b"polycode");

        let odd = discovery_topic("abc");
        assert_eq!(&odd[..6], b"abcabc");
        assert_eq!(odd[31], b'b');
    }

    #[test]
    fn test_discovery_topic_empty_name() {
        assert_eq!(discovery_topic(""), [0u8; 32]);
    }

    #[test]
    fn test_topic_hex() {
        let hex = topic_hex("ab");
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("61626162"));
    }
}
