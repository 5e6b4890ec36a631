//! Duplicate suppression and hop-limited flooding
//!
//! Every inbound envelope passes through [`GossipRouter::route`] before it is
//! processed or relayed:
//!
//! 1. `messageId` already seen: drop silently
//! 2. otherwise remember it with the current time
//! 3. hand it to the local handler
//! 4. if `ttl > 0`, relay a copy with `ttl - 1` and `forwardedBy = local`
//!    to every connection except the one it came in on
//!
//! No peer needs topology knowledge; flooding stops when the hop budget runs
//! out.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::envelope::Envelope;
use crate::types::ClientId;

/// How long a message id is remembered
pub const DEFAULT_SEEN_RETENTION: Duration = Duration::from_secs(5 * 60);

/// How often expired ids are purged
pub const DEFAULT_SEEN_SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Message ids seen recently, with first-seen time
#[derive(Debug)]
pub struct SeenMessageCache {
    entries: HashMap<String, Instant>,
    retention: Duration,
}

impl SeenMessageCache {
    /// Create a cache that remembers ids for `retention`
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            retention,
        }
    }

    /// Record an id; returns `false` if it was already present
    pub fn insert(&mut self, message_id: &str, now: Instant) -> bool {
        if self.entries.contains_key(message_id) {
            return false;
        }
        self.entries.insert(message_id.to_string(), now);
        true
    }

    /// Whether an id is present
    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    /// Drop ids older than the retention window; returns how many went
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let retention = self.retention;
        self.entries
            .retain(|_, seen| now.saturating_duration_since(*seen) < retention);
        before - self.entries.len()
    }

    /// Number of ids held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What to do with an inbound envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Seen before: neither processed nor relayed
    Duplicate,
    /// New: process locally, then relay `forward` if present
    Deliver {
        /// Copy to relay, `None` when the hop budget is exhausted
        forward: Option<Envelope>,
    },
}

/// Routing state of one peer
#[derive(Debug)]
pub struct GossipRouter {
    local_client_id: ClientId,
    seen: SeenMessageCache,
}

impl GossipRouter {
    /// Create a router for `local_client_id`
    pub fn new(local_client_id: ClientId, retention: Duration) -> Self {
        Self {
            local_client_id,
            seen: SeenMessageCache::new(retention),
        }
    }

    /// Decide what happens to an inbound envelope
    pub fn route(&mut self, envelope: &Envelope, now: Instant) -> RouteDecision {
        if !self.seen.insert(&envelope.message_id, now) {
            trace!(id = %envelope.message_id, "Duplicate message dropped");
            return RouteDecision::Duplicate;
        }

        let forward = envelope.forwarded(&self.local_client_id);
        if forward.is_none() {
            debug!(id = %envelope.message_id, kind = envelope.kind(), "Hop budget exhausted, not relaying");
        }
        RouteDecision::Deliver { forward }
    }

    /// Remember an envelope this peer originates, so echoes are dropped
    pub fn mark_outgoing(&mut self, envelope: &Envelope, now: Instant) {
        self.seen.insert(&envelope.message_id, now);
    }

    /// Purge expired ids
    pub fn sweep(&mut self, now: Instant) -> usize {
        let purged = self.seen.sweep(now);
        if purged > 0 {
            debug!(purged, remaining = self.seen.len(), "Swept seen-message cache");
        }
        purged
    }

    /// Number of remembered ids
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::envelope::Payload;

    fn envelope(ttl: u8) -> Envelope {
        Envelope::new(
            Payload::Ping {
                message: "hi".to_string(),
            },
            &ClientId::from_string("origin"),
            None,
            ttl,
        )
    }

    fn router() -> GossipRouter {
        GossipRouter::new(ClientId::from_string("relay"), DEFAULT_SEEN_RETENTION)
    }

    #[test]
    fn test_second_delivery_is_duplicate() {
        let mut r = router();
        let env = envelope(3);
        let now = Instant::now();
        assert!(matches!(r.route(&env, now), RouteDecision::Deliver { .. }));
        assert_eq!(r.route(&env, now), RouteDecision::Duplicate);

        // A relayed copy shares the id and is also a duplicate
        let relayed = env.forwarded(&ClientId::from_string("x")).unwrap();
        assert_eq!(r.route(&relayed, now), RouteDecision::Duplicate);
    }

    #[test]
    fn test_forward_decrements_ttl() {
        let mut r = router();
        match r.route(&envelope(3), Instant::now()) {
            RouteDecision::Deliver { forward: Some(fwd) } => {
                assert_eq!(fwd.ttl, 2);
                assert_eq!(fwd.forwarded_by, Some(ClientId::from_string("relay")));
            }
            other => panic!("Expected forward, got {:?}", other),
        }
    }

    #[test]
    fn test_ttl_zero_delivered_not_forwarded() {
        let mut r = router();
        assert_eq!(
            r.route(&envelope(0), Instant::now()),
            RouteDecision::Deliver { forward: None }
        );
    }

    #[test]
    fn test_outgoing_echo_is_duplicate() {
        let mut r = router();
        let env = envelope(3);
        let now = Instant::now();
        r.mark_outgoing(&env, now);
        assert_eq!(r.route(&env, now), RouteDecision::Duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_purges_after_retention() {
        let mut cache = SeenMessageCache::new(Duration::from_secs(300));
        let start = Instant::now();
        cache.insert("old", start);

        tokio::time::advance(Duration::from_secs(200)).await;
        cache.insert("new", Instant::now());
        assert_eq!(cache.sweep(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(101)).await;
        assert_eq!(cache.sweep(Instant::now()), 1);
        assert!(!cache.contains("old"));
        assert!(cache.contains("new"));

        // Once purged, the id is accepted again
        assert!(cache.insert("old", Instant::now()));
    }

    #[test]
    fn test_flood_bound_over_a_line() {
        // A chain of peers each relaying once: with ttl = 3 the envelope is
        // relayed by at most three peers.
        let mut env = envelope(3);
        let mut relays = 0;
        for i in 0..10 {
            let mut r = GossipRouter::new(
                ClientId::from_string(format!("p{}", i)),
                DEFAULT_SEEN_RETENTION,
            );
            match r.route(&env, Instant::now()) {
                RouteDecision::Deliver { forward: Some(fwd) } => {
                    relays += 1;
                    env = fwd;
                }
                RouteDecision::Deliver { forward: None } => break,
                RouteDecision::Duplicate => unreachable!(),
            }
        }
        assert_eq!(relays, 3);
    }
}
