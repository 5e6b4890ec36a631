//! Per-session JSONL logs
//!
//! Alongside console output, a peer can append every tracing event to its own
//! JSON Lines file. Several peers on one machine each get their own file, so
//! a multi-peer session can be replayed afterwards by merging the files.
//!
//! ```text
//! logs/
//! ├── 2026-10-16_k3m9x2p1.jsonl
//! └── 2026-10-16_a8d0q7zz.jsonl
//! ```
//!
//! ```bash
//! # every relayed envelope, all peers, in time order
//! cat logs/*.jsonl | jq -s 'sort_by(.ts) | .[] | select(.msg == "Relayed envelope")'
//! ```

pub mod layer;
pub mod writer;

pub use layer::JsonlLayer;
pub use writer::{read_entries, LogEntry, SessionLogWriter};
