//! Edit operations and batches
//!
//! An [`EditBatch`] is one captured document change: an ordered list of
//! [`EditOperation`]s over (line, character) coordinates, attributed to the
//! client that produced it. Batches are replayed on remote peers strictly in
//! the order the operations were captured.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::ClientId;

/// Zero-based (line, character) coordinate in a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    /// Zero-based line number
    pub line: u32,
    /// Zero-based character offset within the line
    pub character: u32,
}

impl Position {
    /// Create a position
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.character)
    }
}

/// Half-open span between two positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Range {
    /// Inclusive start
    pub start: Position,
    /// Exclusive end
    pub end: Position,
}

impl Range {
    /// Create a range
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Range of `len` characters on a single line; the end saturates
    pub const fn on_line(line: u32, character: u32, len: u32) -> Self {
        Self {
            start: Position::new(line, character),
            end: Position::new(line, character.saturating_add(len)),
        }
    }

    /// Whether start and end coincide
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// One atomic change to a document
///
/// Exactly one of insert or delete, enforced by the enum. On the wire the kind
/// is carried in the `operation` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum EditOperation {
    /// Insert `text` at `position`
    Insert {
        /// Where the text goes
        position: Position,
        /// Text to insert
        text: String,
    },
    /// Remove `length` characters covered by `range`
    Delete {
        /// Span to remove
        range: Range,
        /// Number of characters removed
        length: u32,
    },
}

impl EditOperation {
    /// Insert operation
    pub fn insert(position: Position, text: impl Into<String>) -> Self {
        EditOperation::Insert {
            position,
            text: text.into(),
        }
    }

    /// Delete operation
    pub fn delete(range: Range, length: u32) -> Self {
        EditOperation::Delete { range, length }
    }

    /// Check if this is an insert
    pub fn is_insert(&self) -> bool {
        matches!(self, EditOperation::Insert { .. })
    }

    /// Check if this is a delete
    pub fn is_delete(&self) -> bool {
        matches!(self, EditOperation::Delete { .. })
    }

    /// Position the operation starts at
    pub fn start(&self) -> Position {
        match self {
            EditOperation::Insert { position, .. } => *position,
            EditOperation::Delete { range, .. } => range.start,
        }
    }
}

/// One captured set of document edits, attributed to an originating peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditBatch {
    /// Path relative to the workspace root (or absolute/URI if outside it)
    pub document_path: PathBuf,
    /// Capture time (ms since epoch)
    pub timestamp: u64,
    /// Operations in capture order
    pub operations: Vec<EditOperation>,
    /// Client that produced the batch
    pub origin_client_id: ClientId,
}

impl EditBatch {
    /// Create a batch stamped with the current time
    pub fn new(
        document_path: impl Into<PathBuf>,
        operations: Vec<EditOperation>,
        origin_client_id: ClientId,
    ) -> Self {
        Self {
            document_path: document_path.into(),
            timestamp: crate::types::now_millis(),
            operations,
            origin_client_id,
        }
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether there is nothing to replay
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_wire_shape() {
        let op = EditOperation::insert(Position::new(2, 5), "X");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["operation"], "insert");
        assert_eq!(json["position"]["line"], 2);
        assert_eq!(json["position"]["character"], 5);
        assert_eq!(json["text"], "X");

        let op = EditOperation::delete(Range::on_line(0, 0, 1), 1);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["operation"], "delete");
        assert_eq!(json["range"]["end"]["character"], 1);
        assert_eq!(json["length"], 1);
        assert!(json.get("text").is_none());
    }

    #[test]
    fn test_operation_rejects_unknown_kind() {
        let raw = r#"{"operation":"replace","position":{"line":0,"character":0},"text":"x"}"#;
        assert!(serde_json::from_str::<EditOperation>(raw).is_err());
    }

    #[test]
    fn test_operation_kind_checks() {
        let insert = EditOperation::insert(Position::new(1, 1), "a");
        assert!(insert.is_insert());
        assert!(!insert.is_delete());
        assert_eq!(insert.start(), Position::new(1, 1));

        let delete = EditOperation::delete(Range::on_line(3, 2, 4), 4);
        assert!(delete.is_delete());
        assert_eq!(delete.start(), Position::new(3, 2));
    }

    #[test]
    fn test_batch_camel_case_fields() {
        let batch = EditBatch::new(
            "src/a.txt",
            vec![EditOperation::insert(Position::default(), "hi")],
            ClientId::from_string("me"),
        );
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["documentPath"], "src/a.txt");
        assert_eq!(json["originClientId"], "me");
        assert_eq!(json["operations"].as_array().unwrap().len(), 1);
        assert_eq!(batch.len(), 1);
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_range_helpers() {
        let range = Range::on_line(4, 2, 3);
        assert_eq!(range.start, Position::new(4, 2));
        assert_eq!(range.end, Position::new(4, 5));
        assert!(!range.is_empty());
        assert!(Range::on_line(0, 0, 0).is_empty());

        let far = Range::on_line(0, u32::MAX - 1, 5);
        assert_eq!(far.end, Position::new(0, u32::MAX));
        assert!(!far.is_empty());
    }
}
