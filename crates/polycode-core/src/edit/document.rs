//! Documents and document stores
//!
//! The host editor owns the real document model. This module gives the core a
//! narrow view of it through [`DocumentStore`]: open/create, read, apply one
//! operation as an atomic edit, and a stream of [`DocumentChange`]
//! notifications in the same (range, text, length) shape an editor emits.
//!
//! Two stores ship with the crate: [`MemoryDocuments`] for tests and
//! [`FsDocuments`], which edits files under a workspace directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use super::operation::{EditOperation, Position, Range};
use crate::error::{CollabError, CollabResult};
use crate::guard::EditSource;

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// A single contiguous-range change as reported by an editor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    /// Range that was replaced
    pub range: Range,
    /// Number of characters removed
    pub range_length: u32,
    /// Inserted text (empty for pure deletions)
    pub text: String,
}

/// Notification that a document changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    /// Absolute path of the document
    pub path: PathBuf,
    /// Changes in the order they were made
    pub changes: Vec<ContentChange>,
    /// Who made them
    pub source: EditSource,
}

impl ContentChange {
    /// The change an editor reports for an applied operation
    pub fn from_operation(op: &EditOperation) -> Self {
        match op {
            EditOperation::Insert { position, text } => Self {
                range: Range::new(*position, *position),
                range_length: 0,
                text: text.clone(),
            },
            EditOperation::Delete { range, length } => Self {
                range: *range,
                range_length: *length,
                text: String::new(),
            },
        }
    }
}

/// Plain text addressed by (line, character)
///
/// Characters are Unicode scalar values. Positions past the end of a line or
/// past the last line are clamped, the way editors validate positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextDocument {
    text: String,
}

impl TextDocument {
    /// Empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Document with initial content
    pub fn from_text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Current content
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Consume into content
    pub fn into_text(self) -> String {
        self.text
    }

    /// Number of lines (an empty document has one)
    pub fn line_count(&self) -> usize {
        self.text.split('\n').count()
    }

    /// Byte offset for a position, clamped to the document
    pub fn offset_at(&self, pos: Position) -> usize {
        let mut offset = 0;
        for _ in 0..pos.line {
            match self.text[offset..].find('\n') {
                Some(i) => offset += i + 1,
                None => return self.text.len(),
            }
        }
        let line_end = self.text[offset..]
            .find('\n')
            .map(|i| offset + i)
            .unwrap_or(self.text.len());
        let line = &self.text[offset..line_end];
        let within = line
            .char_indices()
            .nth(pos.character as usize)
            .map(|(i, _)| i)
            .unwrap_or(line.len());
        offset + within
    }

    /// Byte offset `chars` characters after `from`, clamped to the end
    fn advance(&self, from: usize, chars: u32) -> usize {
        self.text[from..]
            .char_indices()
            .nth(chars as usize)
            .map(|(i, _)| from + i)
            .unwrap_or(self.text.len())
    }

    /// Apply one operation
    pub fn apply(&mut self, op: &EditOperation) {
        match op {
            EditOperation::Insert { position, text } => {
                let at = self.offset_at(*position);
                self.text.insert_str(at, text);
            }
            EditOperation::Delete { range, length } => {
                let start = self.offset_at(range.start);
                let end = if range.is_empty() {
                    self.advance(start, *length)
                } else {
                    self.offset_at(range.end)
                };
                let (lo, hi) = if end < start { (end, start) } else { (start, end) };
                self.text.replace_range(lo..hi, "");
            }
        }
    }

    /// Apply operations in order
    pub fn apply_all<'a>(&mut self, ops: impl IntoIterator<Item = &'a EditOperation>) {
        for op in ops {
            self.apply(op);
        }
    }
}

/// Narrow interface to the host editor's documents
///
/// Paths passed in are already resolved (absolute). Each `apply` is one
/// atomic edit transaction and produces one [`DocumentChange`] tagged with the
/// given source.
pub trait DocumentStore: Send + Sync {
    /// Workspace root relative paths are resolved against
    fn root(&self) -> &Path;

    /// Whether the document exists
    fn exists(&self, path: &Path) -> bool;

    /// Create an empty document (no-op if it exists)
    fn create(&self, path: &Path) -> CollabResult<()>;

    /// Read the current content
    fn read(&self, path: &Path) -> CollabResult<String>;

    /// Apply one operation as an atomic edit
    fn apply(&self, path: &Path, op: &EditOperation, source: EditSource) -> CollabResult<()>;

    /// Subscribe to change notifications
    fn subscribe(&self) -> broadcast::Receiver<DocumentChange>;
}

/// Broadcast helper shared by the stores
#[derive(Debug)]
struct ChangeFeed {
    tx: broadcast::Sender<DocumentChange>,
}

impl ChangeFeed {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { tx }
    }

    fn emit(&self, path: &Path, op: &EditOperation, source: EditSource) {
        // No receivers is fine: nobody is listening for changes yet.
        let _ = self.tx.send(DocumentChange {
            path: path.to_path_buf(),
            changes: vec![ContentChange::from_operation(op)],
            source,
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.tx.subscribe()
    }
}

/// In-memory documents keyed by absolute path
#[derive(Debug)]
pub struct MemoryDocuments {
    root: PathBuf,
    docs: RwLock<HashMap<PathBuf, TextDocument>>,
    feed: ChangeFeed,
}

impl MemoryDocuments {
    /// Create an empty store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            docs: RwLock::new(HashMap::new()),
            feed: ChangeFeed::new(),
        }
    }

    /// Seed a document without emitting a change
    pub fn insert_document(&self, path: impl Into<PathBuf>, text: impl Into<String>) {
        self.docs
            .write()
            .insert(path.into(), TextDocument::from_text(text));
    }

    /// Number of documents held
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// Whether the store holds no documents
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

impl DocumentStore for MemoryDocuments {
    fn root(&self) -> &Path {
        &self.root
    }

    fn exists(&self, path: &Path) -> bool {
        self.docs.read().contains_key(path)
    }

    fn create(&self, path: &Path) -> CollabResult<()> {
        self.docs.write().entry(path.to_path_buf()).or_default();
        Ok(())
    }

    fn read(&self, path: &Path) -> CollabResult<String> {
        self.docs
            .read()
            .get(path)
            .map(|d| d.text().to_string())
            .ok_or_else(|| CollabError::DocumentNotFound(path.to_path_buf()))
    }

    fn apply(&self, path: &Path, op: &EditOperation, source: EditSource) -> CollabResult<()> {
        {
            let mut docs = self.docs.write();
            let doc = docs
                .get_mut(path)
                .ok_or_else(|| CollabError::DocumentNotFound(path.to_path_buf()))?;
            doc.apply(op);
        }
        self.feed.emit(path, op, source);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.feed.subscribe()
    }
}

/// Documents backed by files under a workspace directory
#[derive(Debug)]
pub struct FsDocuments {
    root: PathBuf,
    // Serializes read-modify-write cycles on files.
    write_lock: parking_lot::Mutex<()>,
    feed: ChangeFeed,
}

impl FsDocuments {
    /// Create a store for the workspace at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: parking_lot::Mutex::new(()),
            feed: ChangeFeed::new(),
        }
    }

    fn doc_error(path: &Path, e: impl std::fmt::Display) -> CollabError {
        CollabError::Document {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    }
}

impl DocumentStore for FsDocuments {
    fn root(&self) -> &Path {
        &self.root
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn create(&self, path: &Path) -> CollabResult<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Self::doc_error(path, e))?;
        }
        std::fs::write(path, "").map_err(|e| Self::doc_error(path, e))?;
        debug!(path = %path.display(), "Created empty document");
        Ok(())
    }

    fn read(&self, path: &Path) -> CollabResult<String> {
        if !path.is_file() {
            return Err(CollabError::DocumentNotFound(path.to_path_buf()));
        }
        std::fs::read_to_string(path).map_err(|e| Self::doc_error(path, e))
    }

    fn apply(&self, path: &Path, op: &EditOperation, source: EditSource) -> CollabResult<()> {
        {
            let _lock = self.write_lock.lock();
            let mut doc = TextDocument::from_text(self.read(path)?);
            doc.apply(op);
            std::fs::write(path, doc.text()).map_err(|e| Self::doc_error(path, e))?;
        }
        self.feed.emit(path, op, source);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.feed.subscribe()
    }
}
