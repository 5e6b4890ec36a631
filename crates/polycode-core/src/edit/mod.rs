//! Edit operation model, capture and replay
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  EditCapture (local side)                                       │
//! │  └── DocumentChange{source: Local} ──► EditBatch                │
//! │                                                                 │
//! │  ReplayEngine (remote side)                                     │
//! │  └── EditBatch ──► DocumentStore::apply, one op at a time       │
//! │                                                                 │
//! │  DocumentStore                                                  │
//! │  ├── MemoryDocuments (tests)                                    │
//! │  └── FsDocuments (workspace on disk)                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod document;
pub mod operation;
pub mod replay;

pub use capture::EditCapture;
pub use document::{
    ContentChange, DocumentChange, DocumentStore, FsDocuments, MemoryDocuments, TextDocument,
};
pub use operation::{EditBatch, EditOperation, Position, Range};
pub use replay::{
    resolve_document_path, MissingDocumentPolicy, PositionalReplay, ReplayEngine, ReplayOutcome,
};
