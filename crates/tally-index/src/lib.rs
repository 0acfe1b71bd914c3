//! Tally Index - in-memory task index and document reconciliation
//!
//! This crate holds the state side of tally: the index that maps task
//! identities to their records and locations, the reconciler that brings the
//! index and a document into agreement, the event bus that reports changes,
//! and the document store abstraction the engine reads and writes through.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │         Sync Engine (tally-daemon)          │
//! └──────────┬──────────────────────┬───────────┘
//!            │ reconcile + apply    │ read / write
//! ┌──────────▼───────────┐ ┌────────▼───────────┐
//! │  TaskIndex           │ │  DocumentStore     │
//! │  • identities        │ │  • FsDocumentStore │
//! │  • locations         │ │  • Memory...Store  │
//! │  • file hashes       │ └────────────────────┘
//! │  • EventBus          │
//! └──────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```
//! use std::path::Path;
//! use tally_core::SyncConfig;
//! use tally_index::{LiveDocument, Reconciler, TaskIndex};
//!
//! let mut index = TaskIndex::new();
//! let reconciler = Reconciler::new(&SyncConfig::default());
//!
//! let doc = LiveDocument::new(Path::new("inbox.md"), "- [ ] Buy milk");
//! let rec = reconciler.reconcile(&doc, &index).unwrap();
//! index.apply(&rec).unwrap();
//!
//! assert_eq!(rec.rewrite.as_deref(), Some("- [ ] Buy milk ^t1"));
//! assert_eq!(index.len(), 1);
//! ```

pub mod events;
pub mod index;
pub mod reconcile;
pub mod store;

pub use events::{Handler, IndexEvent, SubscriptionId};
pub use index::{ApplySummary, IndexSnapshot, TaskIndex};
pub use reconcile::{IdentityConflict, IndexMutation, LiveDocument, Reconciler, Reconciliation};
pub use store::{outline, DocumentStore, FsDocumentStore, MemoryDocumentStore};
