//! Core data structures for the tally task index.
//!
//! A [`Task`] is the identity-level record held in the index arena. A
//! [`TaskInstance`] is one textual occurrence of a task at a [`Location`]
//! (document path plus zero-based line number). Parent/child links are
//! stored as [`TaskId`]s, never as references.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Stable, process-unique identity of a task. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u32);

impl TaskId {
    /// The first identity handed out in an empty index.
    pub const FIRST: TaskId = TaskId(1);

    /// Returns `None` for zero, which is never a valid identity.
    pub fn new(raw: u32) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// The identity that follows this one, or `None` at the end of the
    /// identity space.
    pub fn next(self) -> Option<TaskId> {
        self.0.checked_add(1).map(TaskId)
    }

    /// Renders the identity as a block identifier body, without the caret.
    pub fn to_block_id(self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }

    /// Decodes a block identifier body written by [`TaskId::to_block_id`].
    ///
    /// Identifiers with a different prefix, trailing garbage or a zero
    /// number belong to someone else and yield `None`.
    pub fn from_block_id(block_id: &str, prefix: &str) -> Option<Self> {
        let digits = block_id.strip_prefix(prefix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u32>().ok().and_then(Self::new)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        s.trim()
            .parse::<u32>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| crate::Error::InvalidTaskId(s.to_string()))
    }
}

/// One line of one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub path: PathBuf,
    /// Zero-based line number.
    pub line: usize,
}

impl Location {
    pub fn new(path: impl Into<PathBuf>, line: usize) -> Self {
        Self {
            path: path.into(),
            line,
        }
    }

    pub fn is_in(&self, path: &Path) -> bool {
        self.path == path
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), self.line + 1)
    }
}

/// Identity-level task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub complete: bool,
    pub text: String,

    /// Sub-task identities in first-seen order, without duplicates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,

    /// Document that owns the authoritative copy of this task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<PathBuf>,
}

impl Task {
    pub fn new(id: TaskId, complete: bool, text: impl Into<String>) -> Self {
        Self {
            id,
            complete,
            text: text.into(),
            children: Vec::new(),
            parent: None,
            origin: None,
        }
    }

    /// Adds a child, keeping first-seen order. Returns false if already present.
    pub fn add_child(&mut self, child: TaskId) -> bool {
        if child == self.id || self.children.contains(&child) {
            return false;
        }
        self.children.push(child);
        true
    }

    pub fn remove_child(&mut self, child: TaskId) {
        self.children.retain(|c| *c != child);
    }

    /// True when completion and text agree with the given values.
    pub fn matches(&self, complete: bool, text: &str) -> bool {
        self.complete == complete && self.text == text
    }
}

/// One occurrence of a task's text in one document.
///
/// `id` is `None` for a task that has not been assigned an identity yet; such
/// an instance can only be addressed by its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub location: Location,
    pub id: Option<TaskId>,
    pub complete: bool,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
}

impl TaskInstance {
    pub fn new(location: Location, id: Option<TaskId>, complete: bool, text: impl Into<String>) -> Self {
        Self {
            location,
            id,
            complete,
            text: text.into(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: Option<TaskId>) -> Self {
        self.parent = parent;
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.is_none()
    }
}

/// Per-document self-write suppression state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// The index's belief matches the document's last observed content.
    #[default]
    Clean,
    /// The engine just wrote this document; the next change notification
    /// for it is its own echo and must be swallowed once.
    Dirty,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStatus::Clean => write!(f, "clean"),
            CacheStatus::Dirty => write!(f, "dirty"),
        }
    }
}

/// A list item as reported by a structural parse of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    /// Zero-based line the item starts on.
    pub line: usize,
    /// Line of the enclosing list item, if nested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<usize>,
}

impl ListItem {
    pub fn new(line: usize, parent: Option<usize>) -> Self {
        Self { line, parent }
    }
}
