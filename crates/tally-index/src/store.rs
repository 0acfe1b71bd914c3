//! Document storage.
//!
//! The engine never touches documents directly; it goes through a
//! [`DocumentStore`]. [`FsDocumentStore`] serves a vault directory on disk,
//! [`MemoryDocumentStore`] is for hosts that keep documents in memory (and
//! for tests).
//!
//! All paths crossing this boundary are relative to the vault root.

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, RwLock};
use tally_core::{Error, ListItem, Result, SyncConfig};
use tokio::fs;
use tracing::{debug, warn};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every tracked document, sorted.
    async fn list_documents(&self) -> Result<Vec<PathBuf>>;

    /// Full text of a document. Missing documents yield
    /// [`Error::DocumentNotFound`].
    async fn read(&self, path: &Path) -> Result<String>;

    /// Replaces a document's text.
    async fn write(&self, path: &Path, text: &str) -> Result<()>;

    /// Structural parse of the document's list items, if the host has one.
    /// Returning `None` makes the reconciler fall back to a line scan.
    fn structure(&self, path: &Path, text: &str) -> Option<Vec<ListItem>>;

    /// Document the user is looking at. `None` means the host has no notion
    /// of focus.
    fn active_document(&self) -> Option<PathBuf>;
}

static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<indent>[ \t]*)(?:[-*+]|\d{1,9}[.)])(?:[ \t]|$)").expect("list item pattern is valid")
});

static FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ \t]*(```|~~~)").expect("fence pattern is valid"));

/// Indentation-based outline of a document's list items.
///
/// An item's parent is the closest preceding item with smaller indentation.
/// Tabs count as four columns. Unindented prose ends the current list;
/// blank lines and fenced code blocks do not produce items.
pub fn outline(text: &str) -> Vec<ListItem> {
    let mut items = Vec::new();
    let mut stack: Vec<(usize, usize)> = Vec::new();
    let mut in_fence = false;

    for (line_no, line) in text.split('\n').enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if FENCE.is_match(line) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || line.trim().is_empty() {
            continue;
        }

        let Some(caps) = LIST_ITEM.captures(line) else {
            if !line.starts_with([' ', '\t']) {
                stack.clear();
            }
            continue;
        };

        let width = caps
            .name("indent")
            .map(|m| m.as_str().chars().map(|c| if c == '\t' { 4 } else { 1 }).sum())
            .unwrap_or(0);

        while stack.last().is_some_and(|&(indent, _)| indent >= width) {
            stack.pop();
        }
        items.push(ListItem::new(line_no, stack.last().map(|&(_, line)| line)));
        stack.push((width, line_no));
    }

    items
}

/// A vault directory on disk.
#[derive(Debug)]
pub struct FsDocumentStore {
    root: PathBuf,
    config: SyncConfig,
    active: RwLock<Option<PathBuf>>,
}

impl FsDocumentStore {
    /// Opens a vault. The root is canonicalized so watcher paths can be
    /// mapped back with [`FsDocumentStore::to_relative`].
    pub fn new(root: impl AsRef<Path>, config: SyncConfig) -> Result<Self> {
        let root = std::fs::canonicalize(root.as_ref())?;
        debug!("Opened vault at {}", root.display());
        Ok(Self {
            root,
            config,
            active: RwLock::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Marks a document as focused, or clears focus with `None`.
    pub fn set_active(&self, path: Option<PathBuf>) {
        match self.active.write() {
            Ok(mut guard) => *guard = path,
            Err(poisoned) => *poisoned.into_inner() = path,
        }
    }

    /// Maps an absolute path under the vault to a vault-relative one.
    pub fn to_relative(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }

    fn full_path(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn list_documents(&self) -> Result<Vec<PathBuf>> {
        debug!("Listing documents under {}", self.root.display());

        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let Some(relative) = self.to_relative(&path) else {
                    continue;
                };
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    let ignored = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| self.config.ignore_dirs.iter().any(|d| d == n));
                    if !ignored {
                        pending.push(path);
                    }
                } else if file_type.is_file() && self.config.is_tracked(&relative) {
                    found.push(relative);
                }
            }
        }

        found.sort();
        debug!("Found {} documents", found.len());
        Ok(found)
    }

    async fn read(&self, path: &Path) -> Result<String> {
        match fs::read_to_string(self.full_path(path)).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::DocumentNotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &Path, text: &str) -> Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        debug!("Writing document: {}", path.display());
        fs::write(&full, text).await.map_err(|e| {
            warn!("Failed to write {}: {}", path.display(), e);
            e.into()
        })
    }

    fn structure(&self, _path: &Path, text: &str) -> Option<Vec<ListItem>> {
        Some(outline(text))
    }

    fn active_document(&self) -> Option<PathBuf> {
        match self.active.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Documents held in memory.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<BTreeMap<PathBuf, String>>,
    active: Mutex<Option<PathBuf>>,
    writes: Mutex<Vec<PathBuf>>,
    fail_writes: Mutex<bool>,
    structured: bool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that reports an outline for every document.
    pub fn structured() -> Self {
        Self {
            structured: true,
            ..Self::default()
        }
    }

    pub fn insert(&self, path: impl Into<PathBuf>, text: impl Into<String>) {
        lock(&self.docs).insert(path.into(), text.into());
    }

    pub fn remove(&self, path: &Path) -> Option<String> {
        lock(&self.docs).remove(path)
    }

    pub fn rename(&self, from: &Path, to: impl Into<PathBuf>) -> bool {
        let mut docs = lock(&self.docs);
        match docs.remove(from) {
            Some(text) => {
                docs.insert(to.into(), text);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, path: &Path) -> Option<String> {
        lock(&self.docs).get(path).cloned()
    }

    pub fn set_active(&self, path: Option<PathBuf>) {
        *lock(&self.active) = path;
    }

    /// Paths written through [`DocumentStore::write`], in order.
    pub fn writes(&self) -> Vec<PathBuf> {
        lock(&self.writes).clone()
    }

    /// Makes every subsequent write fail with [`Error::Store`].
    pub fn fail_writes(&self, fail: bool) {
        *lock(&self.fail_writes) = fail;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn list_documents(&self) -> Result<Vec<PathBuf>> {
        Ok(lock(&self.docs).keys().cloned().collect())
    }

    async fn read(&self, path: &Path) -> Result<String> {
        self.get(path)
            .ok_or_else(|| Error::DocumentNotFound(path.to_path_buf()))
    }

    async fn write(&self, path: &Path, text: &str) -> Result<()> {
        if *lock(&self.fail_writes) {
            return Err(Error::Store(format!("write to {} refused", path.display())));
        }
        lock(&self.docs).insert(path.to_path_buf(), text.to_string());
        lock(&self.writes).push(path.to_path_buf());
        Ok(())
    }

    fn structure(&self, _path: &Path, text: &str) -> Option<Vec<ListItem>> {
        self.structured.then(|| outline(text))
    }

    fn active_document(&self) -> Option<PathBuf> {
        lock(&self.active).clone()
    }
}
