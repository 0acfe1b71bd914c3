//! Sync engine for tally.
//!
//! This crate keeps a [`TaskIndex`] in step with a vault of documents. Change
//! notifications are classified, coalesced per document, and turned into
//! reconciliations whose results are committed to the index and, where a
//! document needs new identifiers or canonical text, written back.
//!
//! # Features
//!
//! - **Full scan on startup**: seeds the index from every tracked document
//!   and assigns identifiers to tasks that have none
//! - **Debouncing**: a burst of edits to one document collapses into one
//!   reconciliation of its latest text
//! - **Self-write suppression**: the engine's own write-backs do not come
//!   back around as user edits
//! - **Focus gating**: when the host reports a focused document, background
//!   changes wait until their document is focused
//! - **Immediate rename/delete**: structural changes bypass the queue
//! - **Propagation**: edits in a task's owning document are copied to every
//!   other document that references the task
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use tally_core::SyncConfig;
//! use tally_daemon::SyncEngine;
//! use tally_index::FsDocumentStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::load_or_default(Path::new("."))?;
//! let store = Arc::new(FsDocumentStore::new(".", config.clone())?);
//! let engine = Arc::new(SyncEngine::new(store, config));
//!
//! let (_sub, mut events) = engine.subscribe_channel().await;
//! let runner = engine.clone();
//! tokio::spawn(async move { runner.run().await });
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}", event.kind());
//! }
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod debounce;

pub use classifier::{CacheAction, ChangeClassifier, Disposition};
pub use debounce::Debouncer;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tally_core::{
    fingerprint, CacheStatus, Error, FileStateHash, Location, Result, SyncConfig, Task, TaskId,
    TaskInstance,
};
use tally_index::{
    DocumentStore, FsDocumentStore, IndexEvent, IndexSnapshot, LiveDocument, Reconciler,
    Reconciliation, SubscriptionId, TaskIndex,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Counts from a full vault scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub documents: usize,
    pub tasks: usize,
    pub instances: usize,
    /// Documents reconciled after seeding because they disagreed with it.
    pub reconciled: usize,
    /// Documents written back.
    pub rewritten: usize,
    pub failed: usize,
}

/// Current time on the runtime clock, so paused test time applies.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Keeps a task index in step with a document store.
pub struct SyncEngine<S> {
    store: Arc<S>,
    index: Arc<RwLock<TaskIndex>>,
    config: RwLock<SyncConfig>,
    classifier: Mutex<ChangeClassifier>,
    change_queue: Mutex<Debouncer<PathBuf>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl<S: DocumentStore> SyncEngine<S> {
    pub fn new(store: Arc<S>, config: SyncConfig) -> Self {
        Self {
            store,
            index: Arc::new(RwLock::new(TaskIndex::new())),
            classifier: Mutex::new(ChangeClassifier::new(config.focus_only)),
            change_queue: Mutex::new(Debouncer::new(config.settle_window())),
            config: RwLock::new(config),
            shutdown_tx: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Shared handle to the index, for read access from other tasks.
    pub fn index(&self) -> Arc<RwLock<TaskIndex>> {
        self.index.clone()
    }

    pub async fn config(&self) -> SyncConfig {
        self.config.read().await.clone()
    }

    async fn reconciler(&self) -> Reconciler {
        Reconciler::new(&*self.config.read().await)
    }

    // ===== Seeding =====

    /// Seeds the index from a full scan's instances. Copies in task files
    /// own their tasks, whatever order the scan listed them in.
    pub async fn initialize(&self, instances: Vec<TaskInstance>) -> usize {
        let config = self.config().await;
        self.index
            .write()
            .await
            .initialize_with_owners(instances, |path| config.is_task_file(path))
    }

    /// Reads every tracked document, seeds the index, then reconciles each
    /// document that does not agree with the seeded state: tasks without
    /// identifiers, identifiers repeated within a document, and copies that
    /// differ from their owner.
    pub async fn full_scan(&self) -> Result<ScanStats> {
        let reconciler = self.reconciler().await;
        let documents = self.store.list_documents().await?;
        info!("Scanning {} documents", documents.len());

        let mut stats = ScanStats {
            documents: documents.len(),
            ..ScanStats::default()
        };
        let mut instances = Vec::new();
        let mut scanned: Vec<(PathBuf, FileStateHash, bool)> = Vec::new();

        for path in &documents {
            let text = match self.store.read(path).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to read {}: {}", path.display(), e);
                    stats.failed += 1;
                    continue;
                }
            };
            let items = self.store.structure(path, &text);
            let doc = LiveDocument::new(path, &text).with_items(items.as_deref());
            let found = match reconciler.scan(&doc) {
                Ok(found) => found,
                Err(e) => {
                    warn!("{}; falling back to a line scan", e);
                    reconciler.scan(&doc.with_items(None))?
                }
            };

            let mut seen = HashSet::new();
            let needs_ids = found
                .iter()
                .any(|i| i.id.map_or(true, |id| !seen.insert(id)));
            scanned.push((path.clone(), fingerprint(&found), needs_ids));
            instances.extend(found);
        }

        self.initialize(instances).await;

        for (path, live_hash, needs_ids) in scanned {
            let agrees = {
                let index = self.index.read().await;
                index.file_state_hash(&path) == Some(&live_hash)
            };
            if agrees && !needs_ids {
                continue;
            }
            match self.reconcile_path(&path).await {
                Ok(rec) => {
                    stats.reconciled += 1;
                    if rec.needs_write() {
                        stats.rewritten += 1;
                    }
                }
                Err(e) => {
                    error!("Error reconciling {}: {}", path.display(), e);
                    stats.failed += 1;
                }
            }
        }

        let index = self.index.read().await;
        stats.tasks = index.len();
        stats.instances = index.instance_count();
        info!(
            "Full scan complete: {} tasks in {} documents ({} rewritten, {} errors)",
            stats.tasks, stats.documents, stats.rewritten, stats.failed
        );
        Ok(stats)
    }

    // ===== Queries =====

    pub async fn get_state(&self) -> IndexSnapshot {
        self.index.read().await.snapshot()
    }

    /// Belief state of one document, in line order.
    pub async fn get_file_task_state(&self, path: &Path) -> Vec<TaskInstance> {
        self.index.read().await.query_by_path(path)
    }

    /// One task with every location it appears at.
    pub async fn get_task(&self, id: TaskId) -> Option<(Task, Vec<Location>)> {
        let index = self.index.read().await;
        index
            .get(id)
            .map(|task| (task.clone(), index.instances_of(id)))
    }

    pub async fn get_file_state_hash(&self, path: &Path) -> Option<FileStateHash> {
        self.index.read().await.file_state_hash(path).cloned()
    }

    pub async fn set_file_state_hash(&self, path: &Path, hash: FileStateHash) {
        self.index.write().await.set_file_state_hash(path, hash);
    }

    pub async fn file_cache_status(&self, path: &Path) -> CacheStatus {
        self.classifier.lock().await.status(path)
    }

    /// Documents waiting for their settle window.
    pub async fn pending_changes(&self) -> usize {
        self.change_queue.lock().await.len()
    }

    // ===== Events =====

    pub async fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&IndexEvent) + Send + Sync + 'static,
    {
        self.index.write().await.subscribe(handler)
    }

    pub async fn subscribe_channel(
        &self,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<IndexEvent>) {
        self.index.write().await.subscribe_channel()
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.index.write().await.unsubscribe(id)
    }

    /// Replaces the configuration and tells subscribers.
    pub async fn update_settings(&self, config: SyncConfig) -> Result<()> {
        config.validate()?;

        {
            let current = self.config.read().await;
            if current.id_prefix != config.id_prefix || current.strict != config.strict {
                warn!(
                    "Identifier prefix or parser changed; existing identifiers may be reassigned"
                );
            }
        }

        self.change_queue
            .lock()
            .await
            .set_window(config.settle_window());
        self.classifier
            .lock()
            .await
            .set_focus_only(config.focus_only);
        *self.config.write().await = config;

        info!("Settings updated");
        self.index
            .write()
            .await
            .publish(&IndexEvent::SettingsUpdated);
        Ok(())
    }

    // ===== Change pipeline =====

    /// Classifies a host notification and acts on it: queue it, apply it
    /// immediately, or drop it.
    pub async fn trigger_file_cache_update(&self, action: CacheAction) -> Result<Disposition> {
        let config = self.config().await;
        let action = match self.normalize(action, &config).await {
            Ok(action) => action,
            Err(ignored) => {
                debug!("Ignoring change to untracked {}", ignored.display());
                return Ok(Disposition::Ignored(ignored));
            }
        };

        let active = self.store.active_document();
        let disposition = self
            .classifier
            .lock()
            .await
            .classify(action, active.as_deref());

        match &disposition {
            Disposition::Debounce(path) => {
                debug!("Queuing change: {}", path.display());
                self.change_queue.lock().await.touch(path.clone(), now());
            }
            Disposition::Delete(path) => self.handle_delete(path, &config).await,
            Disposition::Rename { from, to } => self.handle_rename(from, to, &config).await,
            Disposition::Swallowed(_) | Disposition::Deferred(_) | Disposition::Ignored(_) => {}
        }
        Ok(disposition)
    }

    /// Maps a notification onto tracked documents. Renames across the
    /// tracked boundary become a delete or a change; `Err` carries a path
    /// the engine has no interest in.
    async fn normalize(
        &self,
        action: CacheAction,
        config: &SyncConfig,
    ) -> std::result::Result<CacheAction, PathBuf> {
        match action {
            CacheAction::Changed(path) if !config.is_tracked(&path) => Err(path),
            CacheAction::Deleted(path) if !config.is_tracked(&path) => {
                // Could be a directory holding tracked documents.
                if self.indexed_under(&path).await.is_empty() {
                    Err(path)
                } else {
                    Ok(CacheAction::Deleted(path))
                }
            }
            CacheAction::Renamed { from, to } => {
                match (config.is_tracked(&from), config.is_tracked(&to)) {
                    (true, true) => Ok(CacheAction::Renamed { from, to }),
                    (true, false) => Ok(CacheAction::Deleted(from)),
                    (false, true) => Ok(CacheAction::Changed(to)),
                    (false, false) => {
                        if self.indexed_under(&from).await.is_empty() {
                            Err(from)
                        } else {
                            Ok(CacheAction::Renamed { from, to })
                        }
                    }
                }
            }
            other => Ok(other),
        }
    }

    /// Indexed documents at or below `path`.
    async fn indexed_under(&self, path: &Path) -> Vec<PathBuf> {
        self.index
            .read()
            .await
            .paths()
            .into_iter()
            .filter(|p| p.starts_with(path))
            .collect()
    }

    async fn handle_delete(&self, path: &Path, config: &SyncConfig) {
        let mut doomed = self.indexed_under(path).await;
        if doomed.is_empty() && config.is_tracked(path) {
            doomed.push(path.to_path_buf());
        }

        let mut queue = self.change_queue.lock().await;
        for doc in &doomed {
            queue.cancel(doc);
        }
        drop(queue);

        let mut index = self.index.write().await;
        for doc in doomed {
            let dropped = index.remove_path(&doc);
            info!(
                "Document deleted: {} ({} tasks removed)",
                doc.display(),
                dropped.len()
            );
        }
    }

    async fn handle_rename(&self, from: &Path, to: &Path, config: &SyncConfig) {
        let mut moves = Vec::new();
        for old in self.indexed_under(from).await {
            let new = match old.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            moves.push((old, new));
        }
        if moves.is_empty() {
            moves.push((from.to_path_buf(), to.to_path_buf()));
        }

        {
            let mut queue = self.change_queue.lock().await;
            for (old, new) in &moves {
                queue.rekey(old, new.clone());
            }
        }

        let mut index = self.index.write().await;
        for (old, new) in moves {
            if config.is_tracked(&new) {
                let moved = index.reindex_path(&old, &new);
                info!(
                    "Document renamed: {} -> {} ({} instances)",
                    old.display(),
                    new.display(),
                    moved
                );
            } else {
                index.remove_path(&old);
                info!("Document moved out of the vault: {}", old.display());
            }
        }
    }

    /// Reconciles every queued document whose settle window has passed.
    /// Returns how many were reconciled.
    pub async fn flush_settled(&self) -> usize {
        if let Some(active) = self.store.active_document() {
            let resumed = self.classifier.lock().await.resume(&active);
            if resumed {
                debug!("Resuming deferred changes for {}", active.display());
                self.change_queue.lock().await.touch(active, now());
            }
        }

        let settled = self.change_queue.lock().await.take_settled(now());
        self.process_changes(settled).await
    }

    /// Reconciles every queued document immediately.
    pub async fn flush_all(&self) -> usize {
        let pending = self.change_queue.lock().await.take_all();
        self.process_changes(pending).await
    }

    async fn process_changes(&self, paths: Vec<PathBuf>) -> usize {
        let mut reconciled = 0;
        for path in paths {
            debug!("Processing queued change: {}", path.display());
            match self.reconcile_path(&path).await {
                Ok(_) => reconciled += 1,
                Err(Error::DocumentNotFound(_)) => {
                    debug!("{} vanished before it settled", path.display());
                }
                Err(e) => error!("Error reconciling {}: {}", path.display(), e),
            }
        }
        reconciled
    }

    /// Reconciles one document now: reads it, computes the changes, writes
    /// it back if needed, commits to the index and propagates owner edits.
    ///
    /// A failed write leaves the index untouched, so the call can be retried.
    pub async fn reconcile_path(&self, path: &Path) -> Result<Reconciliation> {
        let text = self.store.read(path).await?;
        let items = self.store.structure(path, &text);
        let reconciler = self.reconciler().await;
        let mut doc = LiveDocument::new(path, &text).with_items(items.as_deref());

        let first = {
            let index = self.index.read().await;
            reconciler.reconcile(&doc, &index)
        };
        let rec = match first {
            Err(Error::StructuralInconsistency { line, line_count, .. }) => {
                warn!(
                    "Structure of {} points at line {} of {}; rescanning from scratch",
                    path.display(),
                    line + 1,
                    line_count
                );
                doc = doc.with_items(None);
                let mut index = self.index.write().await;
                index.clear_file_state_hash(path);
                reconciler.reconcile(&doc, &index)?
            }
            other => other?,
        };

        let mut index = self.index.write().await;
        let rec = if index.is_current(&rec) {
            rec
        } else {
            debug!("Index moved while reconciling {}; recomputing", path.display());
            reconciler.reconcile(&doc, &index)?
        };

        if let Some(rewrite) = &rec.rewrite {
            self.classifier.lock().await.mark_dirty(path);
            if let Err(e) = self.store.write(path, rewrite).await {
                self.classifier.lock().await.clear(path);
                error!("Write-back to {} failed: {}", path.display(), e);
                return Err(e);
            }
        }

        let summary = index.apply(&rec)?;
        if !rec.is_clean() {
            info!(
                "Reconciled {}: {} upserted, {} removed, {} new ids, {} conflicts",
                path.display(),
                summary.upserted,
                summary.removed,
                rec.assigned().count(),
                rec.conflicts.len()
            );
        }

        if !rec.propagate.is_empty() {
            self.propagate(&mut index, &reconciler, &rec).await;
        }
        Ok(rec)
    }

    /// Rewrites other documents' copies of tasks whose canonical values
    /// changed in `rec`.
    async fn propagate(&self, index: &mut TaskIndex, reconciler: &Reconciler, rec: &Reconciliation) {
        let mut targets: BTreeMap<PathBuf, Vec<(usize, TaskId)>> = BTreeMap::new();
        for &id in &rec.propagate {
            for location in index.instances_of(id) {
                if location.path != rec.path {
                    targets
                        .entry(location.path)
                        .or_default()
                        .push((location.line, id));
                }
            }
        }

        for (path, lines) in targets {
            match self.rewrite_instances(index, reconciler, &path, &lines).await {
                Ok(true) => debug!("Propagated {} tasks to {}", lines.len(), path.display()),
                Ok(false) => {}
                Err(e) => {
                    warn!("Could not propagate to {}: {}", path.display(), e);
                    index.clear_file_state_hash(&path);
                }
            }
        }
    }

    async fn rewrite_instances(
        &self,
        index: &mut TaskIndex,
        reconciler: &Reconciler,
        path: &Path,
        lines: &[(usize, TaskId)],
    ) -> Result<bool> {
        let text = self.store.read(path).await?;
        let updated = reconciler.render_instances(path, &text, index, lines)?;
        if updated == text {
            return Ok(false);
        }

        self.classifier.lock().await.mark_dirty(path);
        if let Err(e) = self.store.write(path, &updated).await {
            self.classifier.lock().await.clear(path);
            return Err(e);
        }

        let hash = fingerprint(&index.query_by_path(path));
        index.set_file_state_hash(path, hash);
        Ok(true)
    }

    /// Stop the engine gracefully.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping sync engine");

        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }

        Ok(())
    }

    /// Releases every subscription.
    pub async fn shutdown(&self) {
        self.index.write().await.shutdown();
    }
}

impl SyncEngine<FsDocumentStore> {
    /// Scans the vault, then watches it until [`SyncEngine::stop`] is called.
    pub async fn run(&self) -> Result<()> {
        let root = self.store.root().to_path_buf();
        info!("Starting sync engine, watching: {}", root.display());

        info!("Performing full scan on startup...");
        if let Err(e) = self.full_scan().await {
            error!("Full scan failed: {}", e);
            return Err(e);
        }

        // Create channels for file system events
        let (fs_tx, fs_rx) = std::sync::mpsc::channel();
        let (event_tx, mut event_rx) = mpsc::channel(100);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Err(e) = fs_tx.send(res) {
                    error!("Failed to send file event: {}", e);
                }
            },
            Config::default(),
        )
        .map_err(|e| Error::Watcher(e.to_string()))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Watcher(e.to_string()))?;

        // Forward events from the watcher thread to the async loop
        tokio::task::spawn_blocking(move || {
            while let Ok(res) = fs_rx.recv() {
                match res {
                    Ok(event) => {
                        if event_tx.blocking_send(event).is_err() {
                            break; // Channel closed
                        }
                    }
                    Err(e) => {
                        error!("File watcher error: {}", e);
                    }
                }
            }
        });

        let settle = self.config().await.settle_window();
        let mut tick = tokio::time::interval((settle / 4).max(Duration::from_millis(100)));
        // A move whose destination never shows up left the vault.
        let mut moved_out: Debouncer<PathBuf> = Debouncer::new(settle);

        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    for action in self.translate(event, &mut moved_out) {
                        if let Err(e) = self.trigger_file_cache_update(action).await {
                            error!("Error handling file event: {}", e);
                        }
                    }
                }
                _ = tick.tick() => {
                    for path in moved_out.take_settled(now()) {
                        if let Err(e) = self.trigger_file_cache_update(CacheAction::Deleted(path)).await {
                            error!("Error handling file event: {}", e);
                        }
                    }
                    self.flush_settled().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        info!("Processing remaining queued changes...");
        self.flush_all().await;

        drop(watcher);
        info!("Sync engine stopped");
        Ok(())
    }

    /// Turns a watcher event into notifications with vault-relative paths.
    fn translate(&self, event: Event, moved_out: &mut Debouncer<PathBuf>) -> Vec<CacheAction> {
        debug!("Handling file event: {:?}", event);

        let paths: Vec<PathBuf> = event
            .paths
            .iter()
            .filter_map(|p| self.store.to_relative(p))
            .collect();

        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in paths {
                    moved_out.touch(path, now());
                }
                Vec::new()
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [from, to] = paths.as_slice() {
                    moved_out.cancel(from);
                    vec![CacheAction::Renamed {
                        from: from.clone(),
                        to: to.clone(),
                    }]
                } else {
                    Vec::new()
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => paths
                .into_iter()
                .map(|path| {
                    if self.store.root().join(&path).exists() {
                        CacheAction::Changed(path)
                    } else {
                        CacheAction::Deleted(path)
                    }
                })
                .collect(),
            EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any) => {
                paths.into_iter().map(CacheAction::Changed).collect()
            }
            EventKind::Remove(_) => paths.into_iter().map(CacheAction::Deleted).collect(),
            _ => {
                // Ignore other event types (access, metadata changes, etc.)
                Vec::new()
            }
        }
    }
}
