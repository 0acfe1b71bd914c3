//! The in-memory task index.
//!
//! ```text
//!   tasks:      TaskId   ──► Task { complete, text, children, parent, origin }
//!   locations:  Location ──► TaskId        (path + line, each key unique)
//!   instances:  TaskId   ──► {Location}    (reverse of `locations`)
//!   hashes:     path     ──► FileStateHash (last reconciled fingerprint)
//! ```
//!
//! All mutation goes through the methods below so the invariants hold at a
//! single boundary: every task either has at least one instance or is a
//! placeholder kept alive by its children, and `next_id` stays greater
//! than every identity in the arena until the identity space runs out.

use crate::events::{EventBus, IndexEvent, SubscriptionId};
use crate::reconcile::{IndexMutation, Reconciliation};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tally_core::{fingerprint, Error, FileStateHash, Location, Result, Task, TaskId, TaskInstance};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Point-in-time copy of the index, for UI and CLI consumers.
#[derive(Debug, Clone, Serialize)]
pub struct IndexSnapshot {
    pub tasks: Vec<Task>,
    pub instances: Vec<TaskInstance>,
    pub next_id: TaskId,
}

/// What a call to [`TaskIndex::apply`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub upserted: usize,
    pub removed: usize,
    /// Tasks that lost their last instance and were dropped from the arena.
    pub dropped_tasks: Vec<TaskId>,
}

impl ApplySummary {
    pub fn is_empty(&self) -> bool {
        self.upserted == 0 && self.removed == 0
    }
}

#[derive(Debug)]
pub struct TaskIndex {
    tasks: HashMap<TaskId, Task>,
    locations: BTreeMap<Location, TaskId>,
    instances: HashMap<TaskId, BTreeSet<Location>>,
    hashes: HashMap<PathBuf, FileStateHash>,
    next_id: TaskId,
    bus: EventBus,
}

impl Default for TaskIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskIndex {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            locations: BTreeMap::new(),
            instances: HashMap::new(),
            hashes: HashMap::new(),
            next_id: TaskId::FIRST,
            bus: EventBus::new(),
        }
    }

    // ===== Seeding =====

    /// Replaces the whole index with the given instances from a full scan.
    ///
    /// Anonymous instances are skipped; they get identities when their
    /// document is reconciled. Subscriptions survive. Every document that
    /// contributed an instance gets its belief fingerprint stored.
    pub fn initialize(&mut self, instances: Vec<TaskInstance>) -> usize {
        self.initialize_with_owners(instances, |_| false)
    }

    /// Like [`TaskIndex::initialize`], but instances in documents for which
    /// `owns` returns true are seeded last and claim their task's origin, so
    /// the canonical copy wins whatever order the scan produced.
    pub fn initialize_with_owners<F>(&mut self, instances: Vec<TaskInstance>, owns: F) -> usize
    where
        F: Fn(&Path) -> bool,
    {
        self.tasks.clear();
        self.locations.clear();
        self.instances.clear();
        self.hashes.clear();
        self.next_id = TaskId::FIRST;

        let paths: BTreeSet<PathBuf> = instances.iter().map(|i| i.location.path.clone()).collect();
        let (owned, rest): (Vec<_>, Vec<_>) = instances
            .into_iter()
            .filter(|i| !i.is_anonymous())
            .partition(|i| owns(&i.location.path));

        let mut seeded = 0;
        for (instance, claim) in rest
            .iter()
            .map(|i| (i, false))
            .chain(owned.iter().map(|i| (i, true)))
        {
            let mut displaced = Vec::new();
            if self.upsert_inner(instance, claim, &mut displaced).is_ok() {
                seeded += 1;
            }
            self.settle_all(displaced, &mut Vec::new());
        }

        for path in paths {
            let hash = fingerprint(&self.query_by_path(&path));
            self.hashes.insert(path, hash);
        }

        info!(
            "Index initialized: {} tasks, {} instances",
            self.tasks.len(),
            self.locations.len()
        );
        self.bus.publish(&IndexEvent::TaskSetInitialized {
            tasks: self.tasks.len(),
            instances: self.locations.len(),
        });
        seeded
    }

    // ===== Mutation =====

    /// Maps the instance's location to its identity and merges its fields
    /// into the task record, creating the record if the identity is new.
    pub fn upsert(&mut self, instance: TaskInstance) -> Result<TaskId> {
        let mut displaced = Vec::new();
        let id = self.upsert_inner(&instance, false, &mut displaced)?;
        self.settle_all(displaced, &mut Vec::new());
        self.bus.publish(&IndexEvent::InstancesModified {
            path: instance.location.path.clone(),
            upserted: vec![instance],
            removed: Vec::new(),
        });
        Ok(id)
    }

    /// Removes one location. The task goes with it if that was its last
    /// instance and it has no children.
    pub fn remove(&mut self, location: &Location) -> Option<TaskId> {
        let mut dropped = Vec::new();
        let id = self.remove_inner(location, &mut dropped)?;
        self.bus.publish(&IndexEvent::InstancesModified {
            path: location.path.clone(),
            upserted: Vec::new(),
            removed: vec![location.clone()],
        });
        Some(id)
    }

    /// Moves every location under `old_path` to `new_path`, keeping line
    /// numbers and identities. Returns the number of locations moved.
    pub fn reindex_path(&mut self, old_path: &Path, new_path: &Path) -> usize {
        let moved: Vec<(Location, TaskId)> = self
            .path_range(old_path)
            .map(|(loc, id)| (loc.clone(), *id))
            .collect();

        for (old_loc, id) in &moved {
            self.locations.remove(old_loc);
            let new_loc = Location::new(new_path, old_loc.line);
            self.locations.insert(new_loc.clone(), *id);
            if let Some(set) = self.instances.get_mut(id) {
                set.remove(old_loc);
                set.insert(new_loc);
            }
        }

        for task in self.tasks.values_mut() {
            if task.origin.as_deref() == Some(old_path) {
                task.origin = Some(new_path.to_path_buf());
            }
        }

        if let Some(hash) = self.hashes.remove(old_path) {
            self.hashes.insert(new_path.to_path_buf(), hash);
        }

        debug!(
            "Reindexed {} locations: {} -> {}",
            moved.len(),
            old_path.display(),
            new_path.display()
        );
        self.bus.publish(&IndexEvent::FileRenamed {
            from: old_path.to_path_buf(),
            to: new_path.to_path_buf(),
        });
        moved.len()
    }

    /// Removes every instance under `path`. Returns the tasks that were
    /// dropped because they had no instances left.
    pub fn remove_path(&mut self, path: &Path) -> Vec<TaskId> {
        let doomed: Vec<Location> = self.path_range(path).map(|(loc, _)| loc.clone()).collect();

        let mut dropped = Vec::new();
        for location in &doomed {
            self.remove_inner(location, &mut dropped);
        }
        self.hashes.remove(path);

        debug!(
            "Removed {} instances under {} ({} tasks dropped)",
            doomed.len(),
            path.display(),
            dropped.len()
        );
        self.bus.publish(&IndexEvent::FileDeleted {
            path: path.to_path_buf(),
            removed_tasks: dropped.clone(),
        });
        dropped
    }

    /// Commits a reconciliation computed against this index.
    ///
    /// Fails with [`Error::StaleReconciliation`] if the document's belief
    /// state or the identity counter moved since the result was computed;
    /// nothing is modified in that case.
    pub fn apply(&mut self, rec: &Reconciliation) -> Result<ApplySummary> {
        if !self.is_current(rec) {
            warn!(
                "Discarding stale reconciliation of {} (computed against {})",
                rec.path.display(),
                rec.base_hash
            );
            return Err(Error::StaleReconciliation(rec.path.clone()));
        }

        let mut summary = ApplySummary::default();
        let mut upserted = Vec::new();
        let mut removed = Vec::new();
        // Tasks pushed off a line may land on another line later in the
        // same batch, so they are only collected once every mutation is in.
        let mut displaced = Vec::new();

        for mutation in &rec.mutations {
            match mutation {
                IndexMutation::Remove { location } => {
                    if self.remove_inner(location, &mut summary.dropped_tasks).is_some() {
                        summary.removed += 1;
                        removed.push(location.clone());
                    }
                }
                IndexMutation::Upsert {
                    instance,
                    claim_origin,
                } => {
                    self.upsert_inner(instance, *claim_origin, &mut displaced)?;
                    summary.upserted += 1;
                    upserted.push(instance.clone());
                }
            }
        }

        self.settle_all(displaced, &mut summary.dropped_tasks);

        if rec.next_id > self.next_id {
            self.next_id = rec.next_id;
        }
        self.hashes.insert(rec.path.clone(), rec.live_hash.clone());

        if !summary.is_empty() {
            self.bus.publish(&IndexEvent::InstancesModified {
                path: rec.path.clone(),
                upserted,
                removed,
            });
        }
        Ok(summary)
    }

    /// True if `rec` was computed against the index as it is now.
    pub fn is_current(&self, rec: &Reconciliation) -> bool {
        self.next_id == rec.first_new_id
            && fingerprint(&self.query_by_path(&rec.path)) == rec.base_hash
    }

    // ===== Queries =====

    /// Belief state of one document, in line order.
    pub fn query_by_path(&self, path: &Path) -> Vec<TaskInstance> {
        self.path_range(path)
            .filter_map(|(loc, id)| {
                let task = self.tasks.get(id)?;
                Some(
                    TaskInstance::new(loc.clone(), Some(*id), task.complete, task.text.clone())
                        .with_parent(task.parent),
                )
            })
            .collect()
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn id_at(&self, location: &Location) -> Option<TaskId> {
        self.locations.get(location).copied()
    }

    pub fn get_by_location(&self, location: &Location) -> Option<&Task> {
        self.id_at(location).and_then(|id| self.tasks.get(&id))
    }

    /// Every location where `id` appears, ordered by path then line.
    pub fn instances_of(&self, id: TaskId) -> Vec<Location> {
        self.instances
            .get(&id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Documents that hold at least one instance.
    pub fn paths(&self) -> BTreeSet<PathBuf> {
        self.locations.keys().map(|loc| loc.path.clone()).collect()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn instance_count(&self) -> usize {
        self.locations.len()
    }

    /// The identity the next allocation will hand out.
    pub fn next_id(&self) -> TaskId {
        self.next_id
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);

        let instances = self
            .locations
            .iter()
            .filter_map(|(loc, id)| {
                let task = self.tasks.get(id)?;
                Some(TaskInstance::new(
                    loc.clone(),
                    Some(*id),
                    task.complete,
                    task.text.clone(),
                ))
            })
            .collect();

        IndexSnapshot {
            tasks,
            instances,
            next_id: self.next_id,
        }
    }

    // ===== File state bookkeeping =====

    pub fn file_state_hash(&self, path: &Path) -> Option<&FileStateHash> {
        self.hashes.get(path)
    }

    pub fn set_file_state_hash(&mut self, path: &Path, hash: FileStateHash) {
        self.hashes.insert(path.to_path_buf(), hash);
    }

    /// Forgets the stored fingerprint so the next reconciliation of `path`
    /// starts from scratch.
    pub fn clear_file_state_hash(&mut self, path: &Path) -> Option<FileStateHash> {
        self.hashes.remove(path)
    }

    // ===== Events =====

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&IndexEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(handler)
    }

    pub fn subscribe_channel(&mut self) -> (SubscriptionId, mpsc::UnboundedReceiver<IndexEvent>) {
        self.bus.subscribe_channel()
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn publish(&mut self, event: &IndexEvent) {
        self.bus.publish(event);
    }

    /// Releases all subscriptions.
    pub fn shutdown(&mut self) {
        self.bus.clear();
    }

    // ===== Internals =====

    fn path_range<'a>(&'a self, path: &Path) -> impl Iterator<Item = (&'a Location, &'a TaskId)> {
        let start = Location::new(path, 0);
        let end = Location::new(path, usize::MAX);
        self.locations.range(start..=end)
    }

    /// Writes one instance. A different task that held the location is
    /// detached and pushed onto `displaced`; the caller settles it.
    fn upsert_inner(
        &mut self,
        instance: &TaskInstance,
        claim_origin: bool,
        displaced: &mut Vec<TaskId>,
    ) -> Result<TaskId> {
        let id = instance.id.ok_or_else(|| {
            Error::InvalidTaskId(format!("anonymous instance at {}", instance.location))
        })?;
        let location = &instance.location;

        // A location holds one identity; detach whatever was there before.
        if let Some(previous) = self.locations.get(location).copied() {
            if previous != id {
                self.detach(location);
                displaced.push(previous);
            }
        }

        self.locations.insert(location.clone(), id);
        self.instances.entry(id).or_default().insert(location.clone());

        let task = self
            .tasks
            .entry(id)
            .or_insert_with(|| Task::new(id, instance.complete, String::new()));
        task.complete = instance.complete;
        task.text = instance.text.clone();
        if task.origin.is_none() || claim_origin {
            task.origin = Some(location.path.clone());
        }

        // Nesting is taken from the owning document only.
        let owns_nesting = task.origin.as_deref() == Some(location.path.as_path());
        let old_parent = task.parent;
        if owns_nesting && old_parent != instance.parent {
            task.parent = instance.parent;
            if let Some(old) = old_parent {
                if let Some(parent) = self.tasks.get_mut(&old) {
                    parent.remove_child(id);
                }
                displaced.push(old);
            }
            if let Some(new) = instance.parent {
                self.tasks
                    .entry(new)
                    .or_insert_with(|| Task::new(new, false, String::new()))
                    .add_child(id);
                self.bump_next_id(new);
            }
        }

        self.bump_next_id(id);
        Ok(id)
    }

    fn remove_inner(&mut self, location: &Location, dropped: &mut Vec<TaskId>) -> Option<TaskId> {
        let id = self.detach(location)?;
        self.settle(id, dropped);
        Some(id)
    }

    /// Unmaps one location without touching the task record.
    fn detach(&mut self, location: &Location) -> Option<TaskId> {
        let id = self.locations.remove(location)?;
        if let Some(set) = self.instances.get_mut(&id) {
            set.remove(location);
        }
        Some(id)
    }

    fn settle_all(&mut self, ids: Vec<TaskId>, dropped: &mut Vec<TaskId>) {
        for id in ids {
            self.settle(id, dropped);
        }
    }

    /// Restores the invariants for a task that just lost a location: hand
    /// ownership to a surviving copy, or collect the task if none is left.
    fn settle(&mut self, id: TaskId, dropped: &mut Vec<TaskId>) {
        let remaining = self
            .instances
            .get(&id)
            .and_then(|set| set.iter().next().cloned());

        match remaining {
            Some(next_home) => {
                // Hand ownership to another document if the owner lost its copy.
                let owner_still_holds = self
                    .tasks
                    .get(&id)
                    .and_then(|task| task.origin.as_deref())
                    .is_some_and(|origin| {
                        self.instances
                            .get(&id)
                            .is_some_and(|set| set.iter().any(|l| l.path == origin))
                    });
                if !owner_still_holds {
                    if let Some(task) = self.tasks.get_mut(&id) {
                        task.origin = Some(next_home.path);
                    }
                }
            }
            None => {
                self.instances.remove(&id);
                self.collect_if_orphan(id, dropped);
            }
        }
    }

    /// Drops `id` if it has no instances and no children, then walks up to
    /// its parent, which may have just become an orphan placeholder.
    fn collect_if_orphan(&mut self, id: TaskId, dropped: &mut Vec<TaskId>) {
        let mut current = Some(id);
        while let Some(id) = current.take() {
            let has_instances = self.instances.get(&id).is_some_and(|s| !s.is_empty());
            let Some(task) = self.tasks.get(&id) else {
                break;
            };
            if has_instances || !task.children.is_empty() {
                break;
            }

            let parent = task.parent;
            self.tasks.remove(&id);
            self.instances.remove(&id);
            dropped.push(id);
            debug!("Dropped task {} (no instances left)", id);

            if let Some(parent_id) = parent {
                if let Some(parent_task) = self.tasks.get_mut(&parent_id) {
                    parent_task.remove_child(id);
                }
                current = Some(parent_id);
            }
        }
    }

    /// Keeps the counter above `seen`. The last representable identity has
    /// no successor; the counter stays put and allocation skips taken ids.
    fn bump_next_id(&mut self, seen: TaskId) {
        if seen >= self.next_id {
            if let Some(after) = seen.next() {
                self.next_id = after;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn id(n: u32) -> TaskId {
        TaskId::new(n).unwrap()
    }

    fn inst(path: &str, line: usize, n: u32, complete: bool, text: &str) -> TaskInstance {
        TaskInstance::new(Location::new(path, line), Some(id(n)), complete, text)
    }

    #[test]
    fn test_upsert_creates_task() {
        let mut index = TaskIndex::new();
        index.upsert(inst("a.md", 0, 1, false, "Buy milk")).unwrap();

        let task = index.get(id(1)).unwrap();
        assert_eq!(task.text, "Buy milk");
        assert_eq!(task.origin.as_deref(), Some(Path::new("a.md")));
        assert_eq!(index.id_at(&Location::new("a.md", 0)), Some(id(1)));
        assert_eq!(index.next_id(), id(2));
    }

    #[test]
    fn test_upsert_rejects_anonymous() {
        let mut index = TaskIndex::new();
        let anon = TaskInstance::new(Location::new("a.md", 0), None, false, "x");
        assert!(matches!(index.upsert(anon), Err(Error::InvalidTaskId(_))));
        assert!(index.is_empty());
    }

    #[test]
    fn test_upsert_overwrites_location() {
        let mut index = TaskIndex::new();
        index.upsert(inst("a.md", 0, 1, false, "one")).unwrap();
        index.upsert(inst("a.md", 0, 2, false, "two")).unwrap();

        assert_eq!(index.id_at(&Location::new("a.md", 0)), Some(id(2)));
        // Task 1 lost its only instance.
        assert!(index.get(id(1)).is_none());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_last_instance_drops_task() {
        let mut index = TaskIndex::new();
        index.upsert(inst("a.md", 0, 1, false, "one")).unwrap();
        index.upsert(inst("b.md", 4, 1, false, "one")).unwrap();

        assert_eq!(index.remove(&Location::new("a.md", 0)), Some(id(1)));
        assert!(index.get(id(1)).is_some());
        // Ownership moved to the surviving copy.
        assert_eq!(index.get(id(1)).unwrap().origin.as_deref(), Some(Path::new("b.md")));

        index.remove(&Location::new("b.md", 4));
        assert!(index.get(id(1)).is_none());
        assert!(index.remove(&Location::new("b.md", 4)).is_none());
    }

    #[test]
    fn test_task_with_children_survives_as_placeholder() {
        let mut index = TaskIndex::new();
        index.upsert(inst("a.md", 0, 1, false, "parent")).unwrap();
        index
            .upsert(inst("a.md", 1, 2, false, "child").with_parent(Some(id(1))))
            .unwrap();
        assert_eq!(index.get(id(1)).unwrap().children, vec![id(2)]);

        index.remove(&Location::new("a.md", 0));
        assert!(index.get(id(1)).is_some(), "parent kept while it has children");

        // Removing the child collects the placeholder too.
        index.remove(&Location::new("a.md", 1));
        assert!(index.get(id(2)).is_none());
        assert!(index.get(id(1)).is_none());
    }

    #[test]
    fn test_reparenting_moves_child() {
        let mut index = TaskIndex::new();
        index.upsert(inst("a.md", 0, 1, false, "p1")).unwrap();
        index.upsert(inst("a.md", 1, 2, false, "p2")).unwrap();
        index
            .upsert(inst("a.md", 2, 3, false, "c").with_parent(Some(id(1))))
            .unwrap();
        index
            .upsert(inst("a.md", 2, 3, false, "c").with_parent(Some(id(2))))
            .unwrap();

        assert!(index.get(id(1)).unwrap().children.is_empty());
        assert_eq!(index.get(id(2)).unwrap().children, vec![id(3)]);
        assert_eq!(index.get(id(3)).unwrap().parent, Some(id(2)));
    }

    #[test]
    fn test_nesting_only_from_origin() {
        let mut index = TaskIndex::new();
        index.upsert(inst("a.md", 0, 1, false, "p")).unwrap();
        index
            .upsert(inst("a.md", 1, 2, false, "c").with_parent(Some(id(1))))
            .unwrap();
        // A flat reference elsewhere does not un-nest the task.
        index.upsert(inst("b.md", 0, 2, false, "c")).unwrap();
        assert_eq!(index.get(id(2)).unwrap().parent, Some(id(1)));
    }

    #[test]
    fn test_reindex_path_preserves_identity() {
        let mut index = TaskIndex::new();
        index.upsert(inst("old.md", 0, 1, false, "one")).unwrap();
        index.upsert(inst("old.md", 5, 2, true, "two")).unwrap();
        index.upsert(inst("other.md", 0, 3, false, "three")).unwrap();
        let hash = fingerprint(&index.query_by_path(Path::new("old.md")));
        index.set_file_state_hash(Path::new("old.md"), hash);

        let before = index.query_by_path(Path::new("old.md"));
        assert_eq!(index.reindex_path(Path::new("old.md"), Path::new("new.md")), 2);

        assert!(index.query_by_path(Path::new("old.md")).is_empty());
        let after = index.query_by_path(Path::new("new.md"));
        assert_eq!(after.len(), 2);
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(a.location.path, Path::new("new.md"));
            assert_eq!(a.location.line, b.location.line);
            assert_eq!((a.id, a.complete, &a.text), (b.id, b.complete, &b.text));
        }
        assert_eq!(index.instances_of(id(2)), vec![Location::new("new.md", 5)]);
        assert_eq!(index.get(id(1)).unwrap().origin.as_deref(), Some(Path::new("new.md")));
        assert!(index.file_state_hash(Path::new("new.md")).is_some());
        assert!(index.file_state_hash(Path::new("old.md")).is_none());
        assert_eq!(index.query_by_path(Path::new("other.md")).len(), 1);
    }

    #[test]
    fn test_remove_path_cascades() {
        let mut index = TaskIndex::new();
        index.upsert(inst("gone.md", 0, 1, false, "only here")).unwrap();
        index.upsert(inst("gone.md", 1, 2, false, "shared")).unwrap();
        index.upsert(inst("kept.md", 0, 2, false, "shared")).unwrap();

        let dropped = index.remove_path(Path::new("gone.md"));
        assert_eq!(dropped, vec![id(1)]);
        assert!(index.get(id(1)).is_none());
        assert!(index.get(id(2)).is_some());
        assert!(index.query_by_path(Path::new("gone.md")).is_empty());
    }

    #[test]
    fn test_path_range_does_not_leak_prefixes() {
        let mut index = TaskIndex::new();
        index.upsert(inst("a.md", 0, 1, false, "one")).unwrap();
        index.upsert(inst("a.md.bak", 0, 2, false, "two")).unwrap();
        index.upsert(inst("a/b.md", 0, 3, false, "three")).unwrap();

        let belief = index.query_by_path(Path::new("a.md"));
        assert_eq!(belief.len(), 1);
        assert_eq!(belief[0].id, Some(id(1)));
    }

    #[test]
    fn test_initialize_seeds_and_publishes() {
        let mut index = TaskIndex::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        index.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        let seeded = index.initialize(vec![
            inst("a.md", 0, 4, false, "four"),
            TaskInstance::new(Location::new("a.md", 1), None, false, "anon"),
            inst("b.md", 0, 9, true, "nine"),
        ]);

        assert_eq!(seeded, 2);
        assert_eq!(index.len(), 2);
        assert_eq!(index.next_id(), id(10));
        assert!(index.file_state_hash(Path::new("a.md")).is_some());
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&IndexEvent::TaskSetInitialized {
                tasks: 2,
                instances: 2
            })
        );
    }

    #[test]
    fn test_events_for_mutations() {
        let mut index = TaskIndex::new();
        let (_sub, mut rx) = index.subscribe_channel();

        index.upsert(inst("a.md", 0, 1, false, "one")).unwrap();
        index.remove(&Location::new("a.md", 0));

        match rx.try_recv().unwrap() {
            IndexEvent::InstancesModified { upserted, removed, .. } => {
                assert_eq!(upserted.len(), 1);
                assert!(removed.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
        match rx.try_recv().unwrap() {
            IndexEvent::InstancesModified { removed, .. } => {
                assert_eq!(removed, vec![Location::new("a.md", 0)]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_counter_follows_highest_id() {
        let mut index = TaskIndex::new();
        index.upsert(inst("a.md", 0, 50, false, "x")).unwrap();
        assert_eq!(index.next_id(), id(51));
        index.upsert(inst("a.md", 1, 7, false, "y")).unwrap();
        assert_eq!(index.next_id(), id(51));

        // The last identity has no successor; the counter does not wrap.
        index.upsert(inst("a.md", 2, u32::MAX, false, "z")).unwrap();
        assert_eq!(index.next_id(), id(51));
        assert!(index.get(id(u32::MAX)).is_some());
    }

    #[test]
    fn test_owning_documents_win_the_seed() {
        let mut index = TaskIndex::new();
        index.initialize_with_owners(
            vec![
                inst("Tasks/errand.md", 0, 1, false, "errand"),
                inst("Archive.md", 0, 1, false, "stale copy"),
            ],
            |path| path.starts_with("Tasks"),
        );

        let task = index.get(id(1)).unwrap();
        assert_eq!(task.text, "errand");
        assert_eq!(task.origin.as_deref(), Some(Path::new("Tasks/errand.md")));
        assert_eq!(index.instances_of(id(1)).len(), 2);
    }

    #[test]
    fn test_plain_seed_keeps_first_owner() {
        let mut index = TaskIndex::new();
        index.initialize(vec![
            inst("b.md", 0, 1, false, "first"),
            inst("a.md", 0, 1, false, "second"),
        ]);
        assert_eq!(index.get(id(1)).unwrap().origin.as_deref(), Some(Path::new("b.md")));
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut index = TaskIndex::new();
        index.upsert(inst("b.md", 0, 3, false, "three")).unwrap();
        index.upsert(inst("a.md", 0, 1, false, "one")).unwrap();

        let snap = index.snapshot();
        assert_eq!(snap.tasks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![id(1), id(3)]);
        assert_eq!(snap.instances[0].location.path, Path::new("a.md"));
        assert_eq!(snap.next_id, id(4));
    }
}
