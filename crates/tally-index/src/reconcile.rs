//! Document reconciliation.
//!
//! Given a document's live text (and optionally the host's structural parse
//! of its list items), [`Reconciler::reconcile`] works out what the index has
//! to change to agree with the document, and whether the document itself has
//! to be rewritten. It only reads the index; the result is committed with
//! [`TaskIndex::apply`](crate::TaskIndex::apply).
//!
//! # Rules
//!
//! - Live fingerprint equal to the stored one: nothing to do.
//! - A task line without a usable identifier gets a fresh identity and the
//!   identifier is appended to that line. Later copies of an identifier that
//!   already appeared in the same document are treated the same way.
//! - A known identity whose text or completion changed: the document wins,
//!   unless the identity is owned by another document and the text disagrees.
//!   In that case the owner wins and the line is rewritten to the owner's
//!   copy (an identity conflict).
//! - A location the index believed in but the document no longer has is
//!   removed.

use crate::index::TaskIndex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tally_core::{
    fingerprint, render_line, with_block_id, CacheStatus, Error, FileStateHash, LineParser,
    ListItem, Location, ParsedLine, Result, SyncConfig, TaskId, TaskInstance,
};
use tracing::{debug, warn};

/// A document as currently observed.
#[derive(Debug, Clone, Copy)]
pub struct LiveDocument<'a> {
    pub path: &'a Path,
    pub text: &'a str,
    /// Structural parse from the host, when it has one.
    pub items: Option<&'a [ListItem]>,
}

impl<'a> LiveDocument<'a> {
    pub fn new(path: &'a Path, text: &'a str) -> Self {
        Self {
            path,
            text,
            items: None,
        }
    }

    pub fn with_items(mut self, items: Option<&'a [ListItem]>) -> Self {
        self.items = items;
        self
    }
}

/// One change to apply to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexMutation {
    Upsert {
        instance: TaskInstance,
        /// Make this instance's document the task's owner.
        claim_origin: bool,
    },
    Remove {
        location: Location,
    },
}

/// A location whose text disagreed with the owning document's copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConflict {
    pub id: TaskId,
    pub location: Location,
    pub owner: Option<PathBuf>,
    pub index_text: String,
    pub live_text: String,
}

/// Outcome of reconciling one document.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub path: PathBuf,
    pub status: CacheStatus,
    /// Fingerprint of the index's belief when this was computed.
    pub base_hash: FileStateHash,
    /// Fingerprint of the document once `rewrite` (if any) is written.
    pub live_hash: FileStateHash,
    pub mutations: Vec<IndexMutation>,
    /// Full replacement text, when lines had to change.
    pub rewrite: Option<String>,
    pub conflicts: Vec<IdentityConflict>,
    /// Identities whose canonical values changed here and whose instances
    /// in other documents are now out of date.
    pub propagate: Vec<TaskId>,
    /// Value of the index's identity counter this was computed against.
    pub first_new_id: TaskId,
    /// Counter value after the identities assigned here.
    pub next_id: TaskId,
    /// Identities handed out here, in line order.
    pub fresh_ids: Vec<TaskId>,
}

impl Reconciliation {
    pub fn is_clean(&self) -> bool {
        self.status == CacheStatus::Clean
    }

    pub fn needs_write(&self) -> bool {
        self.rewrite.is_some()
    }

    /// Identities handed out by this reconciliation.
    pub fn assigned(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.fresh_ids.iter().copied()
    }
}

/// A checklist line found in the live document.
#[derive(Debug, Clone)]
struct Candidate {
    line: usize,
    parsed: ParsedLine,
    parent_line: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    parser: LineParser,
    id_prefix: String,
    config: SyncConfig,
}

impl Reconciler {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            parser: config.parser(),
            id_prefix: config.id_prefix.clone(),
            config: config.clone(),
        }
    }

    /// Task instances exactly as the document spells them: identifiers that
    /// do not decode are left anonymous and nothing is assigned. Parent links
    /// are filled in where the enclosing task has an identifier.
    pub fn scan(&self, doc: &LiveDocument<'_>) -> Result<Vec<TaskInstance>> {
        let lines = split_lines(doc.text);
        let candidates = self.candidates(doc, &lines)?;
        let ids: HashMap<usize, Option<TaskId>> = candidates
            .iter()
            .map(|c| (c.line, self.decode(&c.parsed)))
            .collect();

        Ok(candidates
            .iter()
            .map(|c| {
                let parent = c.parent_line.and_then(|line| ids.get(&line).copied().flatten());
                TaskInstance::new(
                    Location::new(doc.path, c.line),
                    ids[&c.line],
                    c.parsed.complete,
                    c.parsed.text.clone(),
                )
                .with_parent(parent)
            })
            .collect())
    }

    /// Fingerprint of the document as it stands.
    pub fn live_fingerprint(&self, doc: &LiveDocument<'_>) -> Result<FileStateHash> {
        Ok(fingerprint(&self.scan(doc)?))
    }

    pub fn reconcile(&self, doc: &LiveDocument<'_>, index: &TaskIndex) -> Result<Reconciliation> {
        let path = doc.path;
        let lines = split_lines(doc.text);
        let candidates = self.candidates(doc, &lines)?;

        let belief = index.query_by_path(path);
        let base_hash = fingerprint(&belief);
        let first_new_id = index.next_id();

        let raw: Vec<TaskInstance> = candidates
            .iter()
            .map(|c| {
                TaskInstance::new(
                    Location::new(path, c.line),
                    self.decode(&c.parsed),
                    c.parsed.complete,
                    c.parsed.text.clone(),
                )
            })
            .collect();
        let raw_hash = fingerprint(&raw);
        let reference = index.file_state_hash(path).unwrap_or(&base_hash);

        if &raw_hash == reference
            && raw.iter().all(|i| !i.is_anonymous())
            && !self.nesting_changed(path, &candidates, &raw, index)
        {
            debug!("{} is clean ({})", path.display(), raw_hash);
            return Ok(Reconciliation {
                path: path.to_path_buf(),
                status: CacheStatus::Clean,
                base_hash,
                live_hash: raw_hash,
                mutations: Vec::new(),
                rewrite: None,
                conflicts: Vec::new(),
                propagate: Vec::new(),
                first_new_id,
                next_id: first_new_id,
                fresh_ids: Vec::new(),
            });
        }

        let mut ids = IdAllocator::new(index, &raw);
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut line_ids: HashMap<usize, TaskId> = HashMap::new();
        let mut rewrites: BTreeMap<usize, String> = BTreeMap::new();

        for (candidate, record) in candidates.iter().zip(&raw) {
            let id = match record.id {
                Some(id) if seen.insert(id) => id,
                previous => {
                    let id = ids.allocate()?;
                    if let Some(dup) = previous {
                        debug!(
                            "Duplicate identifier {} at {}:{}, reassigning as {}",
                            dup,
                            path.display(),
                            candidate.line + 1,
                            id
                        );
                    }
                    let original = lines[candidate.line];
                    rewrites.insert(
                        candidate.line,
                        keep_eol(original, with_block_id(original, &id.to_block_id(&self.id_prefix))),
                    );
                    id
                }
            };
            line_ids.insert(candidate.line, id);
        }

        let claims_origin = self.config.is_task_file(path);
        let mut live = Vec::with_capacity(candidates.len());
        let mut upserts = Vec::new();
        let mut conflicts = Vec::new();
        let mut propagate = BTreeSet::new();

        for candidate in &candidates {
            let id = line_ids[&candidate.line];
            let location = Location::new(path, candidate.line);
            let parent = candidate
                .parent_line
                .and_then(|line| line_ids.get(&line).copied());
            let mut instance = TaskInstance::new(
                location.clone(),
                Some(id),
                candidate.parsed.complete,
                candidate.parsed.text.clone(),
            )
            .with_parent(parent);

            match index.get(id) {
                None => upserts.push(IndexMutation::Upsert {
                    instance: instance.clone(),
                    claim_origin: true,
                }),
                Some(task) => {
                    let owner = task.origin.as_deref();
                    let owned_here = owner.is_none() || owner == Some(path) || claims_origin;
                    let relinked = index.id_at(&location) != Some(id);
                    let shared = index.instances_of(id).iter().any(|l| l.path != path);

                    if task.matches(instance.complete, &instance.text) {
                        let renested = owned_here && task.parent != parent;
                        if relinked || renested || (claims_origin && owner != Some(path)) {
                            upserts.push(IndexMutation::Upsert {
                                instance: instance.clone(),
                                claim_origin: claims_origin,
                            });
                        }
                    } else if owned_here || task.text == instance.text {
                        // Document wins. Completion may be toggled from any
                        // copy; text is only edited through the owner.
                        upserts.push(IndexMutation::Upsert {
                            instance: instance.clone(),
                            claim_origin: claims_origin,
                        });
                        if shared {
                            propagate.insert(id);
                        }
                    } else {
                        warn!(
                            "Identity conflict for task {} at {}: owner {} says {:?}, document says {:?}",
                            id,
                            location,
                            owner.map(|p| p.display().to_string()).unwrap_or_default(),
                            task.text,
                            instance.text
                        );
                        conflicts.push(IdentityConflict {
                            id,
                            location: location.clone(),
                            owner: task.origin.clone(),
                            index_text: task.text.clone(),
                            live_text: instance.text.clone(),
                        });

                        instance.complete = task.complete;
                        instance.text = task.text.clone();
                        let block_id = id.to_block_id(&self.id_prefix);
                        rewrites.insert(
                            candidate.line,
                            render_preserving_eol(
                                lines[candidate.line],
                                &candidate.parsed,
                                task.complete,
                                &task.text,
                                &block_id,
                            ),
                        );
                        upserts.push(IndexMutation::Upsert {
                            instance: instance.clone(),
                            claim_origin: false,
                        });
                    }
                }
            }
            live.push(instance);
        }

        // Upserts go first so a task that only moved lines keeps its record.
        let live_lines: HashSet<usize> = candidates.iter().map(|c| c.line).collect();
        let mut mutations = upserts;
        mutations.extend(
            belief
                .iter()
                .filter(|b| !live_lines.contains(&b.location.line))
                .map(|b| IndexMutation::Remove {
                    location: b.location.clone(),
                }),
        );

        let rewrite = (!rewrites.is_empty()).then(|| apply_rewrites(&lines, &rewrites));
        let live_hash = fingerprint(&live);
        let status = if mutations.is_empty() && rewrite.is_none() {
            CacheStatus::Clean
        } else {
            CacheStatus::Dirty
        };

        debug!(
            "Reconciled {}: {} mutations, {} rewrites, {} conflicts, {} new ids",
            path.display(),
            mutations.len(),
            rewrites.len(),
            conflicts.len(),
            ids.assigned.len()
        );

        Ok(Reconciliation {
            path: path.to_path_buf(),
            status,
            base_hash,
            live_hash,
            mutations,
            rewrite,
            conflicts,
            propagate: propagate.into_iter().collect(),
            first_new_id,
            next_id: ids.next,
            fresh_ids: ids.assigned,
        })
    }

    /// Rewrites the given lines of `text` to the index's canonical copy of
    /// the task each one holds. A line that no longer holds the expected
    /// identity means the caller's locations are out of date.
    pub fn render_instances(
        &self,
        path: &Path,
        text: &str,
        index: &TaskIndex,
        targets: &[(usize, TaskId)],
    ) -> Result<String> {
        let lines = split_lines(text);
        let mut rewrites = BTreeMap::new();

        for &(line, id) in targets {
            let current = lines.get(line).ok_or_else(|| Error::StructuralInconsistency {
                path: path.to_path_buf(),
                line,
                line_count: lines.len(),
            })?;
            let parsed = self
                .parser
                .parse(current)
                .filter(|p| self.decode(p) == Some(id))
                .ok_or_else(|| Error::StructuralInconsistency {
                    path: path.to_path_buf(),
                    line,
                    line_count: lines.len(),
                })?;
            let Some(task) = index.get(id) else {
                continue;
            };
            if parsed.complete != task.complete || parsed.text != task.text {
                let block_id = id.to_block_id(&self.id_prefix);
                rewrites.insert(
                    line,
                    render_preserving_eol(current, &parsed, task.complete, &task.text, &block_id),
                );
            }
        }

        Ok(apply_rewrites(&lines, &rewrites))
    }

    /// True if a task this document owns sits under a different parent
    /// than the index records. Parents are not part of the fingerprint.
    fn nesting_changed(
        &self,
        path: &Path,
        candidates: &[Candidate],
        raw: &[TaskInstance],
        index: &TaskIndex,
    ) -> bool {
        let claims_origin = self.config.is_task_file(path);
        let line_ids: HashMap<usize, TaskId> = raw
            .iter()
            .filter_map(|i| Some((i.location.line, i.id?)))
            .collect();

        candidates.iter().zip(raw).any(|(candidate, record)| {
            let Some(task) = record.id.and_then(|id| index.get(id)) else {
                return false;
            };
            let owner = task.origin.as_deref();
            let owned_here = owner.is_none() || owner == Some(path) || claims_origin;
            let parent = candidate
                .parent_line
                .and_then(|line| line_ids.get(&line).copied());
            owned_here && task.parent != parent
        })
    }

    fn decode(&self, parsed: &ParsedLine) -> Option<TaskId> {
        parsed
            .block_id
            .as_deref()
            .and_then(|b| TaskId::from_block_id(b, &self.id_prefix))
    }

    /// Finds checklist lines, preferring the host's structural parse.
    fn candidates(&self, doc: &LiveDocument<'_>, lines: &[&str]) -> Result<Vec<Candidate>> {
        let Some(items) = doc.items else {
            return Ok(lines
                .iter()
                .enumerate()
                .filter_map(|(line, text)| {
                    self.parser.parse(text).map(|parsed| Candidate {
                        line,
                        parsed,
                        parent_line: None,
                    })
                })
                .collect());
        };

        let mut parents: HashMap<usize, Option<usize>> = HashMap::with_capacity(items.len());
        for item in items {
            if item.line >= lines.len() {
                return Err(Error::StructuralInconsistency {
                    path: doc.path.to_path_buf(),
                    line: item.line,
                    line_count: lines.len(),
                });
            }
            parents.insert(item.line, item.parent);
        }

        let tasks: BTreeMap<usize, ParsedLine> = items
            .iter()
            .filter_map(|item| self.parser.parse(lines[item.line]).map(|p| (item.line, p)))
            .collect();

        Ok(tasks
            .iter()
            .map(|(&line, parsed)| {
                // Nearest enclosing item that is itself a task; plain bullets
                // in between do not break the chain. Bounded in case the host
                // hands us a cycle.
                let mut parent_line = None;
                let mut cursor = parents.get(&line).copied().flatten();
                for _ in 0..items.len() {
                    let Some(up) = cursor else { break };
                    if tasks.contains_key(&up) {
                        parent_line = Some(up);
                        break;
                    }
                    cursor = parents.get(&up).copied().flatten();
                }
                Candidate {
                    line,
                    parsed: parsed.clone(),
                    parent_line,
                }
            })
            .collect())
    }
}

/// Hands out identities that neither the index nor the document uses.
struct IdAllocator<'a> {
    index: &'a TaskIndex,
    taken: HashSet<TaskId>,
    next: TaskId,
    exhausted: bool,
    assigned: Vec<TaskId>,
}

impl<'a> IdAllocator<'a> {
    fn new(index: &'a TaskIndex, raw: &[TaskInstance]) -> Self {
        let taken: HashSet<TaskId> = raw.iter().filter_map(|i| i.id).collect();
        // Start above anything the document already uses, so a pasted
        // identifier the index has never seen cannot collide.
        let next = taken
            .iter()
            .copied()
            .filter_map(TaskId::next)
            .fold(index.next_id(), TaskId::max);
        Self {
            index,
            taken,
            next,
            exhausted: false,
            assigned: Vec::new(),
        }
    }

    fn is_free(&self, id: TaskId) -> bool {
        !self.taken.contains(&id) && self.index.get(id).is_none()
    }

    fn allocate(&mut self) -> Result<TaskId> {
        let mut found = None;
        while found.is_none() && !self.exhausted {
            let id = self.next;
            match id.next() {
                Some(after) => self.next = after,
                None => self.exhausted = true,
            }
            if self.is_free(id) {
                found = Some(id);
            }
        }

        let id = match found {
            Some(id) => id,
            // The counter ran off the end; reuse the lowest free identity.
            None => (1..=u32::MAX)
                .filter_map(TaskId::new)
                .find(|id| self.is_free(*id))
                .ok_or_else(|| Error::InvalidTaskId("identity space exhausted".to_string()))?,
        };
        self.taken.insert(id);
        self.assigned.push(id);
        Ok(id)
    }
}

/// Splits on `\n` only, so joining with `\n` restores the original text.
fn split_lines(text: &str) -> Vec<&str> {
    text.split('\n').collect()
}

fn apply_rewrites(lines: &[&str], rewrites: &BTreeMap<usize, String>) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| rewrites.get(&i).map(String::as_str).unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_preserving_eol(
    original: &str,
    parsed: &ParsedLine,
    complete: bool,
    text: &str,
    block_id: &str,
) -> String {
    keep_eol(
        original,
        render_line(&parsed.indent, parsed.marker, complete, text, Some(block_id)),
    )
}

/// Carries a trailing `\r` from the original line over to its replacement.
fn keep_eol(original: &str, rendered: String) -> String {
    if original.ends_with('\r') {
        format!("{}\r", rendered)
    } else {
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> TaskId {
        TaskId::new(n).unwrap()
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(&SyncConfig::default())
    }

    fn commit(index: &mut TaskIndex, path: &str, text: &str) -> Reconciliation {
        let doc = LiveDocument::new(Path::new(path), text);
        let rec = reconciler().reconcile(&doc, index).unwrap();
        index.apply(&rec).unwrap();
        rec
    }

    #[test]
    fn test_assigns_identity_and_appends_block_id() {
        let mut index = TaskIndex::new();
        let text = "# Today\n- [ ] Buy milk\nsome prose\n- [x] Call Bob ^t7\n";

        let rec = commit(&mut index, "a.md", text);

        assert_eq!(rec.status, CacheStatus::Dirty);
        // t7 already exists in the document, so fresh ids start above it.
        assert_eq!(
            rec.rewrite.as_deref(),
            Some("# Today\n- [ ] Buy milk ^t8\nsome prose\n- [x] Call Bob ^t7\n")
        );
        assert_eq!(rec.assigned().collect::<Vec<_>>(), vec![id(8)]);
        assert_eq!(index.get(id(8)).unwrap().text, "Buy milk");
        assert!(index.get(id(7)).unwrap().complete);
        assert_eq!(index.next_id(), id(9));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut index = TaskIndex::new();
        let first = commit(&mut index, "a.md", "- [ ] one\n- [ ] two\n");
        let rewritten = first.rewrite.unwrap();

        let second = commit(&mut index, "a.md", &rewritten);
        assert!(second.is_clean());
        assert!(second.mutations.is_empty());
        assert!(second.rewrite.is_none());

        let third = commit(&mut index, "a.md", &rewritten);
        assert!(third.is_clean());
        assert!(third.mutations.is_empty());
    }

    #[test]
    fn test_document_wins_for_edits() {
        let mut index = TaskIndex::new();
        commit(&mut index, "a.md", "- [ ] draft ^t1");

        let rec = commit(&mut index, "a.md", "- [x] final ^t1");
        assert!(rec.rewrite.is_none());
        let task = index.get(id(1)).unwrap();
        assert!(task.complete);
        assert_eq!(task.text, "final");
    }

    #[test]
    fn test_deleted_line_is_removed() {
        let mut index = TaskIndex::new();
        commit(&mut index, "a.md", "- [ ] keep ^t1\n- [ ] drop ^t2");

        let rec = commit(&mut index, "a.md", "- [ ] keep ^t1");
        assert!(rec.mutations.contains(&IndexMutation::Remove {
            location: Location::new("a.md", 1)
        }));
        assert!(index.get(id(2)).is_none());
        assert!(index.get(id(1)).is_some());
    }

    #[test]
    fn test_moved_line_keeps_identity() {
        let mut index = TaskIndex::new();
        commit(&mut index, "a.md", "- [ ] a ^t1\n- [ ] b ^t2");
        commit(&mut index, "a.md", "intro\n- [ ] b ^t2\n- [ ] a ^t1");

        assert_eq!(index.instances_of(id(1)), vec![Location::new("a.md", 2)]);
        assert_eq!(index.instances_of(id(2)), vec![Location::new("a.md", 1)]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_swapped_lines_keep_records() {
        let mut index = TaskIndex::new();
        let items = [
            ListItem::new(0, None),
            ListItem::new(1, None),
            ListItem::new(2, Some(1)),
        ];
        let doc = LiveDocument::new(Path::new("a.md"), "- [ ] a ^t1\n- [ ] b ^t2\n  - [ ] c ^t3")
            .with_items(Some(&items));
        let rec = reconciler().reconcile(&doc, &index).unwrap();
        index.apply(&rec).unwrap();
        assert_eq!(index.get(id(2)).unwrap().children, vec![id(3)]);

        // Every line now holds a different task than before.
        let items = [
            ListItem::new(0, None),
            ListItem::new(1, Some(0)),
            ListItem::new(2, None),
        ];
        let doc = LiveDocument::new(Path::new("a.md"), "- [ ] b ^t2\n  - [ ] c ^t3\n- [ ] a ^t1")
            .with_items(Some(&items));
        let rec = reconciler().reconcile(&doc, &index).unwrap();
        let summary = index.apply(&rec).unwrap();

        assert!(summary.dropped_tasks.is_empty());
        assert_eq!(summary.removed, 0);
        assert_eq!(index.len(), 3);
        assert_eq!(index.get(id(2)).unwrap().children, vec![id(3)]);
        assert_eq!(index.get(id(3)).unwrap().parent, Some(id(2)));
        for n in 1..=3 {
            assert_eq!(
                index.get(id(n)).unwrap().origin.as_deref(),
                Some(Path::new("a.md"))
            );
        }
        assert_eq!(index.instances_of(id(1)), vec![Location::new("a.md", 2)]);
    }

    #[test]
    fn test_indenting_a_task_updates_nesting() {
        let mut index = TaskIndex::new();
        commit(&mut index, "a.md", "- [ ] parent ^t1\n- [ ] child ^t2");
        assert_eq!(index.get(id(2)).unwrap().parent, None);

        // Same lines, ids and text; only the outline changed.
        let items = [ListItem::new(0, None), ListItem::new(1, Some(0))];
        let doc = LiveDocument::new(Path::new("a.md"), "- [ ] parent ^t1\n  - [ ] child ^t2")
            .with_items(Some(&items));
        let rec = reconciler().reconcile(&doc, &index).unwrap();
        assert_eq!(rec.status, CacheStatus::Dirty);
        assert!(rec.rewrite.is_none());
        index.apply(&rec).unwrap();

        assert_eq!(index.get(id(2)).unwrap().parent, Some(id(1)));
        assert_eq!(index.get(id(1)).unwrap().children, vec![id(2)]);

        let again = reconciler().reconcile(&doc, &index).unwrap();
        assert!(again.is_clean());
    }

    #[test]
    fn test_pasted_last_identifier_does_not_collide() {
        let mut index = TaskIndex::new();
        let rec = commit(&mut index, "a.md", "- [ ] pasted ^t4294967295\n- [ ] new one");

        assert_eq!(
            rec.rewrite.as_deref(),
            Some("- [ ] pasted ^t4294967295\n- [ ] new one ^t1")
        );
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(id(u32::MAX)).unwrap().text, "pasted");
        assert_eq!(index.get(id(1)).unwrap().text, "new one");
    }

    #[test]
    fn test_fresh_ids_after_counter_runs_out() {
        let mut index = TaskIndex::new();
        let rec = commit(
            &mut index,
            "a.md",
            "- [ ] pasted ^t4294967294\n- [ ] first\n- [ ] second",
        );

        // The counter reaches the last identity, then falls back to the
        // lowest one nobody holds.
        assert_eq!(rec.assigned().collect::<Vec<_>>(), vec![id(u32::MAX), id(1)]);
        assert_eq!(index.len(), 3);
        assert_eq!(index.get(id(u32::MAX)).unwrap().text, "first");
        assert_eq!(index.get(id(1)).unwrap().text, "second");

        let rec = commit(&mut index, "b.md", "- [ ] third");
        assert_eq!(rec.assigned().collect::<Vec<_>>(), vec![id(2)]);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_duplicate_identifier_in_one_document() {
        let mut index = TaskIndex::new();
        let rec = commit(&mut index, "a.md", "- [ ] copy ^t3\n- [ ] copy ^t3");

        assert_eq!(
            rec.rewrite.as_deref(),
            Some("- [ ] copy ^t3\n- [ ] copy ^t4")
        );
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_foreign_block_id_is_replaced() {
        let mut index = TaskIndex::new();
        let rec = commit(&mut index, "a.md", "- [ ] Call Bob ^a1");
        assert_eq!(rec.rewrite.as_deref(), Some("- [ ] Call Bob ^t1"));
    }

    #[test]
    fn test_cross_reference_completion_propagates() {
        let mut index = TaskIndex::new();
        commit(&mut index, "owner.md", "- [ ] shared ^t1");
        commit(&mut index, "daily.md", "- [ ] shared ^t1");

        // Checking the box in the referencing document is accepted.
        let rec = commit(&mut index, "daily.md", "- [x] shared ^t1");
        assert!(rec.conflicts.is_empty());
        assert_eq!(rec.propagate, vec![id(1)]);
        assert!(index.get(id(1)).unwrap().complete);
        assert_eq!(
            index.get(id(1)).unwrap().origin.as_deref(),
            Some(Path::new("owner.md"))
        );
    }

    #[test]
    fn test_identity_conflict_owner_wins() {
        let mut index = TaskIndex::new();
        commit(&mut index, "owner.md", "- [ ] canonical ^t1");

        let rec = commit(&mut index, "other.md", "  - [ ] diverged ^t1");
        assert_eq!(rec.conflicts.len(), 1);
        assert_eq!(rec.conflicts[0].index_text, "canonical");
        assert_eq!(rec.conflicts[0].live_text, "diverged");
        assert_eq!(rec.rewrite.as_deref(), Some("  - [ ] canonical ^t1"));

        // Relinked as another instance of the same identity.
        assert_eq!(index.len(), 1);
        assert_eq!(index.instances_of(id(1)).len(), 2);
        assert_eq!(index.get(id(1)).unwrap().text, "canonical");
    }

    #[test]
    fn test_owner_edit_marks_other_copies() {
        let mut index = TaskIndex::new();
        commit(&mut index, "owner.md", "- [ ] old ^t1");
        commit(&mut index, "ref.md", "- [ ] old ^t1");

        let rec = commit(&mut index, "owner.md", "- [ ] new ^t1");
        assert_eq!(rec.propagate, vec![id(1)]);
        assert_eq!(index.get(id(1)).unwrap().text, "new");
    }

    #[test]
    fn test_task_file_claims_origin() {
        let mut index = TaskIndex::new();
        commit(&mut index, "daily.md", "- [ ] errand ^t1");
        assert_eq!(index.get(id(1)).unwrap().origin.as_deref(), Some(Path::new("daily.md")));

        commit(&mut index, "Tasks/errand.md", "- [ ] errand ^t1");
        assert_eq!(
            index.get(id(1)).unwrap().origin.as_deref(),
            Some(Path::new("Tasks/errand.md"))
        );
    }

    #[test]
    fn test_structural_parse_sets_parents() {
        let mut index = TaskIndex::new();
        let text = "- [ ] parent ^t1\n  - plain bullet\n    - [ ] child ^t2\n- [ ] sibling ^t3";
        let items = [
            ListItem::new(0, None),
            ListItem::new(1, Some(0)),
            ListItem::new(2, Some(1)),
            ListItem::new(3, None),
        ];
        let doc = LiveDocument::new(Path::new("a.md"), text).with_items(Some(&items));
        let rec = reconciler().reconcile(&doc, &index).unwrap();
        index.apply(&rec).unwrap();

        assert_eq!(index.get(id(2)).unwrap().parent, Some(id(1)));
        assert_eq!(index.get(id(1)).unwrap().children, vec![id(2)]);
        assert_eq!(index.get(id(3)).unwrap().parent, None);
    }

    #[test]
    fn test_structural_inconsistency() {
        let index = TaskIndex::new();
        let items = [ListItem::new(0, None), ListItem::new(9, Some(0))];
        let doc = LiveDocument::new(Path::new("a.md"), "- [ ] only line").with_items(Some(&items));

        match reconciler().reconcile(&doc, &index) {
            Err(Error::StructuralInconsistency { line, line_count, .. }) => {
                assert_eq!(line, 9);
                assert_eq!(line_count, 1);
            }
            other => panic!("expected structural inconsistency, got {:?}", other.map(|r| r.status)),
        }
    }

    #[test]
    fn test_stale_result_is_rejected() {
        let mut index = TaskIndex::new();
        let doc = LiveDocument::new(Path::new("a.md"), "- [ ] one");
        let rec = reconciler().reconcile(&doc, &index).unwrap();

        // Someone else commits first.
        commit(&mut index, "b.md", "- [ ] other");

        assert!(matches!(index.apply(&rec), Err(Error::StaleReconciliation(_))));
        assert!(index.query_by_path(Path::new("a.md")).is_empty());
    }

    #[test]
    fn test_crlf_is_preserved() {
        let mut index = TaskIndex::new();
        let rec = commit(&mut index, "a.md", "- [ ] one\r\n- [ ] two\r\n");
        assert_eq!(
            rec.rewrite.as_deref(),
            Some("- [ ] one ^t1\r\n- [ ] two ^t2\r\n")
        );
    }

    #[test]
    fn test_render_instances() {
        let mut index = TaskIndex::new();
        commit(&mut index, "owner.md", "- [x] fresh ^t1");

        let text = "intro\n\t* [ ] stale ^t1\n";
        let out = reconciler()
            .render_instances(Path::new("ref.md"), text, &index, &[(1, id(1))])
            .unwrap();
        assert_eq!(out, "intro\n\t* [x] fresh ^t1\n");

        let err = reconciler()
            .render_instances(Path::new("ref.md"), text, &index, &[(0, id(1))])
            .unwrap_err();
        assert!(matches!(err, Error::StructuralInconsistency { .. }));
    }

    #[test]
    fn test_scan_leaves_foreign_ids_anonymous() {
        let doc = LiveDocument::new(Path::new("a.md"), "- [ ] x ^a1\n- [ ] y ^t2\n- not a task");
        let scanned = reconciler().scan(&doc).unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].id, None);
        assert_eq!(scanned[1].id, Some(id(2)));
    }
}
