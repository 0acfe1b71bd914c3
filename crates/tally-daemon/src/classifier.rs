//! Per-document change classification.
//!
//! Each document is CLEAN or DIRTY. The engine marks a document DIRTY right
//! before it writes to it; the next change notification for that document is
//! its own echo and is swallowed, flipping it back to CLEAN.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tally_core::CacheStatus;
use tracing::debug;

/// A raw notification from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheAction {
    Changed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
    Deleted(PathBuf),
}

impl CacheAction {
    pub fn path(&self) -> &Path {
        match self {
            CacheAction::Changed(path) | CacheAction::Deleted(path) => path,
            CacheAction::Renamed { to, .. } => to,
        }
    }
}

/// What the engine should do with a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Echo of the engine's own write.
    Swallowed(PathBuf),
    /// Queue for a coalesced reconciliation.
    Debounce(PathBuf),
    /// Not the focused document; held back until it is.
    Deferred(PathBuf),
    /// Not a document the engine tracks.
    Ignored(PathBuf),
    /// Apply immediately.
    Delete(PathBuf),
    /// Apply immediately.
    Rename { from: PathBuf, to: PathBuf },
}

#[derive(Debug, Clone)]
pub struct ChangeClassifier {
    status: HashMap<PathBuf, CacheStatus>,
    deferred: BTreeSet<PathBuf>,
    focus_only: bool,
}

impl ChangeClassifier {
    pub fn new(focus_only: bool) -> Self {
        Self {
            status: HashMap::new(),
            deferred: BTreeSet::new(),
            focus_only,
        }
    }

    pub fn set_focus_only(&mut self, focus_only: bool) {
        self.focus_only = focus_only;
    }

    pub fn status(&self, path: &Path) -> CacheStatus {
        self.status.get(path).copied().unwrap_or_default()
    }

    /// Called right before the engine writes `path`.
    pub fn mark_dirty(&mut self, path: &Path) {
        debug!("Marking {} dirty", path.display());
        self.status.insert(path.to_path_buf(), CacheStatus::Dirty);
    }

    /// Forgets the suppression flag, e.g. after a failed write.
    pub fn clear(&mut self, path: &Path) {
        self.status.remove(path);
    }

    /// Classifies one notification. `active` is the focused document, if
    /// the host has a notion of focus.
    pub fn classify(&mut self, action: CacheAction, active: Option<&Path>) -> Disposition {
        match action {
            CacheAction::Changed(path) => {
                if self.status.remove(&path) == Some(CacheStatus::Dirty) {
                    debug!("Swallowing self-write echo for {}", path.display());
                    return Disposition::Swallowed(path);
                }
                match active {
                    Some(active) if self.focus_only && active != path.as_path() => {
                        debug!("Deferring {} (focused: {})", path.display(), active.display());
                        self.deferred.insert(path.clone());
                        Disposition::Deferred(path)
                    }
                    _ => {
                        self.deferred.remove(&path);
                        Disposition::Debounce(path)
                    }
                }
            }
            CacheAction::Deleted(path) => {
                self.status.remove(&path);
                self.deferred.remove(&path);
                Disposition::Delete(path)
            }
            CacheAction::Renamed { from, to } => {
                if let Some(status) = self.status.remove(&from) {
                    self.status.insert(to.clone(), status);
                }
                if self.deferred.remove(&from) {
                    self.deferred.insert(to.clone());
                }
                Disposition::Rename { from, to }
            }
        }
    }

    /// Releases a deferred document once it has focus. Returns true if it
    /// had changes held back.
    pub fn resume(&mut self, active: &Path) -> bool {
        self.deferred.remove(active)
    }

    pub fn deferred(&self) -> impl Iterator<Item = &PathBuf> {
        self.deferred.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(path: &str) -> CacheAction {
        CacheAction::Changed(PathBuf::from(path))
    }

    #[test]
    fn test_dirty_swallows_exactly_one() {
        let mut classifier = ChangeClassifier::new(false);
        classifier.mark_dirty(Path::new("a.md"));
        assert_eq!(classifier.status(Path::new("a.md")), CacheStatus::Dirty);

        assert_eq!(
            classifier.classify(changed("a.md"), None),
            Disposition::Swallowed("a.md".into())
        );
        assert_eq!(classifier.status(Path::new("a.md")), CacheStatus::Clean);
        assert_eq!(
            classifier.classify(changed("a.md"), None),
            Disposition::Debounce("a.md".into())
        );
    }

    #[test]
    fn test_clear_after_failed_write() {
        let mut classifier = ChangeClassifier::new(false);
        classifier.mark_dirty(Path::new("a.md"));
        classifier.clear(Path::new("a.md"));
        assert_eq!(
            classifier.classify(changed("a.md"), None),
            Disposition::Debounce("a.md".into())
        );
    }

    #[test]
    fn test_focus_gating() {
        let mut classifier = ChangeClassifier::new(true);
        let active = Path::new("focused.md");

        assert_eq!(
            classifier.classify(changed("focused.md"), Some(active)),
            Disposition::Debounce("focused.md".into())
        );
        assert_eq!(
            classifier.classify(changed("background.md"), Some(active)),
            Disposition::Deferred("background.md".into())
        );
        // No focus reported: everything goes through.
        assert_eq!(
            classifier.classify(changed("background.md"), None),
            Disposition::Debounce("background.md".into())
        );
    }

    #[test]
    fn test_deferred_resumes_on_focus() {
        let mut classifier = ChangeClassifier::new(true);
        classifier.classify(changed("later.md"), Some(Path::new("now.md")));
        assert_eq!(classifier.deferred().count(), 1);

        assert!(!classifier.resume(Path::new("now.md")));
        assert!(classifier.resume(Path::new("later.md")));
        assert!(!classifier.resume(Path::new("later.md")));
    }

    #[test]
    fn test_focus_gating_disabled() {
        let mut classifier = ChangeClassifier::new(false);
        assert_eq!(
            classifier.classify(changed("background.md"), Some(Path::new("focused.md"))),
            Disposition::Debounce("background.md".into())
        );
    }

    #[test]
    fn test_rename_carries_state() {
        let mut classifier = ChangeClassifier::new(false);
        classifier.mark_dirty(Path::new("old.md"));
        let disposition = classifier.classify(
            CacheAction::Renamed {
                from: "old.md".into(),
                to: "new.md".into(),
            },
            None,
        );
        assert_eq!(
            disposition,
            Disposition::Rename {
                from: "old.md".into(),
                to: "new.md".into()
            }
        );
        assert_eq!(classifier.status(Path::new("old.md")), CacheStatus::Clean);
        assert_eq!(classifier.status(Path::new("new.md")), CacheStatus::Dirty);
    }

    #[test]
    fn test_delete_forgets_state() {
        let mut classifier = ChangeClassifier::new(false);
        classifier.mark_dirty(Path::new("gone.md"));
        assert_eq!(
            classifier.classify(CacheAction::Deleted("gone.md".into()), None),
            Disposition::Delete("gone.md".into())
        );
        assert_eq!(classifier.status(Path::new("gone.md")), CacheStatus::Clean);
    }
}
