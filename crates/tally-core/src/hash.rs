//! Document state fingerprints.
//!
//! Both sides of a reconciliation, the index's belief about a document and
//! the document's live content, are reduced to a list of [`TaskInstance`]s
//! and hashed here. Equal fingerprints mean there is nothing to do.

use crate::types::TaskInstance;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded SHA-256 over a document's task-bearing lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileStateHash(String);

impl FileStateHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileStateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for log lines.
        let short: String = self.0.chars().take(12).collect();
        write!(f, "{}", short)
    }
}

/// Computes the fingerprint of one document's task instances.
///
/// Input order does not matter; records are hashed in line order. The
/// document path and parent links are not part of the fingerprint, so a
/// rename alone never makes a document dirty.
pub fn fingerprint<'a, I>(instances: I) -> FileStateHash
where
    I: IntoIterator<Item = &'a TaskInstance>,
{
    let mut records: Vec<&TaskInstance> = instances.into_iter().collect();
    records.sort_by_key(|i| i.location.line);

    let mut hasher = Sha256::new();
    for record in records {
        hash_str(&mut hasher, &record.location.line.to_string());
        match record.id {
            Some(id) => hash_str(&mut hasher, &id.to_string()),
            None => hash_str(&mut hasher, ""),
        }
        hash_flag(&mut hasher, record.complete, "x");
        hash_str(&mut hasher, &record.text);
        hasher.update([0xff]);
    }

    FileStateHash(hex::encode(hasher.finalize()))
}

fn hash_str(hasher: &mut Sha256, s: &str) {
    hasher.update(s.as_bytes());
    hasher.update([0]);
}

fn hash_flag(hasher: &mut Sha256, b: bool, label: &str) {
    if b {
        hasher.update(label.as_bytes());
    }
    hasher.update([0]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Location, TaskId};

    fn instance(line: usize, id: Option<u32>, complete: bool, text: &str) -> TaskInstance {
        TaskInstance::new(
            Location::new("doc.md", line),
            id.and_then(TaskId::new),
            complete,
            text,
        )
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = instance(0, Some(1), false, "one");
        let b = instance(3, Some(2), true, "two");
        assert_eq!(fingerprint([&a, &b]), fingerprint([&b, &a]));
    }

    #[test]
    fn test_fingerprint_detects_changes() {
        let base = fingerprint([&instance(0, Some(1), false, "one")]);

        assert_ne!(base, fingerprint([&instance(0, Some(1), true, "one")]));
        assert_ne!(base, fingerprint([&instance(0, Some(1), false, "uno")]));
        assert_ne!(base, fingerprint([&instance(1, Some(1), false, "one")]));
        assert_ne!(base, fingerprint([&instance(0, None, false, "one")]));
        assert_ne!(base, fingerprint([&instance(0, Some(2), false, "one")]));
    }

    #[test]
    fn test_fingerprint_ignores_path() {
        let mut moved = instance(0, Some(1), false, "one");
        moved.location.path = "elsewhere/doc.md".into();
        assert_eq!(
            fingerprint([&instance(0, Some(1), false, "one")]),
            fingerprint([&moved])
        );
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        // "ab" + "" must not collide with "a" + "b" across records.
        let left = [instance(0, Some(1), false, "ab"), instance(1, Some(2), false, "c")];
        let right = [instance(0, Some(1), false, "a"), instance(1, Some(2), false, "bc")];
        assert_ne!(fingerprint(&left), fingerprint(&right));
    }

    #[test]
    fn test_empty_document() {
        let empty: [TaskInstance; 0] = [];
        let hash = fingerprint(&empty);
        assert_eq!(hash.as_str().len(), 64);
        assert_eq!(hash.to_string().len(), 12);
    }

    #[test]
    fn test_display_of_foreign_hash() {
        // Stored hashes come from hosts and need not be hex.
        let hash: FileStateHash = serde_json::from_str("\"ééééééééééééééé\"").unwrap();
        assert_eq!(hash.to_string(), "é".repeat(12));

        let short: FileStateHash = serde_json::from_str("\"ab\"").unwrap();
        assert_eq!(short.to_string(), "ab");
    }
}
