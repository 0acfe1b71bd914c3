//! Trailing-edge debouncer keyed by document.
//!
//! Plain bookkeeping with no timers of its own: the caller passes `now` in and
//! polls [`Debouncer::take_settled`] from whatever tick it has. A new touch for
//! a key restarts that key's window.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Debouncer<K> {
    window: Duration,
    pending: HashMap<K, Instant>,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Ord,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Changes the window for pending and future keys.
    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Records activity for `key`. Returns true if the key was already
    /// pending and its window was restarted.
    pub fn touch(&mut self, key: K, now: Instant) -> bool {
        self.pending.insert(key, now).is_some()
    }

    /// Drops a pending key. Returns true if it was pending.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.pending.remove(key).is_some()
    }

    /// Moves a pending key, keeping its last activity time.
    pub fn rekey(&mut self, from: &K, to: K) -> bool {
        match self.pending.remove(from) {
            Some(at) => {
                self.pending.insert(to, at);
                true
            }
            None => false,
        }
    }

    /// Removes and returns every key that has been quiet for a full window,
    /// oldest first.
    pub fn take_settled(&mut self, now: Instant) -> Vec<K> {
        let mut settled: Vec<(Instant, K)> = self
            .pending
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= self.window)
            .map(|(key, &at)| (at, key.clone()))
            .collect();
        settled.sort();

        for (_, key) in &settled {
            self.pending.remove(key);
        }
        settled.into_iter().map(|(_, key)| key).collect()
    }

    /// Removes and returns every pending key regardless of age.
    pub fn take_all(&mut self) -> Vec<K> {
        let mut all: Vec<(Instant, K)> = self.pending.drain().map(|(k, at)| (at, k)).collect();
        all.sort();
        all.into_iter().map(|(_, key)| key).collect()
    }

    /// When the oldest pending key settles.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().map(|&at| at + self.window)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
