//! Index event fan-out.
//!
//! Subscribers register a handler and receive every published event, in
//! publish order, synchronously on the publishing thread. Handlers must not
//! call back into the [`TaskIndex`](crate::TaskIndex) that owns the bus; use
//! [`EventBus::subscribe_channel`] to consume events from another task.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tally_core::{Location, TaskId, TaskInstance};
use tokio::sync::mpsc;
use tracing::debug;

/// Everything the index tells the outside world about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexEvent {
    /// The index was seeded from a full scan.
    TaskSetInitialized { tasks: usize, instances: usize },
    /// Instances in one document were added, changed or removed.
    InstancesModified {
        path: PathBuf,
        upserted: Vec<TaskInstance>,
        removed: Vec<Location>,
    },
    /// A document was deleted; `removed_tasks` lost their last instance.
    FileDeleted {
        path: PathBuf,
        removed_tasks: Vec<TaskId>,
    },
    FileRenamed { from: PathBuf, to: PathBuf },
    SettingsUpdated,
}

impl IndexEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            IndexEvent::TaskSetInitialized { .. } => "task_set_initialized",
            IndexEvent::InstancesModified { .. } => "instances_modified",
            IndexEvent::FileDeleted { .. } => "file_deleted",
            IndexEvent::FileRenamed { .. } => "file_renamed",
            IndexEvent::SettingsUpdated => "settings_updated",
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type Handler = Arc<dyn Fn(&IndexEvent) + Send + Sync>;

enum Subscriber {
    Handler(Handler),
    Channel(mpsc::UnboundedSender<IndexEvent>),
}

/// Observer registry.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&IndexEvent) + Send + Sync + 'static,
    {
        self.register(Subscriber::Handler(Arc::new(handler)))
    }

    /// Subscribes with an unbounded channel. Events arrive in publish order.
    /// The subscription is released on the first publish after the receiver
    /// is dropped.
    pub fn subscribe_channel(&mut self) -> (SubscriptionId, mpsc::UnboundedReceiver<IndexEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register(Subscriber::Channel(tx)), rx)
    }

    fn register(&mut self, subscriber: Subscriber) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscribers.push((id, subscriber));
        debug!("Subscribed {}", id);
        id
    }

    /// Returns false if the id was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        let removed = self.subscribers.len() != before;
        if removed {
            debug!("Unsubscribed {}", id);
        }
        removed
    }

    pub fn publish(&mut self, event: &IndexEvent) {
        debug!(
            "Publishing {} to {} subscribers",
            event.kind(),
            self.subscribers.len()
        );
        self.subscribers.retain(|(id, subscriber)| match subscriber {
            Subscriber::Handler(handler) => {
                handler(event);
                true
            }
            Subscriber::Channel(tx) => {
                let open = tx.send(event.clone()).is_ok();
                if !open {
                    debug!("Released {} (receiver dropped)", id);
                }
                open
            }
        });
    }

    /// Releases every subscription.
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
