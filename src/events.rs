//! Change notifications emitted by the path index.
//!
//! Subscribers (project manager, parser caches) hold a broadcast receiver;
//! dropping the receiver unsubscribes. Events are only sent for real changes,
//! never for updates the stats gate rejected.

use tokio::sync::broadcast;

use crate::path::IndexPath;
use crate::stats::Stats;

#[derive(Debug, Clone, PartialEq)]
pub enum FileEvent {
    NewFile {
        path: IndexPath,
    },
    ChangedFile {
        path: IndexPath,
        old_stats: Stats,
        new_stats: Stats,
    },
    DeletedFile {
        path: IndexPath,
    },
}

impl FileEvent {
    pub fn path(&self) -> &IndexPath {
        match self {
            FileEvent::NewFile { path }
            | FileEvent::ChangedFile { path, .. }
            | FileEvent::DeletedFile { path } => path,
        }
    }
}

/// Fan-out of file events to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FileEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn send(&self, event: FileEvent) {
        match self.sender.send(event) {
            Ok(count) => {
                crate::debug_event!("events", "sent", "to {count} subscribers");
            }
            Err(broadcast::error::SendError(event)) => {
                // No receivers, this is fine
                crate::debug_event!("events", "dropped", "no subscribers for {event:?}");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.sender.subscribe()
    }

}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
