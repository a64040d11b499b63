use tokio::sync::broadcast;

use crate::error::Error;
use crate::queue::QueueEntry;

/// Playback milestones, for the transport to turn into announcements
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// Admitted to a session's queue; `position` is 1-based
    Queued {
        session: String,
        entry: QueueEntry,
        position: usize,
    },
    Started {
        session: String,
        entry: QueueEntry,
    },
    Finished {
        session: String,
        entry: QueueEntry,
    },
    /// The output refused to play the entry; it is dropped
    Failed {
        session: String,
        entry: QueueEntry,
        error: Error,
    },
}

impl PlaybackEvent {
    pub fn session(&self) -> &str {
        match self {
            PlaybackEvent::Queued { session, .. }
            | PlaybackEvent::Started { session, .. }
            | PlaybackEvent::Finished { session, .. }
            | PlaybackEvent::Failed { session, .. } => session,
        }
    }
}

/// Fan-out of playback events to any number of listeners
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlaybackEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.tx.subscribe()
    }

    /// Events with no listener are dropped
    pub fn broadcast(&self, event: PlaybackEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
