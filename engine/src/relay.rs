//! Merges per-branch event queues into one consumer-facing stream.

use futures_util::stream::{self, BoxStream, SelectAll, StreamExt};
use tokio::sync::mpsc;

use fanout_types::Event;

/// Fan-in of every branch's events.
///
/// Each branch gets its own bounded queue, so a slow consumer back-pressures
/// branches individually and events from one branch keep their emission order.
/// No order is implied across branches.
pub struct EventRelay {
    merged: SelectAll<BoxStream<'static, Event>>,
    capacity: usize,
}

impl EventRelay {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            merged: SelectAll::new(),
            capacity: capacity.max(1),
        }
    }

    /// Open a new per-branch queue.
    pub fn register(&mut self) -> RelaySender {
        let (tx, rx) = mpsc::channel(self.capacity);
        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();
        self.merged.push(events);
        RelaySender {
            tx,
            detached: false,
        }
    }

    /// Next event from any branch. `None` once every sender is gone and all
    /// queues are empty.
    pub async fn next(&mut self) -> Option<Event> {
        self.merged.next().await
    }
}

impl std::fmt::Debug for EventRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRelay")
            .field("queues", &self.merged.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Producer side of one branch's queue.
#[derive(Debug)]
pub struct RelaySender {
    tx: mpsc::Sender<Event>,
    detached: bool,
}

impl RelaySender {
    /// Forward an event, waiting while the queue is full.
    ///
    /// Returns `false` once the consumer has gone away. The branch keeps running
    /// so its terminal result is still recorded.
    pub async fn forward(&mut self, event: Event) -> bool {
        if self.detached {
            return false;
        }
        if self.tx.send(event).await.is_err() {
            self.detached = true;
            tracing::debug!("event consumer gone; dropping further events for this branch");
            return false;
        }
        true
    }
}
