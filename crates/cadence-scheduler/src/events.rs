//! Broadcast of human-readable scheduler lines.

use tokio::sync::broadcast;
use tracing::info;

/// Buffered lines per subscriber before the slowest one starts lagging.
const DEFAULT_CAPACITY: usize = 256;

/// Fan-out channel for status lines.
///
/// Publishing never blocks and never fails: with no subscribers the line is
/// only logged.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, line: impl Into<String>) {
        let line = line.into();
        info!(target: "cadence_scheduler::events", "{line}");
        let _ = self.tx.send(line);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
