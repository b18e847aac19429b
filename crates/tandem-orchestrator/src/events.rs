use tokio::sync::broadcast;

use crate::types::RunEventRecord;

/// Fan-out of sequenced run events to any number of observers. Slow
/// subscribers lag and drop; the durable copy lives in `events.jsonl`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEventRecord>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(2048)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEventRecord> {
        self.tx.subscribe()
    }

    pub fn publish(&self, record: RunEventRecord) {
        let _ = self.tx.send(record);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
