//! State-transition feed for UI and logging consumers.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::allocation::Category;
use crate::record::RequestId;

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    RecordCreated {
        id: Uuid,
        category: Category,
        request_id: RequestId,
    },
    RecordFulfilled {
        id: Uuid,
        category: Category,
        request_id: RequestId,
    },
    RecordConsumed {
        id: Uuid,
        category: Category,
        request_id: RequestId,
    },
    RefillTriggered {
        category: Category,
        deficit: u32,
    },
    BatchFailed {
        category: Category,
        index: usize,
        count: u32,
        reason: String,
    },
}

/// Broadcast feed of [`PoolEvent`]s. Slow subscribers lag rather than block
/// the pool.
#[derive(Clone)]
pub struct EventFeed {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}
