//! Change propagation bus.
//!
//! Every open document gets its own broadcast channel. Editors publish the
//! full clip list after each local mutation; siblings subscribed to the same
//! document merge it by id against their own state. Delivery happens on the
//! receiver's task, never inside the publisher's call stack.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::protocol::Clip;
use super::{DocumentId, EditorId};

/// Default per-document channel capacity
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Kind of content an update pertains to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Text,
}

/// Who produced an update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// A local mutation in the named editor
    Editor(EditorId),
    /// An acknowledged server write
    Server,
}

/// `segmentsReplaced` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentsReplaced {
    pub document_id: DocumentId,
    pub lane: Lane,
    pub clips: Vec<Clip>,
    pub origin: Origin,
    /// For server acks, the local list the acknowledged write was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted: Option<Vec<Clip>>,
}

/// Registry of per-document channels
#[derive(Clone)]
pub struct ChangeBus {
    channels: Arc<DashMap<DocumentId, broadcast::Sender<SegmentsReplaced>>>,
    capacity: usize,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Get or create the channel for a document
    pub fn channel(&self, document_id: &str) -> DocumentChannel {
        let tx = self
            .channels
            .entry(document_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();

        DocumentChannel {
            document_id: document_id.to_string(),
            tx,
        }
    }

    /// Forget a document's channel. Existing handles keep working.
    pub fn close(&self, document_id: &str) {
        if self.channels.remove(document_id).is_some() {
            debug!("Closed bus channel for document {}", document_id);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Publish/subscribe handle scoped to one document
#[derive(Clone)]
pub struct DocumentChannel {
    document_id: DocumentId,
    tx: broadcast::Sender<SegmentsReplaced>,
}

impl DocumentChannel {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Broadcast a replaced clip list. Returns the number of receivers.
    pub fn publish(&self, lane: Lane, clips: Vec<Clip>, origin: Origin) -> usize {
        self.send(SegmentsReplaced {
            document_id: self.document_id.clone(),
            lane,
            clips,
            origin,
            submitted: None,
        })
    }

    /// Broadcast an acknowledged server list with the list that was submitted
    pub fn publish_ack(&self, lane: Lane, clips: Vec<Clip>, submitted: Vec<Clip>) -> usize {
        self.send(SegmentsReplaced {
            document_id: self.document_id.clone(),
            lane,
            clips,
            origin: Origin::Server,
            submitted: Some(submitted),
        })
    }

    fn send(&self, event: SegmentsReplaced) -> usize {
        // No subscribers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            document_id: self.document_id.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving end of a document channel
pub struct Subscription {
    document_id: DocumentId,
    rx: broadcast::Receiver<SegmentsReplaced>,
}

impl Subscription {
    /// Wait for the next event; `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<SegmentsReplaced> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscriber for document {} lagged, skipped {} updates",
                        self.document_id, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event already delivered, without waiting
    pub fn try_recv(&mut self) -> Option<SegmentsReplaced> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscriber for document {} lagged, skipped {} updates",
                        self.document_id, skipped
                    );
                }
                Err(_) => return None,
            }
        }
    }
}
