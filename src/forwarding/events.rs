//! Forward Event System
//!
//! Lifecycle events for forwarding records, fanned out over a broadcast
//! channel. Slow subscribers miss events (`RecvError::Lagged`) rather than
//! blocking the registry.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use super::registry::ForwardingRecord;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ForwardEventKind {
    Started,
    Stopped,
    Error,
    Deleted,
}

/// A record state change, carrying the record as it is after the change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardEvent {
    #[serde(rename = "type")]
    pub kind: ForwardEventKind,
    pub record: ForwardingRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event emitter for the forwarding registry
#[derive(Debug, Clone)]
pub struct ForwardEventEmitter {
    tx: broadcast::Sender<ForwardEvent>,
}

impl ForwardEventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; having no subscribers is fine
    pub fn emit(&self, kind: ForwardEventKind, record: &ForwardingRecord) {
        trace!("Forward event {:?} for {}", kind, record.id);
        let _ = self.tx.send(ForwardEvent {
            kind,
            record: record.clone(),
            error: record.error.clone(),
        });
    }
}

impl Default for ForwardEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
