use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::key::StateKey;
use crate::lifecycle::LifecycleState;
use crate::message::{FailedMessage, HandledMessage, ProcessedMessage};
use crate::transition::Transition;

/// Broadcast channels the machine facade exposes, shared between the actor
/// task (which publishes) and every cloned [`crate::engine::Engine`] handle
/// (which subscribes). Plain, process-local pub/sub, same shape as the
/// subscription broadcasts used elsewhere in this codebase's lineage.
pub(crate) struct EngineStreams {
    pub transitions: broadcast::Sender<Transition>,
    pub processed_messages: broadcast::Sender<ProcessedMessage>,
    pub handled_messages: broadcast::Sender<HandledMessage>,
    pub failed_messages: broadcast::Sender<FailedMessage>,
    pub lifecycle: broadcast::Sender<LifecycleState>,
    pub data: Mutex<HashMap<StateKey, DataStreamSlot>>,
}

pub(crate) struct DataStreamSlot {
    sender: Box<dyn Any + Send + Sync>,
    last: Option<Box<dyn Any + Send + Sync>>,
    closed: bool,
}

impl EngineStreams {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (transitions, _) = broadcast::channel(capacity);
        let (processed_messages, _) = broadcast::channel(capacity);
        let (handled_messages, _) = broadcast::channel(capacity);
        let (failed_messages, _) = broadcast::channel(capacity);
        let (lifecycle, _) = broadcast::channel(capacity.min(16).max(1));
        Arc::new(Self {
            transitions,
            processed_messages,
            handled_messages,
            failed_messages,
            lifecycle,
            data: Mutex::new(HashMap::new()),
        })
    }

    /// Publishes one dispatch outcome to `processedMessages` and, depending
    /// on its variant, to `handledMessages` or `failedMessages` as well.
    pub fn publish_processed(&self, processed: ProcessedMessage) {
        match &processed {
            ProcessedMessage::Handled(h) => {
                let _ = self.handled_messages.send(h.clone());
            }
            ProcessedMessage::Failed(f) => {
                let _ = self.failed_messages.send(f.clone());
            }
            ProcessedMessage::Unhandled(_) => {}
        }
        let _ = self.processed_messages.send(processed);
    }

    fn slot_for<D: Clone + Send + Sync + 'static>(
        &self,
        key: &StateKey,
        capacity: usize,
    ) -> (broadcast::Sender<D>, Option<D>) {
        let mut guard = self.data.lock().expect("data stream registry poisoned");
        let slot = guard.entry(key.clone()).or_insert_with(|| {
            let (tx, _) = broadcast::channel::<D>(capacity);
            DataStreamSlot {
                sender: Box::new(tx),
                last: None,
                closed: false,
            }
        });
        let tx = slot
            .sender
            .downcast_ref::<broadcast::Sender<D>>()
            .expect("data stream type mismatch for this key")
            .clone();
        let last = slot
            .last
            .as_ref()
            .and_then(|v| v.downcast_ref::<D>())
            .cloned();
        (tx, last)
    }

    /// Called by the actor whenever a data state's value changes (including
    /// the value it's seeded with on entry).
    pub fn publish<D: Clone + Send + Sync + 'static>(&self, key: &StateKey, value: D, capacity: usize) {
        let (tx, _) = self.slot_for::<D>(key, capacity);
        let _ = tx.send(value.clone());
        let mut guard = self.data.lock().expect("data stream registry poisoned");
        if let Some(slot) = guard.get_mut(key) {
            slot.last = Some(Box::new(value));
            slot.closed = false;
        }
    }

    /// Called by the actor when a data state exits.
    pub fn mark_closed(&self, key: &StateKey) {
        let mut guard = self.data.lock().expect("data stream registry poisoned");
        if let Some(slot) = guard.get_mut(key) {
            slot.last = None;
            slot.closed = true;
        }
    }

    pub fn current<D: Clone + Send + Sync + 'static>(&self, key: &StateKey) -> Option<D> {
        let guard = self.data.lock().expect("data stream registry poisoned");
        guard
            .get(key)
            .filter(|slot| !slot.closed)
            .and_then(|slot| slot.last.as_ref())
            .and_then(|v| v.downcast_ref::<D>())
            .cloned()
    }

    pub fn subscribe<D: Clone + Send + Sync + 'static>(
        &self,
        key: &StateKey,
        capacity: usize,
    ) -> (Option<D>, broadcast::Receiver<D>) {
        let (tx, last) = self.slot_for::<D>(key, capacity);
        (last, tx.subscribe())
    }
}
