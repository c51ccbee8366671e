use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::EngineError;
use crate::key::StateKey;
use crate::transition::Transition;

/// A type-erased message posted to the engine or returned by a handler as a
/// transition payload.
#[derive(Clone)]
pub struct Message(Arc<dyn Any + Send + Sync>);

impl Message {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub(crate) fn ptr_eq(&self, other: &Message) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message(..)")
    }
}

/// An ordered, string-keyed bag of metadata carried by a transition.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Closure run between exit and entry of a transition, see §4.7.
pub type TransitionAction = Arc<
    dyn Fn(&mut crate::context::TransitionContext<'_>) -> futures::future::BoxFuture<'static, crate::error::EngineResult<()>>
        + Send
        + Sync,
>;

/// Outcome of a message or timer handler, interpreted by the dispatcher.
pub enum MessageResult {
    /// Transition to `target`.
    GoTo {
        target: StateKey,
        action: Option<TransitionAction>,
        payload: Option<Message>,
        reenter: bool,
        metadata: Metadata,
    },
    /// Message was handled; no transition.
    Internal,
    /// Exit and re-enter the handling state without changing the leaf target.
    SelfTransition { action: Option<TransitionAction> },
    /// Transition to the reserved stopped final leaf.
    Stop,
    /// Not handled by this node; bubble to the parent.
    Unhandled,
}

impl MessageResult {
    pub fn go_to(target: StateKey) -> Self {
        MessageResult::GoTo {
            target,
            action: None,
            payload: None,
            reenter: false,
            metadata: Metadata::new(),
        }
    }

    pub fn reenter(target: StateKey) -> Self {
        MessageResult::GoTo {
            target,
            action: None,
            payload: None,
            reenter: true,
            metadata: Metadata::new(),
        }
    }

    pub fn with_action(mut self, action: TransitionAction) -> Self {
        if let MessageResult::GoTo { action: a, .. } | MessageResult::SelfTransition { action: a } = &mut self {
            *a = Some(action);
        }
        self
    }

    pub fn with_payload(mut self, payload: Message) -> Self {
        if let MessageResult::GoTo { payload: p, .. } = &mut self {
            *p = Some(payload);
        }
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        if let MessageResult::GoTo { metadata: m, .. } = &mut self {
            *m = metadata;
        }
        self
    }

    pub fn self_transition() -> Self {
        MessageResult::SelfTransition { action: None }
    }
}

/// Record of a message that a handler somewhere in the ancestor chain
/// accepted.
#[derive(Debug, Clone)]
pub struct HandledMessage {
    pub handling_state: StateKey,
    pub notified_states: Vec<StateKey>,
    pub transition: Option<Transition>,
}

/// Record of a message no node in the ancestor chain accepted.
#[derive(Debug, Clone)]
pub struct UnhandledMessage {
    pub notified_states: Vec<StateKey>,
}

/// Record of a message whose handler threw.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    pub handling_state: Option<StateKey>,
    pub error: EngineError,
}

/// Outcome of processing one posted message, emitted on the
/// `processedMessages` stream (and split further across `handledMessages` /
/// `failedMessages`).
#[derive(Debug, Clone)]
pub enum ProcessedMessage {
    Handled(HandledMessage),
    Unhandled(UnhandledMessage),
    Failed(FailedMessage),
}

/// One entry of the engine's internal FIFO queue. Carries an optional reply
/// channel so an external `Engine::post` can observe this message's outcome
/// while messages enqueued from inside a handler (`ctx.post`, timers) pass
/// `reply: None` and only surface on the `processedMessages` stream.
pub(crate) struct QueueItem {
    pub msg: Message,
    pub reply: Option<oneshot::Sender<ProcessedMessage>>,
}
