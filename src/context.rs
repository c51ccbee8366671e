use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineResult;
use crate::key::{DataStateKey, StateKey};
use crate::message::{Message, Metadata};
use crate::scheduler::TimerHandle;
use crate::state::EngineState;

/// Context threaded through one transition's exit/action/entry chain (§4.7).
/// Grows `entered`/`exited` as the transition proceeds and carries the
/// mutable `metadata` map handlers may annotate.
pub struct TransitionContext<'a> {
    pub(crate) state: &'a mut EngineState,
    pub handling_state: StateKey,
    pub payload: Option<Message>,
    pub entered: Vec<StateKey>,
    pub exited: Vec<StateKey>,
    pub metadata: Metadata,
    pub(crate) redirect: Option<StateKey>,
}

impl<'a> TransitionContext<'a> {
    pub(crate) fn new(state: &'a mut EngineState, handling_state: StateKey, payload: Option<Message>, metadata: Metadata) -> Self {
        Self {
            state,
            handling_state,
            payload,
            entered: Vec::new(),
            exited: Vec::new(),
            metadata,
            redirect: None,
        }
    }

    /// Reads the data value bound to `key` against the currently active
    /// states.
    pub fn data<D: Clone + Send + Sync + 'static>(&self, key: &DataStateKey<D>) -> EngineResult<D> {
        self.state.get_data(key.key())
    }

    /// Dynamic fallback: nearest active state whose bound type is `D`.
    pub fn data_dynamic<D: Clone + Send + Sync + 'static>(&self) -> EngineResult<D> {
        match self.state.find_active_data_key::<D>() {
            Some(key) => self.state.get_data(&key),
            None => Err(crate::error::EngineError::StateNotFound(StateKey::new(
                std::any::type_name::<D>(),
            ))),
        }
    }

    pub fn update_data<D: Clone + Send + Sync + 'static>(
        &mut self,
        key: &DataStateKey<D>,
        f: impl FnOnce(&D) -> D,
    ) -> EngineResult<D> {
        self.state.update_data(key.key(), f)
    }

    pub async fn post(&self, msg: Message) -> EngineResult<()> {
        self.state.post(msg).await
    }

    pub fn schedule(
        &mut self,
        produce: Arc<dyn Fn() -> Message + Send + Sync>,
        duration: Duration,
        periodic: bool,
    ) -> EngineResult<TimerHandle> {
        self.state
            .schedule(self.handling_state.clone(), produce, duration, periodic)
    }

    /// Requests that the in-progress entry path be abandoned in favor of a
    /// new target, honored by the transition engine once this handler
    /// returns (§4.7 step 4).
    pub fn redirect_to(&mut self, target: StateKey) {
        self.redirect = Some(target);
    }

    pub(crate) fn take_redirect(&mut self) -> Option<StateKey> {
        self.redirect.take()
    }
}

/// Context passed to `onMessage` handlers. Narrower than
/// [`TransitionContext`]: a message handler doesn't grow an entry/exit path,
/// it only decides the [`crate::message::MessageResult`].
pub struct MessageContext<'a> {
    pub(crate) state: &'a mut EngineState,
    pub handling_state: StateKey,
}

impl<'a> MessageContext<'a> {
    pub(crate) fn new(state: &'a mut EngineState, handling_state: StateKey) -> Self {
        Self {
            state,
            handling_state,
        }
    }

    pub fn data<D: Clone + Send + Sync + 'static>(&self, key: &DataStateKey<D>) -> EngineResult<D> {
        self.state.get_data(key.key())
    }

    pub fn data_dynamic<D: Clone + Send + Sync + 'static>(&self) -> EngineResult<D> {
        match self.state.find_active_data_key::<D>() {
            Some(key) => self.state.get_data(&key),
            None => Err(crate::error::EngineError::StateNotFound(StateKey::new(
                std::any::type_name::<D>(),
            ))),
        }
    }

    pub fn update_data<D: Clone + Send + Sync + 'static>(
        &mut self,
        key: &DataStateKey<D>,
        f: impl FnOnce(&D) -> D,
    ) -> EngineResult<D> {
        self.state.update_data(key.key(), f)
    }

    pub async fn post(&self, msg: Message) -> EngineResult<()> {
        self.state.post(msg).await
    }

    pub fn schedule(
        &mut self,
        produce: Arc<dyn Fn() -> Message + Send + Sync>,
        duration: Duration,
        periodic: bool,
    ) -> EngineResult<TimerHandle> {
        self.state
            .schedule(self.handling_state.clone(), produce, duration, periodic)
    }
}
