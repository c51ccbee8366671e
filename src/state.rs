use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::key::StateKey;
use crate::lifecycle::LifecycleState;
use crate::message::{Message, QueueItem};
use crate::node::{DataSpec, TreeIndex};
use crate::scheduler::{schedule_timer, TimerHandle, TimerRegistry};
use crate::streams::EngineStreams;

/// A data state's current value, type-erased. The engine never needs a
/// concrete `D` here — only `TransitionContext::data::<D>` and friends do,
/// at the point they downcast back.
struct ActiveData {
    value: Box<dyn Any + Send>,
    closed: bool,
}

/// All mutable state owned by the actor task. Never shared across an
/// `.await` boundary with any other task — the actor is the sole owner
/// (§5: "no locks are required under the single-threaded contract").
pub(crate) struct EngineState {
    pub tree: Arc<TreeIndex>,
    pub config: EngineConfig,
    pub lifecycle: LifecycleState,
    pub current_leaf: Option<StateKey>,
    data_values: HashMap<StateKey, ActiveData>,
    pub timers: TimerRegistry,
    pub queue_tx: mpsc::Sender<QueueItem>,
    pub streams: Arc<EngineStreams>,
}

impl EngineState {
    pub fn new(
        tree: Arc<TreeIndex>,
        config: EngineConfig,
        queue_tx: mpsc::Sender<QueueItem>,
        streams: Arc<EngineStreams>,
    ) -> Self {
        Self {
            tree,
            config,
            lifecycle: LifecycleState::Constructed,
            current_leaf: None,
            data_values: HashMap::new(),
            timers: TimerRegistry::default(),
            queue_tx,
            streams,
        }
    }

    pub fn current_leaf_key(&self) -> EngineResult<StateKey> {
        self.current_leaf
            .clone()
            .ok_or_else(|| EngineError::InvalidLifecycle("engine has not been started".into()))
    }

    /// Seeds the data value for `key` (a freshly entered data state), per
    /// §4.7 step 4. `value` must be the output of `spec.initial(ctx)` or a
    /// caller-supplied override of the same underlying type.
    pub fn seed_data(&mut self, key: StateKey, value: Box<dyn Any + Send>, spec: &DataSpec) {
        (spec.publish)(&self.streams, &key, value.as_ref(), self.config.broadcast_capacity);
        self.data_values.insert(
            key,
            ActiveData {
                value,
                closed: false,
            },
        );
    }

    pub fn get_data<D: Clone + Send + Sync + 'static>(&self, key: &StateKey) -> EngineResult<D> {
        let active = self.data_values.get(key).ok_or(EngineError::UseAfterClose)?;
        if active.closed {
            return Err(EngineError::UseAfterClose);
        }
        active
            .value
            .downcast_ref::<D>()
            .cloned()
            .ok_or_else(|| EngineError::StateNotFound(key.clone()))
    }

    pub fn update_data<D: Clone + Send + Sync + 'static>(
        &mut self,
        key: &StateKey,
        f: impl FnOnce(&D) -> D,
    ) -> EngineResult<D> {
        let active = self
            .data_values
            .get_mut(key)
            .ok_or(EngineError::UseAfterClose)?;
        if active.closed {
            return Err(EngineError::UseAfterClose);
        }
        let current = active
            .value
            .downcast_ref::<D>()
            .ok_or_else(|| EngineError::StateNotFound(key.clone()))?;
        let updated = f(current);
        active.value = Box::new(updated.clone());
        self.streams
            .publish(key, updated.clone(), self.config.broadcast_capacity);
        Ok(updated)
    }

    /// Dynamic fallback for `dataValue<D>(key?)` / `ctx.data_dynamic<D>()`:
    /// scans the active path leaf-to-root for the nearest state whose key's
    /// bound type matches `D` (§9 "retain a dynamic fallback for interop
    /// only").
    pub fn find_active_data_key<D: 'static>(&self) -> Option<StateKey> {
        let leaf_key = self.current_leaf.as_ref()?;
        let leaf = self.tree.get(leaf_key).ok()?;
        leaf.self_and_ancestors()
            .find(|n| n.key.data_type() == Some(TypeId::of::<D>()))
            .map(|n| n.key.clone())
    }

    /// Closes and drops the data value owned by `key`. Void data states
    /// (§9.3) are never closed: once off the active path nothing can read
    /// them again anyway, so there's nothing to enforce.
    pub fn close_data(&mut self, key: &StateKey, is_void: bool) {
        if is_void {
            self.data_values.remove(key);
            return;
        }
        self.data_values.remove(key);
        self.streams.mark_closed(key);
    }

    /// Encodes the currently held value for `key` through its node's codec,
    /// for `saveTo` (§4.11). `None` if the state has no data, no codec, or
    /// its value is closed.
    pub fn encode_data(&self, key: &StateKey) -> Option<serde_json::Value> {
        let active = self.data_values.get(key)?;
        if active.closed {
            return None;
        }
        let node = self.tree.get(key).ok()?;
        let codec = node.data.as_ref()?.codec.as_ref()?;
        codec.encode_any(active.value.as_ref())
    }

    pub fn schedule(
        &mut self,
        owner: StateKey,
        produce: Arc<dyn Fn() -> Message + Send + Sync>,
        duration: Duration,
        periodic: bool,
    ) -> EngineResult<TimerHandle> {
        schedule_timer(
            owner,
            self.queue_tx.clone(),
            produce,
            duration,
            periodic,
            self.config.min_timer_interval,
            &mut self.timers,
        )
    }

    pub async fn post(&self, msg: Message) -> EngineResult<()> {
        self.queue_tx
            .send(QueueItem { msg, reply: None })
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}
