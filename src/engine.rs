use std::any::TypeId;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, PostMessageErrorPolicy};
use crate::data::DataValue;
use crate::dispatch::dispatch_message;
use crate::error::{EngineError, EngineResult};
use crate::key::{DataStateKey, StateKey};
use crate::lifecycle::LifecycleState;
use crate::message::{FailedMessage, HandledMessage, Message, Metadata, ProcessedMessage, QueueItem};
use crate::node::{build_tree, NodeDef, NodeKind, TreeIndex};
use crate::scheduler::stopped_state_key;
use crate::snapshot::{resolve_and_validate, SnapshotEnvelope, SnapshotEntry, DATA_VERSION, SNAPSHOT_VERSION};
use crate::state::EngineState;
use crate::streams::EngineStreams;
use crate::transition::{compute_path, run_transition, DataOverrides, NodePath, Transition};

/// Builder for `Engine::start`/`Engine::load_from`'s optional parameters
/// (§4.8, §4.11). Kept as a struct rather than a handful of `Option`
/// arguments so call sites read `StartOptions::new().at(x)` instead of a wall
/// of positional `None`s.
#[derive(Default)]
pub struct StartOptions {
    at: Option<StateKey>,
    with_data: DataOverrides,
    payload: Option<Message>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, target: StateKey) -> Self {
        self.at = Some(target);
        self
    }

    pub fn with_data<D: Send + 'static>(mut self, key: &DataStateKey<D>, value: D) -> Self {
        self.with_data.insert(key.key().clone(), Box::new(value));
        self
    }

    pub fn payload(mut self, msg: Message) -> Self {
        self.payload = Some(msg);
        self
    }
}

/// A frozen read of the engine's active path at the moment a command
/// completed (§4.1). Cheap to hold onto: it owns a clone of the `Engine`
/// handle, not a borrow, so it stays valid after further transitions occur
/// elsewhere.
#[derive(Clone)]
pub struct CurrentState {
    key: StateKey,
    active_states: Vec<StateKey>,
    engine: Engine,
}

impl CurrentState {
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Leaf-to-root chain of every state currently active.
    pub fn active_states(&self) -> &[StateKey] {
        &self.active_states
    }

    pub fn is_in_state(&self, key: &StateKey) -> bool {
        self.active_states.iter().any(|k| k == key)
    }

    fn resolve_dynamic<D: 'static>(&self) -> EngineResult<StateKey> {
        self.active_states
            .iter()
            .find(|k| k.data_type() == Some(TypeId::of::<D>()))
            .cloned()
            .ok_or_else(|| EngineError::StateNotFound(StateKey::new(std::any::type_name::<D>())))
    }

    /// Snapshot of the current value of a data state on the active path. With
    /// `key: None`, resolves dynamically to the nearest active state whose
    /// bound type is `D` (§9 "dynamic fallback for interop only").
    pub fn data_value<D: Clone + Send + Sync + 'static>(&self, key: Option<&StateKey>) -> EngineResult<DataValue<D>> {
        let key = match key {
            Some(k) => k.clone(),
            None => self.resolve_dynamic::<D>()?,
        };
        Ok(match self.engine.streams.current::<D>(&key) {
            Some(v) => DataValue::holding(v),
            None => DataValue::empty(),
        })
    }

    /// Subscribes to a data state's value stream, returning the value held
    /// right now (if any) alongside the live receiver (§6.2 `dataStream<D>`).
    pub fn data_stream<D: Clone + Send + Sync + 'static>(
        &self,
        key: Option<&StateKey>,
    ) -> EngineResult<(Option<D>, broadcast::Receiver<D>)> {
        let key = match key {
            Some(k) => k.clone(),
            None => self.resolve_dynamic::<D>()?,
        };
        Ok(self.engine.streams.subscribe::<D>(&key, self.engine.config.broadcast_capacity))
    }

    pub async fn post(&self, msg: Message) -> EngineResult<ProcessedMessage> {
        self.engine.post(msg).await
    }
}

/// Control-plane request sent over the command channel. Distinct from the
/// message queue so lifecycle operations never wait behind a backlog of
/// ordinary posted messages (§5).
pub(crate) enum Command {
    Start {
        at: Option<StateKey>,
        with_data: DataOverrides,
        payload: Option<Message>,
        reply: oneshot::Sender<EngineResult<CurrentStateInner>>,
    },
    Stop {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
    SaveTo {
        reply: oneshot::Sender<EngineResult<SnapshotEnvelope>>,
    },
    LoadFrom {
        envelope: SnapshotEnvelope,
        reply: oneshot::Sender<EngineResult<CurrentStateInner>>,
    },
}

pub(crate) struct CurrentStateInner {
    key: StateKey,
    active_states: Vec<StateKey>,
}

/// A handle to a running hierarchical state machine. Cheap to `Clone`: every
/// clone talks to the same actor task over the same channels (§5). Dropping
/// every handle does not dispose the machine; call [`Engine::dispose`]
/// explicitly.
#[derive(Clone)]
pub struct Engine {
    queue_tx: mpsc::Sender<QueueItem>,
    cmd_tx: mpsc::Sender<Command>,
    pub(crate) streams: Arc<EngineStreams>,
    pub(crate) config: EngineConfig,
}

impl Engine {
    /// Builds the tree (injecting the reserved stopped final leaf, §6.4) and
    /// spawns the actor task that will own all mutable state from here on.
    pub fn new(mut root_def: NodeDef, config: EngineConfig) -> EngineResult<Self> {
        root_def = root_def.child(NodeDef::new(stopped_state_key(), NodeKind::FinalLeaf));
        let tree = Arc::new(TreeIndex::build(build_tree(root_def)?));
        let streams = EngineStreams::new(config.broadcast_capacity);
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.queue_capacity);
        let state = EngineState::new(tree, config.clone(), queue_tx.clone(), streams.clone());
        tokio::spawn(run_actor(state, cmd_rx, queue_rx));
        Ok(Self {
            queue_tx,
            cmd_tx,
            streams,
            config,
        })
    }

    pub async fn start(&self, options: StartOptions) -> EngineResult<CurrentState> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Start {
                at: options.at,
                with_data: options.with_data,
                payload: options.payload,
                reply,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        self.finish(rx).await
    }

    pub async fn stop(&self) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stop { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn dispose(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Dispose { reply }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub async fn save_to(&self) -> EngineResult<SnapshotEnvelope> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SaveTo { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn load_from(&self, envelope: SnapshotEnvelope) -> EngineResult<CurrentState> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::LoadFrom { envelope, reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        self.finish(rx).await
    }

    async fn finish(&self, rx: oneshot::Receiver<EngineResult<CurrentStateInner>>) -> EngineResult<CurrentState> {
        let inner = rx.await.map_err(|_| EngineError::ChannelClosed)??;
        Ok(CurrentState {
            key: inner.key,
            active_states: inner.active_states,
            engine: self.clone(),
        })
    }

    /// Posts a message and waits for its outcome (§4.5, §4.9). Under
    /// [`PostMessageErrorPolicy::Rethrow`] a `Failed` outcome surfaces as
    /// `Err` instead of `Ok(ProcessedMessage::Failed(_))`.
    pub async fn post(&self, msg: Message) -> EngineResult<ProcessedMessage> {
        let (reply, rx) = oneshot::channel();
        self.queue_tx
            .send(QueueItem {
                msg,
                reply: Some(reply),
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let processed = rx.await.map_err(|_| EngineError::ChannelClosed)?;
        if self.config.post_error_policy == PostMessageErrorPolicy::Rethrow {
            if let ProcessedMessage::Failed(f) = &processed {
                return Err(f.error.clone());
            }
        }
        Ok(processed)
    }

    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.streams.transitions.subscribe()
    }

    pub fn processed_messages(&self) -> broadcast::Receiver<ProcessedMessage> {
        self.streams.processed_messages.subscribe()
    }

    pub fn handled_messages(&self) -> broadcast::Receiver<HandledMessage> {
        self.streams.handled_messages.subscribe()
    }

    pub fn failed_messages(&self) -> broadcast::Receiver<FailedMessage> {
        self.streams.failed_messages.subscribe()
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleState> {
        self.streams.lifecycle.subscribe()
    }

    pub fn data_stream<D: Clone + Send + Sync + 'static>(&self, key: &StateKey) -> (Option<D>, broadcast::Receiver<D>) {
        self.streams.subscribe::<D>(key, self.config.broadcast_capacity)
    }
}

/// The actor loop: the sole task that ever touches `EngineState` (§5).
/// `biased` so a pending lifecycle command is always drained before the next
/// queued message starts dispatching, matching "Starting.stop waits for
/// start to finish" — by the time `Command::Stop` is even polled, any
/// in-flight `Command::Start` has already run to completion, since this loop
/// awaits one command fully before looping back to `select!`.
async fn run_actor(mut state: EngineState, mut cmd_rx: mpsc::Receiver<Command>, mut queue_rx: mpsc::Receiver<QueueItem>) {
    loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => handle_command(&mut state, cmd).await,
                    None => break,
                }
            }
            item = queue_rx.recv() => {
                match item {
                    Some(item) => handle_queue_item(&mut state, item).await,
                    None => break,
                }
            }
            else => break,
        }
    }
    debug!("engine actor task exiting");
}

async fn handle_queue_item(state: &mut EngineState, item: QueueItem) {
    if state.lifecycle.is_disposed() {
        reply_disposed(item.reply);
        return;
    }
    let processed = dispatch_message(state, item.msg).await;
    if let ProcessedMessage::Failed(f) = &processed {
        error!(error = %f.error, handling_state = ?f.handling_state, "message handler failed");
    }
    state.streams.publish_processed(processed.clone());
    if let Some(reply) = item.reply {
        let _ = reply.send(processed);
    }
}

fn reply_disposed(reply: Option<oneshot::Sender<ProcessedMessage>>) {
    if let Some(reply) = reply {
        let _ = reply.send(ProcessedMessage::Failed(FailedMessage {
            handling_state: None,
            error: EngineError::Disposed,
        }));
    }
}

async fn handle_command(state: &mut EngineState, cmd: Command) {
    match cmd {
        Command::Start {
            at,
            with_data,
            payload,
            reply,
        } => handle_start(state, at, with_data, payload, reply).await,
        Command::Stop { reply } => {
            let result = do_stop(state).await;
            let _ = reply.send(result);
        }
        Command::Dispose { reply } => {
            do_dispose(state).await;
            let _ = reply.send(());
        }
        Command::SaveTo { reply } => {
            let result = do_save_to(state);
            let _ = reply.send(result);
        }
        Command::LoadFrom { envelope, reply } => handle_load_from(state, envelope, reply).await,
    }
}

async fn handle_start(
    state: &mut EngineState,
    at: Option<StateKey>,
    with_data: DataOverrides,
    payload: Option<Message>,
    reply: oneshot::Sender<EngineResult<CurrentStateInner>>,
) {
    if let Err(e) = state.lifecycle.check_not_disposed() {
        let _ = reply.send(Err(e));
        return;
    }
    if !state.lifecycle.can_start() {
        let _ = reply.send(Err(EngineError::InvalidLifecycle(format!(
            "cannot start from {}",
            state.lifecycle
        ))));
        return;
    }
    let previous = state.lifecycle;
    state.lifecycle = LifecycleState::Starting;
    let _ = state.streams.lifecycle.send(state.lifecycle);
    match do_start(state, at, with_data, payload).await {
        Ok(transition) => {
            state.lifecycle = LifecycleState::Started;
            let _ = state.streams.lifecycle.send(state.lifecycle);
            info!(leaf = %transition.to, "engine started");
            let _ = reply.send(Ok(current_state_inner(state, &transition.to)));
        }
        Err(e) => {
            state.lifecycle = previous;
            let _ = state.streams.lifecycle.send(state.lifecycle);
            warn!(error = %e, "engine start failed");
            let _ = reply.send(Err(e));
        }
    }
}

async fn handle_load_from(state: &mut EngineState, envelope: SnapshotEnvelope, reply: oneshot::Sender<EngineResult<CurrentStateInner>>) {
    if !matches!(state.lifecycle, LifecycleState::Constructed | LifecycleState::Stopped) {
        let _ = reply.send(Err(EngineError::InvalidLifecycle(
            "loadFrom requires the engine to not be started".into(),
        )));
        return;
    }
    match do_load_from(state, envelope).await {
        Ok(transition) => {
            state.lifecycle = LifecycleState::Started;
            let _ = state.streams.lifecycle.send(state.lifecycle);
            info!(leaf = %transition.to, "engine restored from snapshot");
            let _ = reply.send(Ok(current_state_inner(state, &transition.to)));
        }
        Err(e) => {
            warn!(error = %e, "loadFrom failed");
            let _ = reply.send(Err(e));
        }
    }
}

/// Shared by `start` and `loadFrom`: a fresh engine (no prior `current_leaf`)
/// enters from outside the tree entirely, so root itself runs `onEnter`; a
/// restart after `stop` instead walks an ordinary exit/entry path from the
/// reserved stopped leaf, so root (never exited by `stop`) is left alone.
async fn do_start(
    state: &mut EngineState,
    at: Option<StateKey>,
    overrides: DataOverrides,
    payload: Option<Message>,
) -> EngineResult<Transition> {
    let target = match at {
        Some(k) => state.tree.get(&k)?,
        None => state.tree.root.clone(),
    };

    let path = match state.current_leaf.clone() {
        None => {
            let mut entry: Vec<_> = target.self_and_ancestors().collect();
            entry.reverse();
            let root = state.tree.root.clone();
            NodePath {
                from: root.clone(),
                to: target,
                lca: root.clone(),
                exit: Vec::new(),
                entry,
                reenter_target: false,
            }
        }
        Some(leaf_key) => {
            let leaf = state.tree.get(&leaf_key)?;
            compute_path(&leaf, &target, false)?
        }
    };

    run_transition(state, path, None, payload, Metadata::new(), state.tree.root.key.clone(), false, 0, overrides).await
}

async fn do_load_from(state: &mut EngineState, envelope: SnapshotEnvelope) -> EngineResult<Transition> {
    let nodes = resolve_and_validate(&state.tree, &envelope.states)?;
    let mut overrides = DataOverrides::new();
    for (node, entry) in nodes.iter().zip(envelope.states.iter()) {
        if let (Some(spec), Some(value)) = (&node.data, &entry.encoded_state_data) {
            if let Some(codec) = &spec.codec {
                overrides.insert(node.key.clone(), codec.decode_any(value)?);
            }
        }
    }
    let leaf_key = nodes[0].key.clone();
    do_start(state, Some(leaf_key), overrides, None).await
}

async fn do_stop(state: &mut EngineState) -> EngineResult<()> {
    state.lifecycle.check_not_disposed()?;
    if !state.lifecycle.can_stop() {
        return Err(EngineError::InvalidLifecycle(format!(
            "cannot stop from {}",
            state.lifecycle
        )));
    }
    state.lifecycle = LifecycleState::Stopping;
    let _ = state.streams.lifecycle.send(state.lifecycle);
    let leaf_key = state.current_leaf_key()?;
    let leaf = state.tree.get(&leaf_key)?;
    let stopped = state.tree.stopped_leaf();
    let path = compute_path(&leaf, &stopped, false)?;
    run_transition(state, path, None, None, Metadata::new(), leaf_key, false, 0, DataOverrides::new()).await?;
    state.lifecycle = LifecycleState::Stopped;
    let _ = state.streams.lifecycle.send(state.lifecycle);
    info!("engine stopped");
    Ok(())
}

async fn do_dispose(state: &mut EngineState) {
    if state.lifecycle.is_disposed() {
        return;
    }
    state.timers.cancel_everything();
    if let Some(leaf_key) = state.current_leaf.clone() {
        if let Ok(leaf) = state.tree.get(&leaf_key) {
            for node in leaf.self_and_ancestors() {
                if let Some(spec) = &node.data {
                    state.close_data(&node.key, spec.is_void);
                }
            }
        }
    }
    state.lifecycle = LifecycleState::Disposed;
    let _ = state.streams.lifecycle.send(state.lifecycle);
    info!("engine disposed");
}

fn do_save_to(state: &EngineState) -> EngineResult<SnapshotEnvelope> {
    let leaf_key = state.current_leaf_key()?;
    let leaf = state.tree.get(&leaf_key)?;
    let states = leaf
        .self_and_ancestors()
        .map(|node| SnapshotEntry {
            key: node.key.name().to_string(),
            encoded_state_data: state.encode_data(&node.key),
            data_version: DATA_VERSION.to_string(),
        })
        .collect();
    Ok(SnapshotEnvelope {
        version: SNAPSHOT_VERSION.to_string(),
        states,
    })
}

fn current_state_inner(state: &EngineState, leaf_key: &StateKey) -> CurrentStateInner {
    let leaf = state
        .tree
        .get(leaf_key)
        .expect("the leaf a transition just committed to always resolves");
    CurrentStateInner {
        key: leaf_key.clone(),
        active_states: leaf.self_and_ancestors().map(|n| n.key.clone()).collect(),
    }
}
