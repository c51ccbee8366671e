use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::config::EngineConfig;
use crate::context::{MessageContext, TransitionContext};
use crate::engine::{CurrentState, Engine};
use crate::error::EngineResult;
use crate::handler::{ExitHandler, MessageHandler};
use crate::key::DataStateKey;
use crate::lifecycle::LifecycleState;
use crate::message::{Message, MessageResult, QueueItem};
use crate::node::{DataSpec, NodeDef, NodeKind};
use crate::transition::Transition;

/// The value exposed by a state whose body is an entire nested machine
/// (§4.10 "Nested Machine State"). Read through the parent's `DataValue` /
/// `dataStream` machinery like any other data state.
#[derive(Clone)]
pub struct MachineTreeStateData {
    pub engine: Engine,
    pub current: CurrentState,
}

pub type NestedDoneFn =
    Arc<dyn for<'a> Fn(&'a mut MessageContext<'_>, Transition) -> EngineResult<MessageResult> + Send + Sync>;
pub type NestedDisposedFn = Arc<dyn for<'a> Fn(&'a mut MessageContext<'_>) -> EngineResult<MessageResult> + Send + Sync>;

/// Tunables for one nested-machine state (§4.10).
#[derive(Clone)]
pub struct NestedMachineOptions {
    /// Forward every message posted to the parent into the child's current
    /// state, in addition to whatever the parent itself does with it.
    pub forward_messages: bool,
    /// Dispose the child automatically when the parent exits this state.
    pub dispose_on_exit: bool,
    /// Decides whether a child transition counts as "done". Defaults to
    /// landing on a final state.
    pub is_done: Arc<dyn Fn(&Transition) -> bool + Send + Sync>,
}

impl Default for NestedMachineOptions {
    fn default() -> Self {
        Self {
            forward_messages: false,
            dispose_on_exit: true,
            is_done: Arc::new(|t: &Transition| t.is_to_final_state),
        }
    }
}

/// Internal message posted back onto the parent's own queue by the
/// background bridge task watching the child's `transitions`/`lifecycle`
/// streams for the two conditions that matter to the parent (§4.10).
enum NestedSentinel {
    Done(Transition),
    Disposed,
}

/// Builds a leaf node whose body is an entire child state machine. The child
/// is constructed and started the moment this state's data is seeded (i.e.
/// on entry); `on_done`/`on_disposed` typically return `MessageResult::go_to`
/// to leave the nested state once the child finishes.
pub fn nested_machine_node(
    key: DataStateKey<MachineTreeStateData>,
    child_factory: Arc<dyn Fn() -> NodeDef + Send + Sync>,
    child_config: EngineConfig,
    on_done: NestedDoneFn,
    on_disposed: NestedDisposedFn,
    options: NestedMachineOptions,
) -> NodeDef {
    let data_key = key.clone();
    let is_done = options.is_done.clone();

    let data_spec = DataSpec::typed(move |ctx: &TransitionContext<'_>| {
        let child_factory = child_factory.clone();
        let config = child_config.clone();
        let is_done = is_done.clone();
        let queue_tx = ctx.state.queue_tx.clone();
        async move {
            let engine = Engine::new(child_factory(), config).expect("nested machine's child tree definition is valid");
            let current = engine
                .start(crate::engine::StartOptions::new())
                .await
                .expect("nested machine's child failed to start");
            spawn_bridge(engine.clone(), queue_tx, is_done);
            MachineTreeStateData { engine, current }
        }
    });

    NodeDef::new(key.into_key(), NodeKind::Leaf)
        .data(data_spec)
        .on_exit(Arc::new(NestedExit {
            data_key: data_key.clone(),
            dispose_on_exit: options.dispose_on_exit,
        }))
        .on_message(Arc::new(NestedMessages {
            data_key,
            on_done,
            on_disposed,
            forward_messages: options.forward_messages,
        }))
}

fn spawn_bridge(engine: Engine, queue_tx: mpsc::Sender<QueueItem>, is_done: Arc<dyn Fn(&Transition) -> bool + Send + Sync>) {
    let mut transitions_rx = engine.transitions();
    let mut lifecycle_rx = engine.lifecycle();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                res = transitions_rx.recv() => {
                    match res {
                        Ok(transition) => {
                            if is_done(&transition) {
                                let item = QueueItem { msg: Message::new(NestedSentinel::Done(transition)), reply: None };
                                let _ = queue_tx.send(item).await;
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                res = lifecycle_rx.recv() => {
                    match res {
                        Ok(LifecycleState::Disposed) => {
                            let item = QueueItem { msg: Message::new(NestedSentinel::Disposed), reply: None };
                            let _ = queue_tx.send(item).await;
                            break;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });
}

struct NestedExit {
    data_key: DataStateKey<MachineTreeStateData>,
    dispose_on_exit: bool,
}

#[async_trait]
impl ExitHandler for NestedExit {
    async fn on_exit(&self, ctx: &mut TransitionContext<'_>) -> EngineResult<()> {
        if self.dispose_on_exit {
            if let Ok(data) = ctx.data(&self.data_key) {
                data.engine.dispose().await;
            }
        }
        Ok(())
    }
}

struct NestedMessages {
    data_key: DataStateKey<MachineTreeStateData>,
    on_done: NestedDoneFn,
    on_disposed: NestedDisposedFn,
    forward_messages: bool,
}

#[async_trait]
impl MessageHandler for NestedMessages {
    async fn on_message(&self, ctx: &mut MessageContext<'_>, msg: &Message) -> EngineResult<MessageResult> {
        if let Some(sentinel) = msg.downcast_ref::<NestedSentinel>() {
            return match sentinel {
                NestedSentinel::Done(transition) => (self.on_done)(ctx, transition.clone()),
                NestedSentinel::Disposed => (self.on_disposed)(ctx),
            };
        }
        if self.forward_messages {
            if let Ok(data) = ctx.data(&self.data_key) {
                let _ = data.engine.post(msg.clone()).await;
            }
        }
        Ok(MessageResult::Unhandled)
    }
}
