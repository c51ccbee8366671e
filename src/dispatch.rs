use std::collections::HashMap;

use tracing::{instrument, trace};

use crate::context::MessageContext;
use crate::filter::run_message_chain;
use crate::key::StateKey;
use crate::lifecycle::LifecycleState;
use crate::message::{
    FailedMessage, HandledMessage, Message, Metadata, MessageResult, ProcessedMessage, TransitionAction, UnhandledMessage,
};
use crate::node::{NodeKind, TreeNode};
use crate::scheduler::is_stop_message;
use crate::state::EngineState;
use crate::transition::{compute_path, run_transition, self_transition_path, NodePath};

/// Dispatches one posted message (§4.5): bubbles `onMessage` from the
/// current leaf up through ancestors, interprets the result, and runs
/// whatever transition it implies.
#[instrument(level = "trace", skip(state, msg))]
pub(crate) async fn dispatch_message(state: &mut EngineState, msg: Message) -> ProcessedMessage {
    let leaf_key = match state.current_leaf_key() {
        Ok(k) => k,
        Err(e) => {
            return ProcessedMessage::Failed(FailedMessage {
                handling_state: None,
                error: e,
            })
        }
    };
    let leaf = match state.tree.get(&leaf_key) {
        Ok(n) => n,
        Err(e) => {
            return ProcessedMessage::Failed(FailedMessage {
                handling_state: None,
                error: e,
            })
        }
    };

    if leaf.kind == NodeKind::FinalLeaf {
        return ProcessedMessage::Unhandled(UnhandledMessage {
            notified_states: Vec::new(),
        });
    }

    if is_stop_message(&msg) {
        return handle_stop(state, &leaf, Vec::new()).await;
    }

    let mut notified = Vec::new();
    let mut node = leaf.clone();
    loop {
        trace!(state = %node.key, "bubbling message to onMessage");
        notified.push(node.key.clone());
        let mut ctx = MessageContext::new(&mut *state, node.key.clone());
        let result = run_message_chain(&node.filters, &node.key, node.on_message.as_deref(), &mut ctx, &msg).await;
        match result {
            Err(e) => {
                return ProcessedMessage::Failed(FailedMessage {
                    handling_state: Some(node.key.clone()),
                    error: e,
                });
            }
            Ok(MessageResult::Unhandled) => match node.parent() {
                Some(parent) => node = parent,
                None => {
                    return ProcessedMessage::Unhandled(UnhandledMessage {
                        notified_states: notified,
                    })
                }
            },
            Ok(result) => return interpret_result(state, &leaf, &node, notified, result).await,
        }
    }
}

async fn interpret_result(
    state: &mut EngineState,
    leaf: &TreeNode,
    handling: &TreeNode,
    notified: Vec<StateKey>,
    result: MessageResult,
) -> ProcessedMessage {
    match result {
        MessageResult::GoTo {
            target,
            action,
            payload,
            reenter,
            metadata,
        } => {
            if target == leaf.key && !reenter {
                return ProcessedMessage::Handled(HandledMessage {
                    handling_state: handling.key.clone(),
                    notified_states: notified,
                    transition: None,
                });
            }
            let target_node = match state.tree.get(&target) {
                Ok(n) => n,
                Err(e) => {
                    return ProcessedMessage::Failed(FailedMessage {
                        handling_state: Some(handling.key.clone()),
                        error: e,
                    })
                }
            };
            let path = match compute_path(leaf, &target_node, reenter) {
                Ok(p) => p,
                Err(e) => {
                    return ProcessedMessage::Failed(FailedMessage {
                        handling_state: Some(handling.key.clone()),
                        error: e,
                    })
                }
            };
            run_and_report(state, path, action, payload, metadata, handling.key.clone(), notified).await
        }
        MessageResult::Internal => ProcessedMessage::Handled(HandledMessage {
            handling_state: handling.key.clone(),
            notified_states: notified,
            transition: None,
        }),
        MessageResult::SelfTransition { action } => {
            let path = match self_transition_path(leaf, handling) {
                Ok(p) => p,
                Err(e) => {
                    return ProcessedMessage::Failed(FailedMessage {
                        handling_state: Some(handling.key.clone()),
                        error: e,
                    })
                }
            };
            run_and_report(
                state,
                path,
                action,
                None,
                Metadata::new(),
                handling.key.clone(),
                notified,
            )
            .await
        }
        MessageResult::Stop => handle_stop(state, leaf, notified).await,
        MessageResult::Unhandled => unreachable!("Unhandled is consumed by the bubble loop"),
    }
}

async fn run_and_report(
    state: &mut EngineState,
    path: NodePath,
    action: Option<TransitionAction>,
    payload: Option<Message>,
    metadata: Metadata,
    handling_state: StateKey,
    notified: Vec<StateKey>,
) -> ProcessedMessage {
    match run_transition(state, path, action, payload, metadata, handling_state.clone(), false, 0, HashMap::new()).await {
        Ok(transition) => ProcessedMessage::Handled(HandledMessage {
            handling_state,
            notified_states: notified,
            transition: Some(transition),
        }),
        Err(e) => ProcessedMessage::Failed(FailedMessage {
            handling_state: Some(handling_state),
            error: e,
        }),
    }
}

async fn handle_stop(state: &mut EngineState, leaf: &TreeNode, notified: Vec<StateKey>) -> ProcessedMessage {
    let stopped = state.tree.stopped_leaf();
    let path = match compute_path(leaf, &stopped, false) {
        Ok(p) => p,
        Err(e) => {
            return ProcessedMessage::Failed(FailedMessage {
                handling_state: Some(leaf.key.clone()),
                error: e,
            })
        }
    };
    let outcome = run_and_report(state, path, None, None, Metadata::new(), leaf.key.clone(), notified).await;
    if matches!(outcome, ProcessedMessage::Handled(_)) {
        state.lifecycle = LifecycleState::Stopped;
    }
    outcome
}
