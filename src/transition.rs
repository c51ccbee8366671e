use std::any::Any;
use std::collections::HashMap;

use futures::future::BoxFuture;
use tracing::{trace, trace_span, Instrument};

use crate::context::TransitionContext;
use crate::error::{EngineError, EngineResult};
use crate::filter::{run_enter_chain, run_exit_chain};
use crate::key::StateKey;
use crate::message::{Message, Metadata, TransitionAction};
use crate::node::{NodeKind, TreeNode};
use crate::state::EngineState;

/// Caller-supplied overrides for the `initialData` a redirected or restarted
/// entry path would otherwise compute itself (`start(withData: ...)`,
/// `loadFrom`'s deserialized snapshot values).
pub(crate) type DataOverrides = HashMap<StateKey, Box<dyn Any + Send>>;

/// Immutable record of a completed transition (§3), emitted on the
/// `transitions` stream.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: StateKey,
    pub to: StateKey,
    pub lca: StateKey,
    pub exit_path: Vec<StateKey>,
    pub entry_path: Vec<StateKey>,
    pub metadata: Metadata,
    pub is_to_final_state: bool,
    pub is_redirect: bool,
}

impl Transition {
    pub fn path(&self) -> Vec<StateKey> {
        self.exit_path
            .iter()
            .chain(self.entry_path.iter())
            .cloned()
            .collect()
    }
}

/// The exit/entry node lists for one transition, computed over the tree
/// (§4.4). Kept distinct from the public [`Transition`] record, which only
/// carries keys.
pub(crate) struct NodePath {
    pub from: TreeNode,
    pub to: TreeNode,
    pub lca: TreeNode,
    pub exit: Vec<TreeNode>,
    pub entry: Vec<TreeNode>,
    pub reenter_target: bool,
}

/// Computes the exit/entry node lists between `from` and `to` (§4.4).
pub(crate) fn compute_path(from: &TreeNode, to: &TreeNode, reenter_target: bool) -> EngineResult<NodePath> {
    if reenter_target && to.parent().is_none() {
        return Err(EngineError::InvalidTransition(
            "cannot re-enter the root".into(),
        ));
    }

    let lca = from.lca_with(to);

    if reenter_target && lca.key == to.key {
        let mut exit: Vec<TreeNode> = from.self_and_ancestors().take_while(|n| n.key != lca.key).collect();
        exit.push(to.clone());
        return Ok(NodePath {
            from: from.clone(),
            to: to.clone(),
            lca,
            exit,
            entry: vec![to.clone()],
            reenter_target,
        });
    }

    if reenter_target && from.key == to.key {
        return Ok(NodePath {
            from: from.clone(),
            to: to.clone(),
            lca,
            exit: vec![to.clone()],
            entry: vec![to.clone()],
            reenter_target,
        });
    }

    let exit: Vec<TreeNode> = from.self_and_ancestors().take_while(|n| n.key != lca.key).collect();
    let mut entry: Vec<TreeNode> = to.self_and_ancestors().take_while(|n| n.key != lca.key).collect();
    entry.reverse();

    Ok(NodePath {
        from: from.clone(),
        to: to.clone(),
        lca,
        exit,
        entry,
        reenter_target,
    })
}

/// Path for a self-transition (§4.5 `SelfTransition`): exit from the current
/// leaf up through and including `handling` (the node whose `onMessage`
/// returned `SelfTransition`), then re-enter the exact same chain back down
/// to the original leaf — initial-child selection is bypassed so the leaf is
/// preserved rather than re-picked (§8 scenario S4).
pub(crate) fn self_transition_path(leaf: &TreeNode, handling: &TreeNode) -> EngineResult<NodePath> {
    if handling.parent().is_none() {
        return Err(EngineError::InvalidTransition(
            "cannot self-transition the root".into(),
        ));
    }
    let mut chain: Vec<TreeNode> = leaf
        .self_and_ancestors()
        .take_while(|n| n.key != handling.key)
        .collect();
    chain.push(handling.clone());
    let entry: Vec<TreeNode> = chain.iter().rev().cloned().collect();
    Ok(NodePath {
        from: leaf.clone(),
        to: leaf.clone(),
        lca: handling.clone(),
        exit: chain,
        entry,
        reenter_target: true,
    })
}

/// Enters `node`: seeds its data value (if any), runs `onEnter` through its
/// filter chain, records it in `ctx.entered`. Returns the redirect target if
/// the handler requested one — in that case `node` is treated as never
/// having been entered at all (its seeded data is torn down and it is left
/// out of `ctx.entered`), matching the "never fully entered" contract for
/// the node whose `onEnter` triggers the redirect.
async fn enter_one(
    ctx: &mut TransitionContext<'_>,
    node: &TreeNode,
    overrides: &mut DataOverrides,
) -> EngineResult<Option<StateKey>> {
    if let Some(spec) = &node.data {
        let value = match overrides.remove(&node.key) {
            Some(v) => v,
            None => (spec.initial)(ctx).await,
        };
        ctx.state.seed_data(node.key.clone(), value, spec);
    }
    run_enter_chain(&node.filters, &node.key, node.on_enter.as_deref(), ctx).await?;
    if let Some(target) = ctx.take_redirect() {
        if let Some(spec) = &node.data {
            ctx.state.close_data(&node.key, spec.is_void);
        }
        return Ok(Some(target));
    }
    ctx.entered.push(node.key.clone());
    Ok(None)
}

enum StepOutcome {
    /// A redirect fired while entering `from`; recompute and recurse.
    Redirect {
        from: TreeNode,
        target: StateKey,
        entered: Vec<StateKey>,
        exited: Vec<StateKey>,
        metadata: Metadata,
    },
    /// The path (plus any initial-child descent) completed normally.
    Committed {
        leaf: TreeNode,
        entered: Vec<StateKey>,
        exited: Vec<StateKey>,
        metadata: Metadata,
    },
}

async fn run_exit_action_entry(
    state: &mut EngineState,
    path: &NodePath,
    action: Option<&TransitionAction>,
    payload: Option<Message>,
    metadata: Metadata,
    handling_state: StateKey,
    overrides: &mut DataOverrides,
) -> EngineResult<StepOutcome> {
    let mut ctx = TransitionContext::new(state, handling_state, payload, metadata);

    for node in &path.exit {
        run_exit_chain(&node.filters, &node.key, node.on_exit.as_deref(), &mut ctx).await?;
        ctx.exited.push(node.key.clone());
        ctx.state.timers.cancel_all(&node.key);
        if let Some(spec) = &node.data {
            ctx.state.close_data(&node.key, spec.is_void);
        }
    }

    if let Some(action) = action {
        action(&mut ctx).await?;
    }

    for node in &path.entry {
        if let Some(target) = enter_one(&mut ctx, node, overrides).await? {
            return Ok(StepOutcome::Redirect {
                from: node.clone(),
                target,
                entered: ctx.entered,
                exited: ctx.exited,
                metadata: ctx.metadata,
            });
        }
    }

    let mut current = path.entry.last().cloned().unwrap_or_else(|| path.to.clone());
    loop {
        if !current.kind.is_composite() {
            break;
        }
        let Some(selector) = current.initial_child.clone() else {
            break;
        };
        let child_key = selector(&ctx);
        let child = ctx.state.tree.get(&child_key)?;
        let is_direct_child = child
            .parent()
            .map(|p| p.key == current.key)
            .unwrap_or(false);
        if !is_direct_child {
            return Err(EngineError::InvalidTree(format!(
                "initial-child selector for {:?} returned non-child key {:?}",
                current.key, child_key
            )));
        }
        match enter_one(&mut ctx, &child, overrides).await? {
            Some(target) => {
                return Ok(StepOutcome::Redirect {
                    from: child,
                    target,
                    entered: ctx.entered,
                    exited: ctx.exited,
                    metadata: ctx.metadata,
                });
            }
            None => current = child,
        }
    }

    Ok(StepOutcome::Committed {
        leaf: current,
        entered: ctx.entered,
        exited: ctx.exited,
        metadata: ctx.metadata,
    })
}

/// Runs a full transition: exit chain, action, entry chain, initial-child
/// descent, honoring redirects (§4.7). Boxed because redirects recurse and
/// `async fn` cannot directly call itself.
pub(crate) fn run_transition<'a>(
    state: &'a mut EngineState,
    path: NodePath,
    action: Option<TransitionAction>,
    payload: Option<Message>,
    metadata: Metadata,
    handling_state: StateKey,
    is_redirect: bool,
    redirect_depth: u32,
    mut overrides: DataOverrides,
) -> BoxFuture<'a, EngineResult<Transition>> {
    let span = trace_span!("run_transition", from = %path.from.key, to = %path.to.key, lca = %path.lca.key, is_redirect, redirect_depth);
    Box::pin(
        async move {
            trace!("running transition");
            if is_redirect && redirect_depth > state.config.redirect_limit {
                return Err(EngineError::RedirectError(format!(
                    "redirect limit of {} exceeded",
                    state.config.redirect_limit
                )));
            }

            let original_from = path.from.key.clone();
            let original_lca = path.lca.key.clone();

            let outcome = run_exit_action_entry(
                state,
                &path,
                action.as_ref(),
                payload.clone(),
                metadata.clone(),
                handling_state.clone(),
                &mut overrides,
            )
            .await?;

            match outcome {
                StepOutcome::Redirect {
                    from,
                    target,
                    entered: _,
                    exited: _,
                    metadata: redirect_metadata,
                } => {
                    let target_node = state.tree.get(&target)?;
                    let is_descendant_or_self = from.self_and_descendants().any(|d| d.key == target_node.key);
                    if is_descendant_or_self {
                        return Err(EngineError::RedirectError(format!(
                            "redirect target {:?} is {:?} itself or one of its descendants",
                            target_node.key, from.key
                        )));
                    }
                    // `from` itself never fully entered; the new path starts
                    // from whatever was last actually committed — its parent.
                    let origin = from.parent().unwrap_or(from);
                    let new_path = compute_path(&origin, &target_node, false)?;
                    run_transition(
                        state,
                        new_path,
                        None,
                        payload,
                        redirect_metadata,
                        handling_state,
                        true,
                        redirect_depth + 1,
                        overrides,
                    )
                    .await
                }
                StepOutcome::Committed {
                    leaf,
                    entered,
                    exited,
                    metadata: final_metadata,
                } => {
                    state.current_leaf = Some(leaf.key.clone());
                    let transition = Transition {
                        from: original_from,
                        to: leaf.key.clone(),
                        lca: original_lca,
                        exit_path: exited,
                        entry_path: entered,
                        metadata: final_metadata,
                        is_to_final_state: leaf.kind == NodeKind::FinalLeaf,
                        is_redirect,
                    };
                    let _ = state.streams.transitions.send(transition.clone());
                    Ok(transition)
                }
            }
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod proptests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::compute_path;
    use crate::node::{build_tree, NodeDef, NodeKind, TreeNode};

    /// `R{A{A.1,A.2{A.2.a,A.2.b}}, B{B.1,B.2}, C}` — enough depth and
    /// branching for (from, to) pairs to exercise every shape of lca.
    fn sample_nodes() -> Vec<TreeNode> {
        let a1 = NodeDef::new(crate::key::StateKey::new("A.1"), NodeKind::Leaf);
        let a2a = NodeDef::new(crate::key::StateKey::new("A.2.a"), NodeKind::Leaf);
        let a2b = NodeDef::new(crate::key::StateKey::new("A.2.b"), NodeKind::Leaf);
        let a2 = NodeDef::new(crate::key::StateKey::new("A.2"), NodeKind::Interior)
            .child(a2a)
            .child(a2b)
            .initial_child(Arc::new(|_ctx| crate::key::StateKey::new("A.2.a")));
        let a = NodeDef::new(crate::key::StateKey::new("A"), NodeKind::Interior)
            .child(a1)
            .child(a2)
            .initial_child(Arc::new(|_ctx| crate::key::StateKey::new("A.1")));
        let b1 = NodeDef::new(crate::key::StateKey::new("B.1"), NodeKind::Leaf);
        let b2 = NodeDef::new(crate::key::StateKey::new("B.2"), NodeKind::Leaf);
        let b = NodeDef::new(crate::key::StateKey::new("B"), NodeKind::Interior)
            .child(b1)
            .child(b2)
            .initial_child(Arc::new(|_ctx| crate::key::StateKey::new("B.1")));
        let c = NodeDef::new(crate::key::StateKey::new("C"), NodeKind::Leaf);

        let root = NodeDef::new(crate::key::StateKey::new("R"), NodeKind::Root)
            .child(a)
            .child(b)
            .child(c)
            .initial_child(Arc::new(|_ctx| crate::key::StateKey::new("A")));

        let tree = build_tree(root).expect("sample tree satisfies I1-I7");
        tree.self_and_descendants().collect()
    }

    proptest! {
        /// Property 1 (§8): for every `(from, to)` pair, `exit` and `entry`
        /// are disjoint, `lca` is an ancestor of both endpoints, and no node
        /// in either list falls outside `selfAndAncestors(from) ∪
        /// selfAndAncestors(to)`.
        #[test]
        fn path_algebra_invariants(from_idx in 0usize..10, to_idx in 0usize..10) {
            let nodes = sample_nodes();
            let from = &nodes[from_idx % nodes.len()];
            let to = &nodes[to_idx % nodes.len()];

            let path = compute_path(from, to, false).unwrap();

            let exit_keys: Vec<_> = path.exit.iter().map(|n| n.key.clone()).collect();
            let entry_keys: Vec<_> = path.entry.iter().map(|n| n.key.clone()).collect();
            prop_assert!(exit_keys.iter().all(|k| !entry_keys.contains(k)));

            let from_ancestors: Vec<_> = from.self_and_ancestors().map(|n| n.key.clone()).collect();
            let to_ancestors: Vec<_> = to.self_and_ancestors().map(|n| n.key.clone()).collect();
            prop_assert!(from_ancestors.contains(&path.lca.key));
            prop_assert!(to_ancestors.contains(&path.lca.key));

            let allowed: Vec<_> = from_ancestors.iter().chain(to_ancestors.iter()).cloned().collect();
            for k in exit_keys.iter().chain(entry_keys.iter()) {
                prop_assert!(allowed.contains(k));
            }
        }
    }
}
