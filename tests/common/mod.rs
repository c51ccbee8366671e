//! Shared fixture for the scenario tests in `tests/scenarios.rs`: the tree
//! from the end-to-end examples, `R{A{A.a{A.a.1,A.a.2}}, B{B.1,B.2}}` with
//! `R.initial=A, A.initial=A.a, A.a.initial=A.a.2, B.initial=B.1`. The
//! reserved stopped leaf is injected by `Engine::new` itself.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hsm_engine::prelude::*;

pub struct GoTo(pub StateKey);

#[async_trait]
impl MessageHandler for GoTo {
    async fn on_message(&self, _ctx: &mut MessageContext<'_>, _msg: &Message) -> EngineResult<MessageResult> {
        Ok(MessageResult::go_to(self.0.clone()))
    }
}

pub struct Reenter(pub StateKey);

#[async_trait]
impl MessageHandler for Reenter {
    async fn on_message(&self, _ctx: &mut MessageContext<'_>, _msg: &Message) -> EngineResult<MessageResult> {
        Ok(MessageResult::reenter(self.0.clone()))
    }
}

pub struct GoToSelfHandler;

#[async_trait]
impl MessageHandler for GoToSelfHandler {
    async fn on_message(&self, _ctx: &mut MessageContext<'_>, _msg: &Message) -> EngineResult<MessageResult> {
        Ok(MessageResult::self_transition())
    }
}

pub struct RedirectOnEnter(pub StateKey);

#[async_trait]
impl EnterHandler for RedirectOnEnter {
    async fn on_enter(&self, ctx: &mut TransitionContext<'_>) -> EngineResult<()> {
        ctx.redirect_to(self.0.clone());
        Ok(())
    }
}

pub struct FlagOnExit(pub Arc<std::sync::atomic::AtomicBool>);

#[async_trait]
impl ExitHandler for FlagOnExit {
    async fn on_exit(&self, _ctx: &mut TransitionContext<'_>) -> EngineResult<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct Hooks {
    pub a_a_1_on_message: Option<Arc<dyn MessageHandler>>,
    pub a_on_message: Option<Arc<dyn MessageHandler>>,
    pub b2_on_message: Option<Arc<dyn MessageHandler>>,
    pub b_on_enter: Option<Arc<dyn EnterHandler>>,
    pub b1_on_enter: Option<Arc<dyn EnterHandler>>,
    pub b1_on_exit: Option<Arc<dyn ExitHandler>>,
}

pub fn b2_key() -> DataStateKey<u32> {
    DataStateKey::<u32>::new("B.2")
}

/// Builds the example tree. `b2_counter` is shared with the caller so tests
/// can observe how many times `B.2`'s data has been (re)seeded.
pub fn build_tree(hooks: Hooks, b2_counter: Arc<AtomicU32>) -> NodeDef {
    let mut a_a_1 = NodeDef::new(StateKey::new("A.a.1"), NodeKind::Leaf);
    if let Some(h) = hooks.a_a_1_on_message {
        a_a_1 = a_a_1.on_message(h);
    }
    let a_a_2 = NodeDef::new(StateKey::new("A.a.2"), NodeKind::Leaf);
    let a_a = NodeDef::new(StateKey::new("A.a"), NodeKind::Interior)
        .child(a_a_1)
        .child(a_a_2)
        .initial_child(Arc::new(|_ctx| StateKey::new("A.a.2")));
    let mut a = NodeDef::new(StateKey::new("A"), NodeKind::Interior)
        .child(a_a)
        .initial_child(Arc::new(|_ctx| StateKey::new("A.a")));
    if let Some(h) = hooks.a_on_message {
        a = a.on_message(h);
    }

    let mut b1 = NodeDef::new(StateKey::new("B.1"), NodeKind::Leaf);
    if let Some(h) = hooks.b1_on_enter {
        b1 = b1.on_enter(h);
    }
    if let Some(h) = hooks.b1_on_exit {
        b1 = b1.on_exit(h);
    }

    let mut b2 = NodeDef::new(b2_key().into_key(), NodeKind::Leaf).data(DataSpec::typed(move |_ctx: &TransitionContext<'_>| {
        let counter = b2_counter.clone();
        async move { counter.fetch_add(1, Ordering::SeqCst) }
    }));
    if let Some(h) = hooks.b2_on_message {
        b2 = b2.on_message(h);
    }

    let mut b = NodeDef::new(StateKey::new("B"), NodeKind::Interior)
        .child(b1)
        .child(b2)
        .initial_child(Arc::new(|_ctx| StateKey::new("B.1")));
    if let Some(h) = hooks.b_on_enter {
        b = b.on_enter(h);
    }

    NodeDef::new(StateKey::new("R"), NodeKind::Root)
        .child(a)
        .child(b)
        .initial_child(Arc::new(|_ctx| StateKey::new("A")))
}
