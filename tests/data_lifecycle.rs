//! Property 3: between `enter(S)` and `exit(S)`, a data state's value is
//! `Holding`; once exited, reads of it raise `UseAfterClose`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hsm_engine::prelude::*;

fn counter_key() -> DataStateKey<u32> {
    DataStateKey::<u32>::new("Counting")
}

struct Advance;

#[async_trait]
impl MessageHandler for Advance {
    async fn on_message(&self, _ctx: &mut MessageContext<'_>, _msg: &Message) -> EngineResult<MessageResult> {
        Ok(MessageResult::go_to(StateKey::new("Idle")))
    }
}

struct CaptureStaleRead {
    key: DataStateKey<u32>,
    captured: Arc<Mutex<Option<EngineResult<u32>>>>,
}

#[async_trait]
impl EnterHandler for CaptureStaleRead {
    async fn on_enter(&self, ctx: &mut TransitionContext<'_>) -> EngineResult<()> {
        *self.captured.lock().unwrap() = Some(ctx.data(&self.key));
        Ok(())
    }
}

fn build_tree(captured: Arc<Mutex<Option<EngineResult<u32>>>>) -> NodeDef {
    let counting = NodeDef::new(counter_key().into_key(), NodeKind::Leaf)
        .data(DataSpec::typed(|_ctx: &TransitionContext<'_>| async { 7u32 }))
        .on_message(Arc::new(Advance));
    let idle = NodeDef::new(StateKey::new("Idle"), NodeKind::Leaf).on_enter(Arc::new(CaptureStaleRead {
        key: counter_key(),
        captured,
    }));

    NodeDef::new(StateKey::new("R"), NodeKind::Root)
        .child(counting)
        .child(idle)
        .initial_child(Arc::new(|_ctx| StateKey::new("Counting")))
}

#[tokio::test]
async fn data_value_is_use_after_close_once_the_owning_state_exits() {
    let captured = Arc::new(Mutex::new(None));
    let tree = build_tree(captured.clone());
    let engine = Engine::new(tree, EngineConfig::default()).unwrap();

    let current = engine.start(StartOptions::new()).await.unwrap();
    let (value, _rx) = current.data_stream::<u32>(Some(&counter_key().into_key())).unwrap();
    assert_eq!(value, Some(7));

    engine.post(Message::new(())).await.unwrap();

    let result = captured.lock().unwrap().take().expect("Idle's onEnter always runs");
    assert!(matches!(result, Err(EngineError::UseAfterClose)));
}
